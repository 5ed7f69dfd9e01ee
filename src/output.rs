//! Saving named outputs of a step.
//!
//! Every save goes through the same sequence as an engine artifact: resolve
//! the location, ask the overwrite policy, write, then record a sidecar next
//! to the file (`<file>.json`). The typed `save_*` helpers only fix the writer
//! and the default suffix and extension.

use std::fmt::Write as _;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::dataset::Coords;
use crate::error::OutputError;
use crate::overwrite::{Decision, OverwritePolicy};
use crate::path::{ArtifactId, normalize_extension, normalize_path};
use crate::provenance::{Extras, Performance, Recorder, SidecarStyle, StepInfo, to_pretty_json};
use crate::registry::OutputRegistry;

/// Where and how an output is stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub coords: Coords,
    /// `<dir>/<name>[_<suffix>]<ext>` instead of the hierarchical layout.
    pub flat: bool,
    pub datatype: Option<String>,
    pub suffix: Option<String>,
    pub extension: Option<String>,
    pub directory: Option<Utf8PathBuf>,
    /// Compared against in `ifnewer` mode.
    pub source: Option<Utf8PathBuf>,
    pub metadata: Map<String, Value>,
}

impl Target {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(coords: Coords) -> Self {
        Self {
            coords,
            ..Self::default()
        }
    }

    pub fn flat() -> Self {
        Self {
            flat: true,
            ..Self::default()
        }
    }

    pub fn datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Some(datatype.into());
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn directory(mut self, directory: impl Into<Utf8PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn source(mut self, source: impl Into<Utf8PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }
}

/// Result of a save call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Saved {
    pub path: Utf8PathBuf,
    /// `false` when an existing file was kept.
    pub written: bool,
}

/// Tabular data written as CSV or TSV.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, row: impl IntoIterator<Item = Value>) -> Self {
        self.rows.push(row.into_iter().collect());
        self
    }

    fn render(&self, separator: char) -> String {
        let cell = |value: &Value| {
            let text = match value {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if separator == ',' && text.contains([',', '"', '\n']) {
                format!("\"{}\"", text.replace('"', "\"\""))
            } else {
                text
            }
        };

        let mut out = String::new();
        let sep = separator.to_string();
        out.push_str(&self.columns.join(&sep));
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(cell).collect();
            out.push_str(&cells.join(&sep));
            out.push('\n');
        }
        out
    }
}

/// Saves the named outputs of one step.
#[derive(Debug, Clone)]
pub struct OutputManager {
    config: Arc<Config>,
    step: StepInfo,
    registry: Arc<OutputRegistry>,
    policy: OverwritePolicy,
    recorder: Recorder,
}

impl OutputManager {
    pub fn new(config: Arc<Config>, unit_id: impl Into<String>, description: impl Into<String>) -> Self {
        let step = StepInfo::new(unit_id, description);
        Self {
            registry: Arc::new(OutputRegistry::new(&step.id)),
            policy: config.policy(),
            recorder: config.recorder(),
            config,
            step,
        }
    }

    /// Uses the descriptors of `registry` for default suffixes, extensions
    /// and existence checks.
    pub fn with_registry(mut self, registry: Arc<OutputRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_policy(mut self, policy: OverwritePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn unit_id(&self) -> &str {
        &self.step.id
    }

    /// Whether output `name` is selected for this run.
    pub fn should_generate(&self, name: &str) -> bool {
        self.registry.should_generate(name, &self.config.selection())
    }

    /// `name` prefixed with the step id, unless it already starts with it.
    pub fn prefixed_name(&self, name: &str) -> String {
        if name.starts_with(&self.step.id) {
            name.to_string()
        } else {
            format!("{}_{name}", self.step.id)
        }
    }

    /// Location output `name` is saved to.
    pub fn output_path(&self, name: &str, target: &Target) -> Utf8PathBuf {
        self.resolve(name, target, None, None)
    }

    fn resolve(
        &self,
        name: &str,
        target: &Target,
        default_suffix: Option<&str>,
        default_extension: Option<&str>,
    ) -> Utf8PathBuf {
        let descriptor = self.registry.get(name);
        let prefixed = self.prefixed_name(name);

        let suffix = target
            .suffix
            .as_deref()
            .or(descriptor.and_then(|d| d.suffix.as_deref()))
            .or(default_suffix)
            .unwrap_or_default();
        let extension = target
            .extension
            .as_deref()
            .or(descriptor.and_then(|d| d.extension.as_deref()))
            .or(default_extension)
            .unwrap_or_default();

        let root = match &target.directory {
            Some(dir) => normalize_path(dir),
            None => self.config.output_root().to_owned(),
        };

        if target.flat {
            let mut file_name = prefixed;
            if !suffix.is_empty() {
                file_name.push('_');
                file_name.push_str(suffix);
            }
            file_name.push_str(&normalize_extension(extension));
            return root.join(file_name);
        }

        let datatype = target.datatype.as_deref().unwrap_or(&self.config.datatype);

        ArtifactId::new(root, target.coords.clone())
            .description(prefixed)
            .datatype(datatype)
            .suffix(suffix)
            .extension(extension)
            .acquisition(self.config.acquisition.clone())
            .path()
    }

    /// Saves `payload` as output `name` through `serializer`.
    pub fn save<P, F>(&self, payload: &P, serializer: F, name: &str, target: Target) -> Result<Saved, OutputError>
    where
        P: ?Sized,
        F: FnOnce(&Utf8Path, &P) -> anyhow::Result<()>,
    {
        self.save_with(payload, serializer, name, target, None, None)
    }

    fn save_with<P, F>(
        &self,
        payload: &P,
        serializer: F,
        name: &str,
        target: Target,
        default_suffix: Option<&str>,
        default_extension: Option<&str>,
    ) -> Result<Saved, OutputError>
    where
        P: ?Sized,
        F: FnOnce(&Utf8Path, &P) -> anyhow::Result<()>,
    {
        let path = self.resolve(name, &target, default_suffix, default_extension);

        let policy = match self.registry.get(name).and_then(|d| d.existence_check.clone()) {
            Some(mode) => self.policy.clone().with_mode(mode),
            None => self.policy.clone(),
        };

        if policy.decide(&path, target.source.as_deref())? == Decision::SkipExisting {
            return Ok(Saved { path, written: false });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OutputError::Io(parent.to_owned(), e))?;
        }

        let s = Instant::now();
        serializer(&path, payload).map_err(|e| OutputError::Serialize(path.clone(), e))?;
        let duration = s.elapsed();

        tracing::info!("Saved {path}");

        let performance = Performance {
            duration: self.config.output_profiling.then_some(duration),
            size_bytes: fs::metadata(&path).ok().map(|meta| meta.len()).filter(|&len| len > 0),
        };
        let extras = Extras::new().custom(target.metadata).performance(performance);

        self.recorder.record(&path, &self.step, &extras, SidecarStyle::Append)?;

        Ok(Saved { path, written: true })
    }

    /// Saves a table as `csv` or `tsv`.
    pub fn save_table(&self, table: &Table, name: &str, format: &str, target: Target) -> Result<Saved, OutputError> {
        let separator = match format {
            "csv" => ',',
            "tsv" => '\t',
            other => {
                return Err(OutputError::Format {
                    format: other.to_string(),
                    supported: "csv, tsv",
                });
            }
        };
        let extension = format!(".{format}");

        self.save_with(
            table,
            |path, table: &Table| Ok(fs::write(path, table.render(separator))?),
            name,
            target,
            Some("table"),
            Some(&extension),
        )
    }

    /// Saves an already rendered figure. The format defaults to `pdf`.
    pub fn save_figure(
        &self,
        figure: &[u8],
        name: &str,
        format: Option<&str>,
        target: Target,
    ) -> Result<Saved, OutputError> {
        let extension = format!(".{}", format.unwrap_or("pdf").trim_start_matches('.'));

        self.save_with(
            figure,
            |path, bytes: &[u8]| Ok(fs::write(path, bytes)?),
            name,
            target,
            Some("plot"),
            Some(&extension),
        )
    }

    /// Saves a row-major array of `f64` with the given shape, as `npy` or as
    /// whitespace separated `txt` (one or two dimensions only).
    pub fn save_array(
        &self,
        data: &[f64],
        shape: &[usize],
        name: &str,
        format: &str,
        target: Target,
    ) -> Result<Saved, OutputError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(OutputError::Shape {
                len: data.len(),
                shape: shape.to_vec(),
            });
        }

        let bytes = match format {
            "npy" => encode_npy(data, shape)?,
            "txt" if shape.len() <= 2 => encode_txt(data, shape).into_bytes(),
            other => {
                return Err(OutputError::Format {
                    format: other.to_string(),
                    supported: "npy, txt (1-2 dimensions)",
                });
            }
        };
        let extension = format!(".{format}");

        self.save_with(
            bytes.as_slice(),
            |path, bytes: &[u8]| Ok(fs::write(path, bytes)?),
            name,
            target,
            Some("array"),
            Some(&extension),
        )
    }

    /// Saves any serializable value as JSON.
    pub fn save_json<T: Serialize + ?Sized>(&self, data: &T, name: &str, target: Target) -> Result<Saved, OutputError> {
        let bytes = to_pretty_json(data)?;

        self.save_with(
            bytes.as_slice(),
            |path, bytes: &[u8]| Ok(fs::write(path, bytes)?),
            name,
            target,
            Some("data"),
            Some(".json"),
        )
    }

    pub fn save_text(&self, text: &str, name: &str, target: Target) -> Result<Saved, OutputError> {
        self.save_with(
            text,
            |path, text: &str| Ok(fs::write(path, text)?),
            name,
            target,
            Some("log"),
            Some(".txt"),
        )
    }
}

/// NumPy `.npy` version 1.0, little endian `f64`. Fails when the header
/// outgrows the 16-bit length field of that version.
fn encode_npy(data: &[f64], shape: &[usize]) -> Result<Vec<u8>, OutputError> {
    let dims = match shape {
        [n] => format!("({n},)"),
        dims => format!(
            "({})",
            dims.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!("{{'descr': '<f8', 'fortran_order': False, 'shape': {dims}, }}");

    // magic (6) + version (2) + header length (2), then padded to 64 bytes
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let header_len = u16::try_from(header.len()).map_err(|_| OutputError::Shape {
        len: data.len(),
        shape: shape.to_vec(),
    })?;

    let mut out = Vec::with_capacity(10 + header.len() + data.len() * 8);
    out.extend_from_slice(b"\x93NUMPY\x01\x00");
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for value in data {
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

fn encode_txt(data: &[f64], shape: &[usize]) -> String {
    let width = match shape {
        [_, cols] => (*cols).max(1),
        _ => 1,
    };

    let mut out = String::new();
    for row in data.chunks(width) {
        let line: Vec<String> = row.iter().map(|v| format!("{v:.18e}")).collect();
        let _ = writeln!(out, "{}", line.join(" "));
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::overwrite::OverwriteMode;
    use crate::registry::OutputDescriptor;

    struct Scratch {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    fn scratch() -> Scratch {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        Scratch { _dir: dir, root }
    }

    fn manager(root: &Utf8Path, mode: OverwriteMode) -> OutputManager {
        let config = Config::default()
            .with_deriv_root(root)
            .with_overwrite_mode(mode)
            .with_auto_response("default")
            .with_version("test");
        OutputManager::new(Arc::new(config), "01", "Filtering")
    }

    #[test]
    fn test_output_paths() {
        let manager = manager(Utf8Path::new("/out"), OverwriteMode::Never);

        let bids = manager.output_path("psd", &Target::at(Coords::new("01", "02", "rest", "1")).suffix("plot").extension("png"));
        assert_eq!(bids, "/out/sub-01/ses-02/eeg/sub-01_ses-02_task-rest_run-1_desc-01_psd_plot.png");

        let flat = manager.output_path("01_summary", &Target::flat().suffix("table").extension(".csv"));
        assert_eq!(flat, "/out/01_summary_table.csv");

        let custom = manager.output_path("log", &Target::flat().directory("/tmp/x/../logs"));
        assert_eq!(custom, "/tmp/logs/01_log");

        let no_coords = manager.output_path("psd", &Target::new().suffix("plot").extension(".pdf"));
        assert_eq!(no_coords, "/out/eeg/desc-01_psd_plot.pdf");
    }

    #[test]
    fn test_save_writes_file_and_sidecar() {
        let tmp = scratch();
        let manager = manager(&tmp.root, OverwriteMode::Never);

        let saved = manager
            .save_text("hello", "notes", Target::flat().metadata(json!({"Rows": 1}).as_object().unwrap().clone()))
            .unwrap();
        assert!(saved.written);
        assert_eq!(saved.path, tmp.root.join("01_notes_log.txt"));
        assert_eq!(fs::read_to_string(&saved.path).unwrap(), "hello");

        let sidecar: Value =
            serde_json::from_str(&fs::read_to_string(tmp.root.join("01_notes_log.txt.json")).unwrap()).unwrap();
        assert_eq!(sidecar["Pipeline"]["Step"], "01");
        assert_eq!(sidecar["Pipeline"]["StepDescription"], "Filtering");
        assert_eq!(sidecar["Pipeline"]["OutputFile"], "01_notes_log.txt");
        assert_eq!(sidecar["Rows"], 1);
        assert_eq!(sidecar["Performance"], json!({ "FileSizeBytes": 5 }));

        let again = manager.save_text("changed", "notes", Target::flat()).unwrap();
        assert!(!again.written);
        assert_eq!(fs::read_to_string(&again.path).unwrap(), "hello");
    }

    #[test]
    fn test_descriptor_defaults_and_existence_check() {
        let tmp = scratch();
        let mut registry = OutputRegistry::new("01");
        registry
            .register(
                OutputDescriptor::new("report")
                    .suffix("summary")
                    .extension(".md")
                    .existence_check(OverwriteMode::Always),
            )
            .unwrap();
        let manager = manager(&tmp.root, OverwriteMode::Never).with_registry(Arc::new(registry));

        let first = manager.save_text("a", "report", Target::flat()).unwrap();
        assert_eq!(first.path, tmp.root.join("01_report_summary.md"));
        let second = manager.save_text("b", "report", Target::flat()).unwrap();
        assert!(second.written);
        assert_eq!(fs::read_to_string(&second.path).unwrap(), "b");
    }

    #[test]
    fn test_save_table() {
        let tmp = scratch();
        let manager = manager(&tmp.root, OverwriteMode::Always);
        let table = Table::new(["channel", "note"])
            .row([json!("Fz"), json!("noisy, drifting")])
            .row([json!("Cz"), Value::Null]);

        let saved = manager.save_table(&table, "bads", "csv", Target::flat()).unwrap();
        assert_eq!(
            fs::read_to_string(&saved.path).unwrap(),
            "channel,note\nFz,\"noisy, drifting\"\nCz,\n"
        );

        let err = manager.save_table(&table, "bads", "xlsx", Target::flat()).unwrap_err();
        assert!(matches!(err, OutputError::Format { .. }));
    }

    #[test]
    fn test_npy_header_is_aligned() {
        let bytes = encode_npy(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes.len(), 10 + header_len + 6 * 8);
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.contains("'shape': (2, 3)"));
        assert!(header.ends_with('\n'));
        assert!(encode_npy(&[1.0], &[1]).unwrap().windows(4).any(|w| w == b"(1,)"));
    }

    #[test]
    fn test_npy_header_overflow_is_an_error() {
        let shape = vec![1; 30_000];
        let err = encode_npy(&[1.0], &shape).unwrap_err();
        assert!(matches!(err, OutputError::Shape { len: 1, .. }));
    }

    #[test]
    fn test_save_array_rejects_bad_shape() {
        let tmp = scratch();
        let manager = manager(&tmp.root, OverwriteMode::Always);
        let err = manager.save_array(&[1.0, 2.0], &[3], "x", "npy", Target::flat()).unwrap_err();
        assert!(matches!(err, OutputError::Shape { len: 2, .. }));

        let saved = manager.save_array(&[1.0, 2.0], &[2], "x", "txt", Target::flat()).unwrap();
        let text = fs::read_to_string(saved.path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_profiling_adds_performance_block() {
        let tmp = scratch();
        let mut config = Config::default().with_deriv_root(&tmp.root).with_version("test");
        config.output_profiling = true;
        let manager = OutputManager::new(Arc::new(config), "02", "Stats");

        let saved = manager.save_json(&json!({"mean": 1.5}), "stats", Target::flat()).unwrap();
        assert_eq!(saved.path, tmp.root.join("02_stats_data.json"));

        let sidecar: Value =
            serde_json::from_str(&fs::read_to_string(tmp.root.join("02_stats_data.json.json")).unwrap()).unwrap();
        assert!(sidecar["Performance"]["Duration"].as_str().unwrap().ends_with('s'));
        assert!(sidecar["Performance"]["FileSizeBytes"].as_u64().unwrap() > 0);

        let means: &[f64] = &[1.5, 2.5];
        let saved = manager.save_json(means, "means", Target::flat()).unwrap();
        assert_eq!(fs::read_to_string(saved.path).unwrap(), "[\n    1.5,\n    2.5\n]");
    }
}
