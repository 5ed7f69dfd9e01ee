//! JSON sidecars recording how each artifact was produced.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::OutputError;

/// Key of the block owned by the pipeline.
pub const PIPELINE_KEY: &str = "Pipeline";

/// Identity of the step producing an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepInfo {
    pub id: String,
    pub description: String,
}

impl StepInfo {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// The `Performance` block. Timing is only filled in when output profiling
/// is enabled, the size of a non-empty file always is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Performance {
    pub duration: Option<Duration>,
    pub size_bytes: Option<u64>,
}

impl Performance {
    fn is_empty(&self) -> bool {
        self.duration.is_none() && self.size_bytes.is_none()
    }
}

/// Per-artifact fields on top of the step identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extras {
    pub source: Option<String>,
    pub duration: Option<Duration>,
    pub performance: Option<Performance>,
    pub custom: Map<String, Value>,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn performance(mut self, performance: Performance) -> Self {
        self.performance = Some(performance);
        self
    }

    pub fn custom(mut self, custom: Map<String, Value>) -> Self {
        self.custom = custom;
        self
    }

    /// Adds a single custom field, serialized with serde.
    pub fn field(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self, serde_json::Error> {
        self.custom.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }
}

/// Where a sidecar is placed relative to its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarStyle {
    /// `x_eeg.fif` → `x_eeg.json`, falling back to `Append` for JSON
    /// artifacts.
    Replace,
    /// `x_plot.png` → `x_plot.png.json`
    Append,
}

impl SidecarStyle {
    pub fn sidecar_for(self, target: &Utf8Path) -> Utf8PathBuf {
        match self {
            SidecarStyle::Replace if target.extension() != Some("json") => target.with_extension("json"),
            SidecarStyle::Replace | SidecarStyle::Append => Utf8PathBuf::from(format!("{target}.json")),
        }
    }
}

/// Writes sidecar documents.
#[derive(Debug, Clone)]
pub struct Recorder {
    pub version: String,
    pub n_jobs: usize,
    pub enabled: bool,
}

impl Recorder {
    pub fn new(version: impl Into<String>, n_jobs: usize) -> Self {
        Self {
            version: version.into(),
            n_jobs,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builds the sidecar document for `target`.
    ///
    /// Custom fields are merged at the top level. A custom `Pipeline` object
    /// can only add keys the pipeline block doesn't define.
    pub fn document(&self, target: &Utf8Path, step: &StepInfo, extras: &Extras) -> Map<String, Value> {
        let mut pipeline = Map::new();
        pipeline.insert("Version".into(), json!(self.version));
        pipeline.insert("Step".into(), json!(step.id));
        pipeline.insert("StepDescription".into(), json!(step.description));
        pipeline.insert("OutputFile".into(), json!(file_name(target)));
        if let Some(source) = &extras.source {
            pipeline.insert("SourceFile".into(), json!(source));
        }
        if let Some(duration) = extras.duration {
            pipeline.insert("Duration".into(), json!(duration.as_secs_f64()));
        }
        pipeline.insert("NJobs".into(), json!(self.n_jobs));
        pipeline.insert("GeneratedAt".into(), json!(chrono::Local::now().to_rfc3339()));

        let mut document = Map::new();

        for (key, value) in &extras.custom {
            if key != PIPELINE_KEY {
                document.insert(key.clone(), value.clone());
                continue;
            }

            match value {
                Value::Object(custom) => {
                    for (field, value) in custom {
                        if pipeline.contains_key(field) {
                            tracing::warn!(
                                "Custom field '{PIPELINE_KEY}.{field}' conflicts with a pipeline field and was dropped"
                            );
                        } else {
                            pipeline.insert(field.clone(), value.clone());
                        }
                    }
                }
                _ => tracing::warn!("Custom field '{PIPELINE_KEY}' must be an object and was dropped"),
            }
        }

        document.insert(PIPELINE_KEY.into(), Value::Object(pipeline));

        if let Some(performance) = extras.performance
            && !performance.is_empty()
        {
            let mut block = Map::new();
            if let Some(duration) = performance.duration {
                block.insert("Duration".into(), json!(format!("{:.3}s", duration.as_secs_f64())));
                block.insert("Timestamp".into(), json!(chrono::Local::now().to_rfc3339()));
            }
            if let Some(size) = performance.size_bytes {
                block.insert("FileSizeBytes".into(), json!(size));
            }
            document.insert("Performance".into(), Value::Object(block));
        }

        document
    }

    /// Writes the sidecar for `target` and returns its location. Top-level
    /// keys of an existing sidecar that this document doesn't set are kept.
    ///
    /// When the recorder is disabled nothing is written and the would-be
    /// location is returned.
    pub fn record(
        &self,
        target: &Utf8Path,
        step: &StepInfo,
        extras: &Extras,
        style: SidecarStyle,
    ) -> Result<Utf8PathBuf, OutputError> {
        let sidecar = style.sidecar_for(target);
        if !self.enabled {
            return Ok(sidecar);
        }

        let mut merged = read_existing(&sidecar);
        merged.extend(self.document(target, step, extras));

        if let Some(parent) = sidecar.parent() {
            fs::create_dir_all(parent).map_err(|e| OutputError::Io(parent.to_owned(), e))?;
        }

        let text = to_pretty_json(&Value::Object(merged))?;
        fs::write(&sidecar, text).map_err(|e| OutputError::Io(sidecar.clone(), e))?;

        tracing::debug!("Wrote sidecar {sidecar}");
        Ok(sidecar)
    }
}

fn file_name(target: &Utf8Path) -> &str {
    target.file_name().unwrap_or(target.as_str())
}

fn read_existing(sidecar: &Utf8Path) -> Map<String, Value> {
    let Ok(text) = fs::read_to_string(sidecar) else {
        return Map::new();
    };

    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!("Existing sidecar {sidecar} isn't a JSON object, replacing it");
            Map::new()
        }
    }
}

/// JSON with a four space indent.
pub(crate) fn to_pretty_json(value: &(impl Serialize + ?Sized)) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    Ok(buffer)
}
