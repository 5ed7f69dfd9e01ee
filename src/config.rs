use std::fmt;
use std::fs;
use std::process::Command;
use std::sync::{Arc, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::{Filter, Manifest};
use crate::error::ConfigError;
use crate::overwrite::{AutoResponse, FsProbe, OverwriteMode, OverwritePolicy, Probe, Responder};
use crate::provenance::Recorder;
use crate::registry::{OutputSpec, Selection};

/// Settings shared by every part of a run.
///
/// A `Config` is built once, wrapped in an [`Arc`] and never mutated. The
/// `with_*` methods return modified copies, which is how command line flags
/// are layered on top of a loaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the step units, relative paths are resolved against
    /// the directory of the configuration file.
    pub steps_dir: Utf8PathBuf,
    pub data_dir: Utf8PathBuf,
    pub bids_root: Utf8PathBuf,
    pub deriv_root: Utf8PathBuf,
    /// Root for named outputs, `deriv_root` when unset.
    pub output_root: Option<Utf8PathBuf>,

    pub subjects: Vec<String>,
    pub sessions: Vec<String>,
    pub tasks: Vec<String>,
    pub sources: Manifest,

    pub datatype: String,
    pub acquisition: Option<String>,
    pub source_extension: String,
    /// Suffixes whose artifacts replace the item state seen by later steps.
    pub primary_suffixes: Vec<String>,

    pub overwrite_mode: OverwriteMode,
    /// `off`, `default` or a literal answer.
    pub auto_response: String,
    pub n_jobs: usize,

    pub sidecar_auto_generate: bool,
    pub output_profiling: bool,
    pub outputs_to_generate: Option<OutputSpec>,
    pub outputs_to_skip: Option<OutputSpec>,

    /// Overrides the version stamped into sidecars.
    pub version: Option<String>,

    #[serde(skip)]
    pub config_path: Option<Utf8PathBuf>,
    #[serde(skip)]
    hooks: Hooks,
    #[serde(skip)]
    resolved_version: OnceLock<String>,
}

/// Collaborators injected in code rather than read from a file.
#[derive(Clone, Default)]
struct Hooks {
    responder: Option<Arc<dyn Responder>>,
    probe: Option<Arc<dyn Probe>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("responder", &self.responder.is_some())
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").map(Utf8PathBuf::from).unwrap_or_else(|_| ".".into());
        let data_dir = home.join("data");

        Self {
            steps_dir: "steps".into(),
            bids_root: data_dir.join("bids"),
            deriv_root: data_dir.join("derivatives"),
            data_dir,
            output_root: None,
            subjects: Vec::new(),
            sessions: Vec::new(),
            tasks: Vec::new(),
            sources: Manifest::new(),
            datatype: "eeg".into(),
            acquisition: None,
            source_extension: ".edf".into(),
            primary_suffixes: vec!["eeg".into(), "meg".into(), "ieeg".into()],
            overwrite_mode: OverwriteMode::Never,
            auto_response: "off".into(),
            n_jobs: 1,
            sidecar_auto_generate: true,
            output_profiling: false,
            outputs_to_generate: None,
            outputs_to_skip: None,
            version: None,
            config_path: None,
            hooks: Hooks::default(),
            resolved_version: OnceLock::new(),
        }
    }
}

impl Config {
    /// Loads a JSON configuration file. A sibling `<stem>_local.<ext>` file,
    /// when present, is merged on top of it.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_owned()));
        }

        let mut value = read_object(path)?;

        let local = local_path(path);
        if local.is_file() {
            tracing::debug!("Merging local configuration {local}");
            merge(&mut value, read_object(&local)?);
        }

        let mut config: Config =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(path.to_owned(), e))?;

        if config.steps_dir.is_relative()
            && let Some(dir) = path.parent()
        {
            config.steps_dir = dir.join(&config.steps_dir);
        }
        config.config_path = Some(path.to_owned());

        tracing::info!("Using configuration file {path}");
        Ok(config)
    }

    /// The version stamped into sidecars: the configured override, else the
    /// short hash of the current git commit, else `unknown`.
    pub fn version(&self) -> &str {
        if let Some(version) = &self.version {
            return version;
        }

        self.resolved_version.get_or_init(|| {
            let dir = self
                .config_path
                .as_deref()
                .and_then(Utf8Path::parent)
                .filter(|dir| !dir.as_str().is_empty())
                .unwrap_or(Utf8Path::new("."));

            git_version(dir).unwrap_or_else(|| "unknown".into())
        })
    }

    pub fn output_root(&self) -> &Utf8Path {
        self.output_root.as_deref().unwrap_or(&self.deriv_root)
    }

    pub fn filter(&self) -> Filter {
        Filter {
            subjects: self.subjects.clone(),
            sessions: self.sessions.clone(),
            tasks: self.tasks.clone(),
        }
    }

    pub fn selection(&self) -> Selection {
        Selection {
            generate: self.outputs_to_generate.clone(),
            skip: self.outputs_to_skip.clone(),
        }
    }

    pub fn responder(&self) -> Arc<dyn Responder> {
        match &self.hooks.responder {
            Some(responder) => responder.clone(),
            None => Arc::new(AutoResponse::from(self.auto_response.as_str())),
        }
    }

    pub fn probe(&self) -> Arc<dyn Probe> {
        match &self.hooks.probe {
            Some(probe) => probe.clone(),
            None => Arc::new(FsProbe),
        }
    }

    pub fn policy(&self) -> OverwritePolicy {
        OverwritePolicy::new(self.overwrite_mode.clone(), self.responder(), self.probe())
    }

    pub fn recorder(&self) -> Recorder {
        Recorder::new(self.version(), self.n_jobs).enabled(self.sidecar_auto_generate)
    }

    pub fn is_primary(&self, suffix: &str) -> bool {
        self.primary_suffixes.iter().any(|s| s == suffix)
    }

    /// Thread pool sized by `n_jobs` for workers that parallelize internally.
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_jobs.max(1))
            .build()
    }

    pub fn with_overwrite_mode(mut self, mode: OverwriteMode) -> Self {
        self.overwrite_mode = mode;
        self
    }

    pub fn with_auto_response(mut self, response: impl Into<String>) -> Self {
        self.auto_response = response.into();
        self
    }

    pub fn with_deriv_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.deriv_root = root.into();
        self
    }

    pub fn with_outputs_to_generate(mut self, spec: Option<OutputSpec>) -> Self {
        self.outputs_to_generate = spec;
        self
    }

    pub fn with_outputs_to_skip(mut self, spec: Option<OutputSpec>) -> Self {
        self.outputs_to_skip = spec;
        self
    }

    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = n_jobs;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.hooks.responder = Some(responder);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.hooks.probe = Some(probe);
        self
    }
}

fn local_path(path: &Utf8Path) -> Utf8PathBuf {
    let stem = path.file_stem().unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_local.{ext}"),
        None => format!("{stem}_local"),
    };
    path.with_file_name(name)
}

fn read_object(path: &Utf8Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))?;

    if value.is_object() {
        Ok(value)
    } else {
        Err(ConfigError::NotAnObject(path.to_owned()))
    }
}

/// Deep merge, values from `overlay` win except where both sides are objects.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn git_version(dir: &Utf8Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let hash = String::from_utf8(output.stdout).ok()?;
    let hash = hash.trim();
    (!hash.is_empty()).then(|| format!("git-{hash}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Utf8Path, name: &str, text: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.n_jobs, 1);
        assert_eq!(config.datatype, "eeg");
        assert_eq!(config.overwrite_mode, OverwriteMode::Never);
        assert!(config.sidecar_auto_generate);
        assert!(config.is_primary("meg"));
        assert!(!config.is_primary("annotations"));
        assert_eq!(config.output_root(), config.deriv_root);
    }

    #[test]
    fn test_load_merges_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let path = write(
            dir,
            "config.json",
            r#"{
                "deriv_root": "/data/derivatives",
                "subjects": ["01", "02"],
                "overwrite_mode": "ifnewer",
                "outputs_to_skip": {"01": ["plot"]},
                "sources": {"01": {"01": {"rest": {"1": "raw/01.edf"}}}}
            }"#,
        );
        write(
            dir,
            "config_local.json",
            r#"{"deriv_root": "/scratch/derivatives", "sources": {"01": {"01": {"rest": {"2": "raw/01_2.edf"}}}}}"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.deriv_root, "/scratch/derivatives");
        assert_eq!(config.subjects, vec!["01", "02"]);
        assert_eq!(config.overwrite_mode, OverwriteMode::IfNewer);
        assert_eq!(config.sources["01"]["01"]["rest"].len(), 2);
        assert_eq!(config.steps_dir, dir.join("steps"));
        assert!(config.outputs_to_skip.is_some());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        assert!(matches!(Config::load(dir.join("missing.json")), Err(ConfigError::NotFound(_))));

        let list = write(dir, "list.json", "[1, 2]");
        assert!(matches!(Config::load(&list), Err(ConfigError::NotAnObject(_))));

        let broken = write(dir, "broken.json", "{");
        assert!(matches!(Config::load(&broken), Err(ConfigError::Parse(..))));
    }

    #[test]
    fn test_unknown_overwrite_mode_is_kept() {
        let config: Config = serde_json::from_str(r#"{"overwrite_mode": "sometimes"}"#).unwrap();
        assert_eq!(config.overwrite_mode, OverwriteMode::Unknown("sometimes".into()));
    }

    #[test]
    fn test_version_override() {
        let config = Config::default().with_version("1.2.3");
        assert_eq!(config.version(), "1.2.3");
    }

    #[test]
    fn test_thread_pool_follows_n_jobs() {
        let mut config = Config::default();
        config.n_jobs = 3;
        assert_eq!(config.thread_pool().unwrap().current_num_threads(), 3);

        config.n_jobs = 0;
        assert_eq!(config.thread_pool().unwrap().current_num_threads(), 1);
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path(Utf8Path::new("a/config.json")), "a/config_local.json");
    }
}
