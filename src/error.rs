use camino::Utf8PathBuf;
use thiserror::Error;

/// Deliberate abort signal.
///
/// Unlike every other error raised while processing a single item, `Fatal` is
/// never isolated: when a worker returns it (anywhere in its error chain), or
/// when an interactive answer cannot be obtained, the whole run stops.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Fatal(pub String);

impl Fatal {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the `Fatal` signal carried anywhere in the error chain, if any.
    pub fn find(err: &anyhow::Error) -> Option<&Fatal> {
        err.chain().find_map(|cause| cause.downcast_ref::<Fatal>())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Fatal: {0}")]
    Fatal(#[from] Fatal),

    #[error("Step '{0}':\n{1}")]
    Step(String, anyhow::Error),

    #[error("Error while loading the configuration.\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while saving an output.\n{0}")]
    Output(#[from] OutputError),

    #[error(transparent)]
    Select(#[from] SelectError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(Utf8PathBuf),

    #[error("Couldn't read configuration file {0}.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse configuration file {0}.\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),

    #[error("Configuration file {0} must contain a JSON object")]
    NotAnObject(Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Output '{name}' is already registered for step '{unit}'")]
    Duplicate { unit: String, name: String },

    #[error("Couldn't write output {0}.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Serializer failed for {0}.\n{1}")]
    Serialize(Utf8PathBuf, #[source] anyhow::Error),

    #[error("Couldn't encode JSON.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported format '{format}', supported: {supported}")]
    Format {
        format: String,
        supported: &'static str,
    },

    #[error("Array of {len} values doesn't fit shape {shape:?}")]
    Shape { len: usize, shape: Vec<usize> },

    #[error("{0}")]
    Fatal(#[from] Fatal),
}

/// Lookup of a derivative that must resolve to exactly one file.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("No file matching {0}")]
    NotFound(String),

    #[error("Found {count} files matching {pattern}, expected exactly one")]
    Ambiguous { pattern: String, count: usize },

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("Step '{0}' not found")]
    NotFound(String),

    #[error("Step '{0}' is ambiguous, matches: {1}")]
    Ambiguous(String, String),
}
