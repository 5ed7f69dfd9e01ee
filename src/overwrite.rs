//! Deciding whether an artifact should be (re)produced.
//!
//! The rules live in [`decide`], a function of plain facts about the target
//! and the source. [`OverwritePolicy`] collects those facts from storage
//! through a [`Probe`] and obtains answers for `ask` mode from a
//! [`Responder`], both of which can be swapped out in tests.

use std::convert::Infallible;
use std::fmt::{self, Display};
use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use camino::Utf8Path;
use console::Term;
use serde::{Deserialize, Serialize};

use crate::error::Fatal;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OverwriteMode {
    Always,
    #[default]
    Never,
    Ask,
    IfNewer,
    /// Unrecognized mode, treated as [`OverwriteMode::Never`].
    Unknown(String),
}

impl FromStr for OverwriteMode {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "always" => OverwriteMode::Always,
            "never" => OverwriteMode::Never,
            "ask" => OverwriteMode::Ask,
            "ifnewer" => OverwriteMode::IfNewer,
            _ => OverwriteMode::Unknown(s.to_string()),
        })
    }
}

impl From<String> for OverwriteMode {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(mode) => mode,
            Err(never) => match never {},
        }
    }
}

impl From<OverwriteMode> for String {
    fn from(value: OverwriteMode) -> Self {
        value.to_string()
    }
}

impl Display for OverwriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverwriteMode::Always => f.write_str("always"),
            OverwriteMode::Never => f.write_str("never"),
            OverwriteMode::Ask => f.write_str("ask"),
            OverwriteMode::IfNewer => f.write_str("ifnewer"),
            OverwriteMode::Unknown(mode) => f.write_str(mode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    SkipExisting,
}

/// What is known about the target and its source at decision time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Facts {
    pub target_exists: bool,
    /// `None` when no source was given, `Some(None)` when the source exists
    /// but its timestamp couldn't be read.
    pub source_mtime: Option<Option<SystemTime>>,
    pub target_mtime: Option<SystemTime>,
}

/// Applies the overwrite rules for `mode`.
///
/// `ask` is only called in [`OverwriteMode::Ask`] when the target exists, and
/// a failure to obtain an answer propagates as [`Fatal`].
pub fn decide<F>(mode: &OverwriteMode, target: &Utf8Path, facts: &Facts, ask: F) -> Result<Decision, Fatal>
where
    F: FnOnce(&str) -> Result<String, Fatal>,
{
    if !facts.target_exists {
        if let OverwriteMode::Unknown(mode) = mode {
            tracing::warn!("Unknown overwrite mode '{mode}', falling back to 'never'");
        }
        return Ok(Decision::Proceed);
    }

    let decision = match mode {
        OverwriteMode::Always => Decision::Proceed,
        OverwriteMode::Never => {
            tracing::info!("File {target} exists, skipping");
            Decision::SkipExisting
        }
        OverwriteMode::Ask => {
            let answer = ask(&format!("File {target} exists. Overwrite? (y/n)"))?;
            match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => Decision::Proceed,
                _ => {
                    tracing::info!("Keeping existing file {target}");
                    Decision::SkipExisting
                }
            }
        }
        OverwriteMode::IfNewer => match (facts.source_mtime, facts.target_mtime) {
            (None, _) => {
                tracing::info!("File {target} exists and there is no source to compare, skipping");
                Decision::SkipExisting
            }
            (Some(None), _) => {
                tracing::warn!("Couldn't read the source timestamp for {target}, keeping the existing file");
                Decision::SkipExisting
            }
            (Some(Some(_)), None) => {
                tracing::warn!("Couldn't read the timestamp of {target}, keeping the existing file");
                Decision::SkipExisting
            }
            (Some(Some(source)), Some(target_time)) if source > target_time => Decision::Proceed,
            (Some(Some(_)), Some(_)) => {
                tracing::info!("File {target} is up to date, skipping");
                Decision::SkipExisting
            }
        },
        OverwriteMode::Unknown(mode) => {
            tracing::warn!("Unknown overwrite mode '{mode}', falling back to 'never'");
            tracing::info!("File {target} exists, skipping");
            Decision::SkipExisting
        }
    };

    Ok(decision)
}

/// Source of answers for interactive questions.
pub trait Responder: Send + Sync {
    /// Asks `prompt`, `default` being the answer to use when no one is asked.
    fn ask(&self, prompt: &str, default: &str) -> Result<String, Fatal>;
}

/// How questions are answered when running unattended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AutoResponse {
    /// Ask on the terminal. Without one, asking is fatal.
    #[default]
    Off,
    /// Always take the default answer.
    Default,
    /// Always answer with the given text.
    Fixed(String),
}

impl From<&str> for AutoResponse {
    fn from(value: &str) -> Self {
        match value {
            "off" | "" => AutoResponse::Off,
            "default" => AutoResponse::Default,
            other => AutoResponse::Fixed(other.to_string()),
        }
    }
}

impl Responder for AutoResponse {
    fn ask(&self, prompt: &str, default: &str) -> Result<String, Fatal> {
        match self {
            AutoResponse::Default => {
                tracing::info!("{prompt} [auto: {default}]");
                Ok(default.to_string())
            }
            AutoResponse::Fixed(answer) => {
                tracing::info!("{prompt} [auto: {answer}]");
                Ok(answer.clone())
            }
            AutoResponse::Off => {
                let term = Term::stderr();
                if !term.is_term() || !std::io::stdin().is_terminal() {
                    return Err(Fatal::new(format!(
                        "{prompt}\nNo terminal to answer from, set an automatic response to run unattended"
                    )));
                }

                term.write_line(prompt)
                    .and_then(|_| term.read_line())
                    .map_err(|e| Fatal::new(format!("Couldn't read an answer to '{prompt}': {e}")))
            }
        }
    }
}

/// Storage facts needed for overwrite decisions.
pub trait Probe: Send + Sync {
    fn exists(&self, path: &Utf8Path) -> bool;
    fn mtime(&self, path: &Utf8Path) -> Option<SystemTime>;
}

/// [`Probe`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl Probe for FsProbe {
    fn exists(&self, path: &Utf8Path) -> bool {
        path.exists()
    }

    fn mtime(&self, path: &Utf8Path) -> Option<SystemTime> {
        path.metadata().and_then(|meta| meta.modified()).ok()
    }
}

/// Overwrite mode bound to the storage and the responder it consults.
#[derive(Clone)]
pub struct OverwritePolicy {
    pub mode: OverwriteMode,
    responder: Arc<dyn Responder>,
    probe: Arc<dyn Probe>,
}

impl fmt::Debug for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverwritePolicy").field("mode", &self.mode).finish_non_exhaustive()
    }
}

impl OverwritePolicy {
    pub fn new(mode: OverwriteMode, responder: Arc<dyn Responder>, probe: Arc<dyn Probe>) -> Self {
        Self { mode, responder, probe }
    }

    pub fn with_mode(mut self, mode: OverwriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn probe(&self) -> &dyn Probe {
        self.probe.as_ref()
    }

    pub fn facts(&self, target: &Utf8Path, source: Option<&Utf8Path>) -> Facts {
        let target_exists = self.probe.exists(target);
        Facts {
            target_exists,
            source_mtime: source.map(|source| self.probe.mtime(source)),
            target_mtime: target_exists.then(|| self.probe.mtime(target)).flatten(),
        }
    }

    /// Decides whether `target` should be produced, comparing against
    /// `source` in [`OverwriteMode::IfNewer`].
    pub fn decide(&self, target: &Utf8Path, source: Option<&Utf8Path>) -> Result<Decision, Fatal> {
        let facts = self.facts(target, source);
        decide(&self.mode, target, &facts, |prompt| self.responder.ask(prompt, "n"))
    }
}
