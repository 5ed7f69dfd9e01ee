//! Canonical storage locations for artifacts.
//!
//! Every persisted artifact is addressed by an [`ArtifactId`]. The mapping from
//! identity to path is pure: equal identities always produce equal paths, so
//! the same function is used both to pick a write target and to probe whether
//! a previous run already produced it.
//!
//! The layout follows the BIDS derivative convention:
//!
//! ```text
//! <root>/sub-<S>/ses-<SS>/<datatype>/sub-<S>_ses-<SS>_task-<T>_run-<R>_desc-<D>_<suffix><ext>
//! ```

use std::collections::BTreeMap;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::dataset::Coords;

/// Entity keys in the order they appear in a file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Subject,
    Session,
    Task,
    Acquisition,
    Run,
    Description,
}

impl Entity {
    pub fn key(self) -> &'static str {
        match self {
            Entity::Subject => "sub",
            Entity::Session => "ses",
            Entity::Task => "task",
            Entity::Acquisition => "acq",
            Entity::Run => "run",
            Entity::Description => "desc",
        }
    }
}

/// Normalizes a coordinate label so that equal logical labels always produce
/// the same path segment.
///
/// A redundant entity prefix is stripped (`"sub-01"` → `"01"`) and separators
/// are removed, as labels may only contain alphanumeric characters
/// (`"0-1"` → `"01"`).
pub fn normalize_label(entity: Entity, label: &str) -> String {
    let label = label.trim();
    let label = label
        .strip_prefix(entity.key())
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(label);

    label.chars().filter(|c| c.is_alphanumeric()).collect()
}

pub(crate) fn normalize_extension(extension: &str) -> String {
    match extension {
        "" => String::new(),
        ext if ext.starts_with('.') => ext.to_string(),
        ext => format!(".{ext}"),
    }
}

/// The identity of a (possibly not yet existing) artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub root: Utf8PathBuf,
    pub coords: Coords,
    pub acquisition: Option<String>,
    pub description: String,
    pub datatype: String,
    pub suffix: String,
    pub extension: String,
}

impl ArtifactId {
    pub fn new(root: impl Into<Utf8PathBuf>, coords: Coords) -> Self {
        Self {
            root: root.into(),
            coords,
            acquisition: None,
            description: String::new(),
            datatype: String::new(),
            suffix: String::new(),
            extension: String::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = datatype.into();
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn extension(mut self, extension: impl AsRef<str>) -> Self {
        self.extension = normalize_extension(extension.as_ref());
        self
    }

    pub fn acquisition(mut self, acquisition: Option<String>) -> Self {
        self.acquisition = acquisition;
        self
    }

    /// Entity pairs in file name order, with normalized labels. Empty labels
    /// are left out.
    pub fn entities(&self) -> Vec<(Entity, String)> {
        let Coords {
            subject,
            session,
            task,
            run,
        } = &self.coords;

        let mut entities = vec![
            (Entity::Subject, normalize_label(Entity::Subject, subject)),
            (Entity::Session, normalize_label(Entity::Session, session)),
            (Entity::Task, normalize_label(Entity::Task, task)),
        ];

        if let Some(acq) = &self.acquisition {
            entities.push((Entity::Acquisition, normalize_label(Entity::Acquisition, acq)));
        }

        entities.push((Entity::Run, normalize_label(Entity::Run, run)));
        // Descriptions are kept verbatim, step prefixes like `01_plot` are
        // meaningful to readers.
        entities.push((Entity::Description, self.description.trim().to_string()));

        entities.retain(|(_, label)| !label.is_empty());
        entities
    }

    /// The directory the artifact lives in.
    pub fn directory(&self) -> Utf8PathBuf {
        let mut dir = self.root.clone();

        for (entity, label) in self.entities() {
            match entity {
                Entity::Subject | Entity::Session => dir.push(format!("{}-{label}", entity.key())),
                _ => {}
            }
        }

        if !self.datatype.is_empty() {
            dir.push(&self.datatype);
        }

        dir
    }

    /// The file name of the artifact, without any directory.
    pub fn file_name(&self) -> String {
        let mut parts: Vec<String> = self
            .entities()
            .into_iter()
            .map(|(entity, label)| format!("{}-{label}", entity.key()))
            .collect();

        if !self.suffix.is_empty() {
            parts.push(self.suffix.clone());
        }

        let mut name = parts.join("_");
        name.push_str(&self.extension);
        name
    }

    /// Canonical location of the artifact.
    pub fn path(&self) -> Utf8PathBuf {
        self.directory().join(self.file_name())
    }

    /// Location of the JSON sidecar that accompanies the artifact.
    pub fn sidecar(&self) -> Utf8PathBuf {
        self.path().with_extension("json")
    }
}

/// Entities parsed back out of an artifact file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedName {
    pub entities: BTreeMap<String, String>,
    pub suffix: Option<String>,
    pub extension: String,
}

impl ParsedName {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }

    pub fn coords(&self) -> Coords {
        Coords::new(
            self.get("sub").unwrap_or_default(),
            self.get("ses").unwrap_or_default(),
            self.get("task").unwrap_or_default(),
            self.get("run").unwrap_or_default(),
        )
    }
}

/// Parses a `key-value_key-value_suffix.ext` file name.
///
/// Tokens without a `-` in the middle of the name belong to the preceding
/// value (`desc-01_plot` keeps its underscore); the last such token is the
/// suffix. Returns `None` if the name has no entities at all.
pub fn parse_entities(file_name: &str) -> Option<ParsedName> {
    let (stem, extension) = match file_name.find('.') {
        Some(i) => (&file_name[..i], file_name[i..].to_string()),
        None => (file_name, String::new()),
    };

    let tokens: Vec<&str> = stem.split('_').collect();
    let mut parsed = ParsedName {
        extension,
        ..ParsedName::default()
    };
    let mut last_key: Option<String> = None;

    for (i, token) in tokens.iter().enumerate() {
        match token.split_once('-') {
            Some((key, value)) if !key.is_empty() => {
                parsed.entities.insert(key.to_string(), value.to_string());
                last_key = Some(key.to_string());
            }
            _ if i + 1 == tokens.len() => {
                parsed.suffix = Some(token.to_string());
            }
            _ => match &last_key {
                Some(key) => {
                    if let Some(value) = parsed.entities.get_mut(key) {
                        value.push('_');
                        value.push_str(token);
                    }
                }
                None => return None,
            },
        }
    }

    if parsed.entities.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

/// Lexically cleans an output directory: `.` is dropped and `..` eats the
/// preceding name. Leading `..` of a relative path are kept, symlinks are
/// not resolved.
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut ret = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir if matches!(ret.components().next_back(), Some(Utf8Component::Normal(_))) => {
                ret.pop();
            }
            Utf8Component::ParentDir if ret.has_root() => {}
            other => ret.push(other.as_str()),
        }
    }
    ret
}
