//! Named side-outputs and the selection deciding which of them are produced.
//!
//! A step declares its outputs once, when it is added to a pipeline. Whether a
//! declared output is generated on a given run depends on a [`Selection`]
//! built from configuration:
//!
//! 1. an output matching the skip list is never generated;
//! 2. without a generate list, the descriptor default applies;
//! 3. otherwise the output must match the generate list.
//!
//! Both lists use the same grammar, see [`OutputSpec`].

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::OutputError;
use crate::overwrite::OverwriteMode;

/// Wildcard matching every step or every output.
pub const WILDCARD: &str = "*";

/// Declaration of a named output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    pub name: String,
    pub description: String,
    pub enabled_by_default: bool,
    /// Overwrite mode used for this output instead of the configured one.
    pub existence_check: Option<OverwriteMode>,
    pub suffix: Option<String>,
    pub extension: Option<String>,
}

impl OutputDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled_by_default: true,
            existence_check: None,
            suffix: None,
            extension: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn existence_check(mut self, mode: OverwriteMode) -> Self {
        self.existence_check = Some(mode);
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
}

/// Output patterns, either for every step or keyed by step id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    Global(Vec<String>),
    Scoped(BTreeMap<String, Vec<String>>),
}

impl OutputSpec {
    /// Whether `name`, produced by step `unit`, matches any pattern.
    pub fn matches(&self, unit: &str, name: &str) -> bool {
        match self {
            OutputSpec::Global(patterns) => any_match(patterns, name),
            OutputSpec::Scoped(scopes) => [unit, WILDCARD]
                .into_iter()
                .filter_map(|key| scopes.get(key))
                .any(|patterns| any_match(patterns, name)),
        }
    }
}

fn any_match(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|pattern| pattern_matches(pattern, name))
}

/// Exact or `*`-wildcard match. Malformed patterns only match literally.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(compiled) => compiled.matches(name),
        Err(_) => pattern == name,
    }
}

/// Parses the comma separated selection grammar.
///
/// `"plot,stats"` is a global list. As soon as one token is scoped
/// (`unit:pattern`) the whole spec is scoped and unscoped tokens fall under
/// `*`: `"01:plot,02:*"` → `{"01": ["plot"], "02": ["*"]}`.
impl FromStr for OutputSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split(',').map(str::trim).filter(|t| !t.is_empty()).collect();

        if !tokens.iter().any(|token| token.contains(':')) {
            return Ok(OutputSpec::Global(tokens.into_iter().map(String::from).collect()));
        }

        let mut scopes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for token in tokens {
            let (unit, pattern) = match token.split_once(':') {
                Some((unit, pattern)) => (unit.trim(), pattern.trim()),
                None => (WILDCARD, token),
            };
            scopes.entry(unit.to_string()).or_default().push(pattern.to_string());
        }

        Ok(OutputSpec::Scoped(scopes))
    }
}

impl Display for OutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSpec::Global(patterns) => f.write_str(&patterns.join(",")),
            OutputSpec::Scoped(scopes) => {
                let tokens: Vec<String> = scopes
                    .iter()
                    .flat_map(|(unit, patterns)| patterns.iter().map(move |p| format!("{unit}:{p}")))
                    .collect();
                f.write_str(&tokens.join(","))
            }
        }
    }
}

/// Run-wide output selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub generate: Option<OutputSpec>,
    pub skip: Option<OutputSpec>,
}

impl Selection {
    pub fn generate(spec: OutputSpec) -> Self {
        Self {
            generate: Some(spec),
            skip: None,
        }
    }

    pub fn skip(spec: OutputSpec) -> Self {
        Self {
            generate: None,
            skip: Some(spec),
        }
    }
}

/// The outputs declared by a single step, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct OutputRegistry {
    unit_id: String,
    outputs: Vec<OutputDescriptor>,
}

impl OutputRegistry {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            outputs: Vec::new(),
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn register(&mut self, descriptor: OutputDescriptor) -> Result<(), OutputError> {
        if self.get(&descriptor.name).is_some() {
            return Err(OutputError::Duplicate {
                unit: self.unit_id.clone(),
                name: descriptor.name,
            });
        }

        self.outputs.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OutputDescriptor> {
        self.outputs.iter().find(|output| output.name == name)
    }

    pub fn list(&self, include_disabled: bool) -> Vec<&OutputDescriptor> {
        self.outputs
            .iter()
            .filter(|output| include_disabled || output.enabled_by_default)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Whether output `name` should be produced under `selection`.
    /// Names that were never registered are enabled by default.
    pub fn should_generate(&self, name: &str, selection: &Selection) -> bool {
        if let Some(skip) = &selection.skip
            && skip.matches(&self.unit_id, name)
        {
            tracing::debug!("Output '{name}' of step '{}' skipped by selection", self.unit_id);
            return false;
        }

        match &selection.generate {
            Some(generate) => generate.matches(&self.unit_id, name),
            None => self.get(name).is_none_or(|output| output.enabled_by_default),
        }
    }
}
