//! Applies a worker to every item of a [`Dataset`].
//!
//! For each visited item the engine resolves the artifact the worker would
//! produce, asks the [`OverwritePolicy`] whether it should be produced at all,
//! runs the worker and stores what it returned back into the dataset. Items
//! are processed one at a time, in dataset order.
//!
//! A worker error (or panic) only affects its own item: the item is removed
//! from the dataset and the traversal continues. The one exception is an error
//! carrying [`Fatal`], which stops the traversal and is returned to the
//! caller.

use std::any::Any;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Level;

use crate::config::Config;
use crate::dataset::{Coords, Dataset, Filter, ItemState};
use crate::error::{Fatal, PipelineError};
use crate::io::{as_overhead, progress};
use crate::overwrite::{Decision, OverwritePolicy};
use crate::path::ArtifactId;
use crate::provenance::{Extras, Recorder, SidecarStyle, StepInfo};
use crate::step::naming::default_description;

/// What a worker produced for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Produced<T> {
    /// A domain object, persisted when the apply call asks for it.
    Object(T),
    /// A new item state passed through as is, e.g. the location of the
    /// input of the next step.
    State(ItemState<T>),
}

/// A worker result together with extra sidecar fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub produced: Produced<T>,
    pub fields: Map<String, Value>,
}

impl<T> Outcome<T> {
    pub fn object(object: T) -> Self {
        Produced::Object(object).into()
    }

    pub fn state(state: ItemState<T>) -> Self {
        Produced::State(state).into()
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Serialize) -> anyhow::Result<Self> {
        self.fields.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }
}

impl<T> From<Produced<T>> for Outcome<T> {
    fn from(produced: Produced<T>) -> Self {
        Self {
            produced,
            fields: Map::new(),
        }
    }
}

type WriteFn<'a, T> = Box<dyn Fn(&Utf8Path, &T) -> anyhow::Result<()> + 'a>;

/// Writes domain objects to their artifact location.
pub struct Serializer<'a, T> {
    extension: String,
    write: WriteFn<'a, T>,
}

impl<'a, T> Serializer<'a, T> {
    pub fn new<F>(extension: impl Into<String>, write: F) -> Self
    where
        F: Fn(&Utf8Path, &T) -> anyhow::Result<()> + 'a,
    {
        Self {
            extension: extension.into(),
            write: Box::new(write),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

/// Options of a single [`Engine::apply`] call.
pub struct Apply<'a, T> {
    filter: Option<Filter>,
    persist: bool,
    suffix: Option<String>,
    description: Option<String>,
    root: Option<Utf8PathBuf>,
    extension: Option<String>,
    serializer: Option<Serializer<'a, T>>,
    print_duration: bool,
}

impl<T> Default for Apply<'_, T> {
    fn default() -> Self {
        Self {
            filter: None,
            persist: true,
            suffix: None,
            description: None,
            root: None,
            extension: None,
            serializer: None,
            print_duration: true,
        }
    }
}

impl<'a, T> Apply<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results are kept in memory only.
    pub fn in_memory() -> Self {
        Self::default().persist(false)
    }

    /// Restricts the traversal. Levels left empty fall back to the configured
    /// subjects, sessions and tasks.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Category of the produced artifacts, the configured datatype by default.
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Destination root, the configured derivatives root by default.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Extension of the artifacts when no serializer provides one.
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn serializer(mut self, serializer: Serializer<'a, T>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn print_duration(mut self, print_duration: bool) -> Self {
        self.print_duration = print_duration;
        self
    }
}

/// Summary of an [`Engine::apply`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Items the worker ran for.
    pub processed: Vec<Coords>,
    /// Items whose artifact already existed.
    pub cached: Vec<Coords>,
    /// Items removed from the dataset after a failure.
    pub dropped: Vec<Coords>,
}

impl ApplyReport {
    pub fn visited(&self) -> usize {
        self.processed.len() + self.cached.len() + self.dropped.len()
    }
}

/// Traverses datasets with a fixed configuration.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<Config>,
    policy: OverwritePolicy,
    recorder: Recorder,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            policy: config.policy(),
            recorder: config.recorder(),
            config,
        }
    }

    pub fn with_policy(mut self, policy: OverwritePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `worker` for every item selected by `options`, updating
    /// `dataset` in place.
    ///
    /// The worker receives the current state of the item and the identity of
    /// the artifact it would produce. Items whose worker fails are removed
    /// from `dataset`.
    pub fn apply<T, W>(
        &self,
        dataset: &mut Dataset<T>,
        step: &StepInfo,
        mut worker: W,
        options: Apply<'_, T>,
    ) -> Result<ApplyReport, PipelineError>
    where
        W: FnMut(&ItemState<T>, &ArtifactId) -> anyhow::Result<Outcome<T>>,
    {
        let s = Instant::now();
        let config = &self.config;

        let filter = match &options.filter {
            Some(filter) => filter.or(&config.filter()),
            None => config.filter(),
        };
        let description = options
            .description
            .clone()
            .unwrap_or_else(|| default_description(&step.id, &step.description));
        let suffix = options.suffix.clone().unwrap_or_else(|| config.datatype.clone());
        let primary = config.is_primary(&suffix);
        let root = options.root.clone().unwrap_or_else(|| config.deriv_root.clone());
        let extension = match (&options.serializer, &options.extension) {
            (Some(serializer), _) => serializer.extension().to_string(),
            (None, Some(extension)) => extension.clone(),
            (None, None) => String::new(),
        };

        let span = tracing::span!(Level::INFO, "apply", step = %step.id, description = %description);
        let _enter = span.enter();

        let items = dataset.coords(&filter);
        let pb = progress(items.len(), format!("Running {description}"));
        let mut report = ApplyReport::default();

        for coords in items {
            pb.inc(1);

            let Some(state) = dataset.get(&coords) else {
                continue;
            };
            let source = state.location().map(Utf8Path::to_owned);

            let id = ArtifactId::new(&root, coords.clone())
                .description(&description)
                .datatype(&config.datatype)
                .suffix(&suffix)
                .extension(&extension)
                .acquisition(config.acquisition.clone());
            let target = id.path();

            if options.persist {
                let decision = pb.suspend(|| self.policy.decide(&target, source.as_deref()));
                match decision {
                    Err(fatal) => {
                        pb.abandon();
                        return Err(PipelineError::Fatal(fatal));
                    }
                    Ok(Decision::SkipExisting) => {
                        if primary {
                            dataset.set(coords.clone(), ItemState::Artifact(target));
                        }
                        report.cached.push(coords);
                        continue;
                    }
                    Ok(Decision::Proceed) => {}
                }
            }

            let start = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| worker(state, &id)))
                .unwrap_or_else(|panic| Err(anyhow::anyhow!("Worker panicked: {}", panic_message(&*panic))));
            let duration = start.elapsed();

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Some(fatal) = Fatal::find(&err) {
                        pb.abandon();
                        return Err(PipelineError::Fatal(fatal.clone()));
                    }
                    pb.suspend(|| drop_item(dataset, &coords, &description, &err));
                    report.dropped.push(coords);
                    continue;
                }
            };

            if options.print_duration {
                tracing::info!("Step {description} took {:.2} seconds for {coords}", duration.as_secs_f64());
            }

            let Outcome { produced, fields } = outcome;
            let state = match produced {
                Produced::State(state) => Some(state),
                Produced::Object(object) if !options.persist => Some(ItemState::Memory(object)),
                Produced::Object(object) => match &options.serializer {
                    None => {
                        tracing::warn!(
                            "Step {description} asked to persist results for {coords} but no serializer was given, keeping the result in memory"
                        );
                        Some(ItemState::Memory(object))
                    }
                    Some(serializer) => {
                        let extras = Extras {
                            source: source.as_ref().map(|source| source.file_name().unwrap_or(source.as_str()).to_string()),
                            duration: Some(duration),
                            performance: None,
                            custom: fields,
                        };

                        match self.persist(serializer, &object, &target, step, &extras) {
                            Ok(()) => primary.then(|| ItemState::Artifact(target)),
                            Err(err) => {
                                if let Some(fatal) = Fatal::find(&err) {
                                    pb.abandon();
                                    return Err(PipelineError::Fatal(fatal.clone()));
                                }
                                pb.suspend(|| drop_item(dataset, &coords, &description, &err));
                                report.dropped.push(coords);
                                continue;
                            }
                        }
                    }
                },
            };

            if let Some(state) = state {
                dataset.set(coords.clone(), state);
            }
            report.processed.push(coords);
        }

        pb.finish_and_clear();

        if !report.dropped.is_empty() {
            let dropped: Vec<String> = report.dropped.iter().map(ToString::to_string).collect();
            tracing::warn!(
                "Step {description} dropped {} item(s) that failed:\n  {}",
                dropped.len(),
                dropped.join("\n  ")
            );
        }

        tracing::info!(
            "Step {description}: {} processed, {} cached, {} dropped {}",
            report.processed.len(),
            report.cached.len(),
            report.dropped.len(),
            as_overhead(s)
        );

        Ok(report)
    }

    fn persist<T>(
        &self,
        serializer: &Serializer<'_, T>,
        object: &T,
        target: &Utf8Path,
        step: &StepInfo,
        extras: &Extras,
    ) -> anyhow::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        catch_unwind(AssertUnwindSafe(|| (serializer.write)(target, object)))
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("Serializer panicked: {}", panic_message(&*panic))))?;

        self.recorder.record(target, step, extras, SidecarStyle::Replace)?;
        Ok(())
    }
}

fn drop_item<T>(dataset: &mut Dataset<T>, coords: &Coords, description: &str, err: &anyhow::Error) {
    tracing::warn!("Something went wrong with {description} for {coords}, removing it to continue: {err}");
    tracing::debug!("{err:?}");
    dataset.delete(coords);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
