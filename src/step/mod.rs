//! Steps and the pipeline running them in order.

pub mod naming;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use tracing::Level;

use crate::config::Config;
use crate::dataset::{Dataset, ItemState};
use crate::engine::{Apply, ApplyReport, Engine, Outcome};
use crate::error::{Fatal, OutputError, PipelineError, SelectError};
use crate::io::{as_overhead, header, marker};
use crate::output::OutputManager;
use crate::path::ArtifactId;
use crate::provenance::StepInfo;
use crate::registry::OutputRegistry;

use self::naming::guess_short_id;

/// A single processing step, transforming the pipeline data `D`.
pub trait Step<D> {
    /// Full name of the step, e.g. `01_filter`. Steps are selected by
    /// prefixes of their names.
    fn name(&self) -> &str;

    /// Short id used in artifact names and output selections.
    fn id(&self) -> String {
        guess_short_id(self.name())
    }

    fn description(&self) -> &str;

    /// Declares the named outputs of the step. Called once when the step is
    /// added to a pipeline.
    fn register_outputs(&self, _outputs: &mut OutputRegistry) -> Result<(), OutputError> {
        Ok(())
    }

    fn run(&self, ctx: &StepContext<'_>, data: D) -> anyhow::Result<D>;
}

/// Everything a running step has access to.
pub struct StepContext<'a> {
    config: &'a Arc<Config>,
    engine: &'a Engine,
    registry: Arc<OutputRegistry>,
    outputs: OutputManager,
    info: StepInfo,
}

impl<'a> StepContext<'a> {
    pub fn new(config: &'a Arc<Config>, engine: &'a Engine, info: StepInfo, registry: Arc<OutputRegistry>) -> Self {
        let outputs = OutputManager::new(config.clone(), &info.id, &info.description).with_registry(registry.clone());
        Self {
            config,
            engine,
            registry,
            outputs,
            info,
        }
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn outputs(&self) -> &OutputManager {
        &self.outputs
    }

    pub fn registry(&self) -> &OutputRegistry {
        &self.registry
    }

    pub fn info(&self) -> &StepInfo {
        &self.info
    }

    pub fn should_generate(&self, name: &str) -> bool {
        self.registry.should_generate(name, &self.config.selection())
    }

    /// [`Engine::apply`] on behalf of this step.
    pub fn apply<T, W>(
        &self,
        dataset: &mut Dataset<T>,
        worker: W,
        options: Apply<'_, T>,
    ) -> Result<ApplyReport, PipelineError>
    where
        W: FnMut(&ItemState<T>, &ArtifactId) -> anyhow::Result<Outcome<T>>,
    {
        self.engine.apply(dataset, &self.info, worker, options)
    }
}

struct Unit<D> {
    step: Box<dyn Step<D>>,
    info: StepInfo,
    registry: Arc<OutputRegistry>,
}

/// Steps run in sequence, each receiving the data returned by the previous
/// one.
pub struct Pipeline<D> {
    config: Arc<Config>,
    engine: Engine,
    units: Vec<Unit<D>>,
}

pub struct PipelineBuilder<D> {
    config: Arc<Config>,
    engine: Option<Engine>,
    steps: Vec<Box<dyn Step<D>>>,
}

impl<D> PipelineBuilder<D> {
    pub fn step(mut self, step: impl Step<D> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn boxed(mut self, step: Box<dyn Step<D>>) -> Self {
        self.steps.push(step);
        self
    }

    /// Replaces the engine built from the configuration.
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Builds the pipeline, collecting the outputs declared by every step.
    pub fn build(self) -> Result<Pipeline<D>, OutputError> {
        let units = self
            .steps
            .into_iter()
            .map(|step| -> Result<Unit<D>, OutputError> {
                let info = StepInfo::new(step.id(), step.description());
                let mut registry = OutputRegistry::new(&info.id);
                step.register_outputs(&mut registry)?;
                Ok(Unit {
                    step,
                    info,
                    registry: Arc::new(registry),
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Pipeline {
            engine: self.engine.unwrap_or_else(|| Engine::new(self.config.clone())),
            config: self.config,
            units,
        })
    }
}

impl<D> Pipeline<D> {
    pub fn builder(config: Arc<Config>) -> PipelineBuilder<D> {
        PipelineBuilder {
            config,
            engine: None,
            steps: Vec::new(),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|unit| unit.step.name())
    }

    /// Keeps one step per prefix, in the order the prefixes are given.
    pub fn select<S: AsRef<str>>(self, prefixes: &[S]) -> Result<Self, SelectError> {
        let mut picked = Vec::with_capacity(prefixes.len());

        for prefix in prefixes {
            let prefix = prefix.as_ref();
            let matches: Vec<usize> = self
                .units
                .iter()
                .enumerate()
                .filter(|(_, unit)| unit.step.name().starts_with(prefix))
                .map(|(i, _)| i)
                .collect();

            match matches.as_slice() {
                [] => return Err(SelectError::NotFound(prefix.to_string())),
                [i] => picked.push(*i),
                many => {
                    let names: Vec<&str> = many.iter().map(|&i| self.units[i].step.name()).collect();
                    return Err(SelectError::Ambiguous(prefix.to_string(), names.join(", ")));
                }
            }
        }

        let mut slots: Vec<Option<Unit<D>>> = self.units.into_iter().map(Some).collect();
        let units = picked.into_iter().filter_map(|i| slots[i].take()).collect();

        Ok(Self {
            config: self.config,
            engine: self.engine,
            units,
        })
    }

    /// Runs every step in order. The first failing step stops the pipeline.
    pub fn run(&self, mut data: D) -> Result<D, PipelineError> {
        let s = Instant::now();

        for (pos, unit) in self.units.iter().enumerate() {
            let name = unit.step.name();
            tracing::info!("{}", header(format!("Step {}: {} / {}", pos + 1, name, unit.info.id)));
            tracing::info!("{}", unit.info.description);

            let span = tracing::span!(Level::INFO, "step", id = %unit.info.id);
            let _enter = span.enter();

            let ctx = StepContext::new(&self.config, &self.engine, unit.info.clone(), unit.registry.clone());
            data = unit.step.run(&ctx, data).map_err(|err| match Fatal::find(&err) {
                Some(fatal) => PipelineError::Fatal(fatal.clone()),
                None => PipelineError::Step(name.to_string(), err),
            })?;
        }

        tracing::info!("Pipeline finished {}", as_overhead(s));
        Ok(data)
    }

    /// One step name per line.
    pub fn list(&self) -> String {
        self.names().map(|name| format!("{name}\n")).collect()
    }

    /// The outputs declared by every step.
    pub fn list_outputs(&self) -> String {
        let mut out = String::new();

        for unit in &self.units {
            let _ = writeln!(out, "\n{} - {}:", unit.info.id, unit.step.name());
            let _ = writeln!(out, "  {}", unit.info.description);

            let outputs = unit.registry.list(true);
            if outputs.is_empty() {
                let _ = writeln!(out, "  No registered outputs");
                continue;
            }

            let _ = writeln!(out, "  Outputs:");
            for output in outputs {
                let disabled = if output.enabled_by_default { "" } else { " (disabled by default)" };
                let _ = writeln!(
                    out,
                    "    {} {} - {}{disabled}",
                    marker(output.enabled_by_default),
                    output.name,
                    output.description
                );
            }
        }

        out
    }
}
