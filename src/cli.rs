//! Command line front end for binaries driving a [`Pipeline`].

use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{CommandFactory, Parser};
use console::style;

use crate::config::Config;
use crate::dataset::Filter;
use crate::error::{Fatal, PipelineError};
use crate::registry::OutputSpec;
use crate::report::Report;
use crate::step::Pipeline;

#[derive(Debug, Default, Parser)]
#[command(version, about = "Run processing steps over a subject/session/task/run dataset")]
pub struct Args {
    /// Run the pipeline
    #[arg(short, long)]
    pub run: bool,

    /// Steps to run, each given by a unique prefix of its name
    #[arg(value_name = "STEP")]
    pub steps: Vec<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<Utf8PathBuf>,

    /// List all steps
    #[arg(short, long)]
    pub list: bool,

    /// List the registered outputs of every step
    #[arg(long)]
    pub list_outputs: bool,

    /// Answer every question with its default answer
    #[arg(long)]
    pub ignore_questions: bool,

    /// Outputs to generate, e.g. `plot*` or `01:plot,02:*`
    #[arg(long, value_name = "SPEC")]
    pub outputs: Option<OutputSpec>,

    /// Outputs to skip, same syntax as `--outputs`
    #[arg(long, value_name = "SPEC")]
    pub skip_outputs: Option<OutputSpec>,

    /// Print an inventory of the source and derivative directories
    #[arg(long)]
    pub report: bool,

    /// Store the inventory as TSV files in the derivatives directory
    #[arg(long)]
    pub store_report: bool,

    /// Inventory everything, ignoring the subject, session and task filters
    #[arg(long)]
    pub full_report: bool,
}

impl Args {
    /// The configuration file, if any, with the command line flags layered on
    /// top.
    pub fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if self.ignore_questions {
            config = config.with_auto_response("default");
        }
        if self.outputs.is_some() {
            config = config.with_outputs_to_generate(self.outputs.clone());
        }
        if self.skip_outputs.is_some() {
            config = config.with_outputs_to_skip(self.skip_outputs.clone());
        }

        Ok(config)
    }

    fn wants_report(&self) -> bool {
        self.report || self.store_report || self.full_report
    }
}

/// Parses the process arguments, sets up logging and runs.
pub fn main<D, F>(build: F) -> ExitCode
where
    F: FnOnce(Arc<Config>) -> anyhow::Result<(Pipeline<D>, D)>,
{
    if let Err(e) = crate::logging::init() {
        eprintln!("{e}");
    }
    run(Args::parse(), build)
}

/// Carries out the action requested by `args`. `build` assembles the pipeline
/// and its initial data from the loaded configuration.
pub fn run<D, F>(args: Args, build: F) -> ExitCode
where
    F: FnOnce(Arc<Config>) -> anyhow::Result<(Pipeline<D>, D)>,
{
    match dispatch(args, build) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::Fatal(fatal)) => tracing::error!("{fatal}"),
                _ => match Fatal::find(&e) {
                    Some(fatal) => tracing::error!("Fatal: {fatal}"),
                    None => tracing::error!("{e:#}"),
                },
            }
            ExitCode::FAILURE
        }
    }
}

fn dispatch<D, F>(args: Args, build: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<Config>) -> anyhow::Result<(Pipeline<D>, D)>,
{
    let actions = args.run || args.list || args.list_outputs || args.wants_report();
    if !actions {
        Args::command().print_help()?;
        return Ok(());
    }

    let config = Arc::new(args.config()?);

    if args.wants_report() && !(args.run || args.list || args.list_outputs) {
        return report(&config, args.store_report, args.full_report);
    }

    let (pipeline, data) = build(config.clone())?;

    if args.list_outputs {
        println!("{}", style("Registered outputs").bold());
        print!("{}", pipeline.list_outputs());
    } else if args.run {
        let pipeline = if args.steps.is_empty() {
            tracing::info!("Running entire pipeline");
            pipeline
        } else {
            let pipeline = pipeline.select(&args.steps)?;
            tracing::info!("Running the steps: {}", pipeline.names().collect::<Vec<_>>().join(", "));
            pipeline
        };
        pipeline.run(data)?;
    } else if args.list {
        println!("{}", style("Steps").bold());
        print!("{}", pipeline.list());
    }

    Ok(())
}

fn report(config: &Config, store: bool, full: bool) -> anyhow::Result<()> {
    tracing::info!("Generating {} report", if full { "full" } else { "limited" });
    let filter = if full { Filter::all() } else { config.filter() };

    for (label, root) in [("bids", &config.bids_root), ("deriv", &config.deriv_root)] {
        if !root.is_dir() {
            tracing::error!("Directory {root} does not exist, skipping its report");
            continue;
        }

        let report = Report::scan(root, &filter)?;
        println!("{}", style(format!("Report for {root}")).bold());
        print!("{report}");

        if store {
            let path = config.deriv_root.join(format!("pipeline_report_{label}_dir.tsv"));
            report.write_tsv(&path)?;
            tracing::info!("Stored report in {path}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "strata",
            "--run",
            "01",
            "03",
            "--ignore-questions",
            "--outputs",
            "01:plot,02:*",
            "--skip-outputs",
            "debug*",
        ])
        .unwrap();

        assert!(args.run);
        assert_eq!(args.steps, ["01", "03"]);
        assert_eq!(args.skip_outputs, Some(OutputSpec::Global(vec!["debug*".into()])));

        let config = args.config().unwrap();
        assert_eq!(config.auto_response, "default");
        assert!(matches!(config.outputs_to_generate, Some(OutputSpec::Scoped(_))));
    }

    #[test]
    fn test_unknown_step_fails() {
        let args = Args::try_parse_from(["strata", "--run", "07"]).unwrap();
        let result = dispatch(args, |config| Ok((Pipeline::<()>::builder(config).build()?, ())));
        assert!(result.unwrap_err().to_string().contains("07"));
    }
}
