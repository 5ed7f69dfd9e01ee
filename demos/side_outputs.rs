//! A step declaring named side outputs, driven by the command line:
//!
//! ```text
//! cargo run --example side_outputs --features cli -- --list-outputs
//! cargo run --example side_outputs --features cli -- --run --outputs 'spectrum*,summary'
//! ```

use std::f64::consts::PI;
use std::process::ExitCode;
use std::sync::Arc;

use serde_json::json;
use strata::{
    Config, Coords, OutputDescriptor, OutputError, OutputRegistry, OverwriteMode, Pipeline, Step, StepContext, Table,
    Target,
};

struct Spectrum;

const BINS: usize = 8;

impl Step<Vec<Coords>> for Spectrum {
    fn name(&self) -> &str {
        "03_spectrum"
    }

    fn description(&self) -> &str {
        "Power spectrum of every recording"
    }

    fn register_outputs(&self, outputs: &mut OutputRegistry) -> Result<(), OutputError> {
        outputs.register(OutputDescriptor::new("spectrum").description("Power per frequency bin").suffix("psd"))?;
        outputs.register(OutputDescriptor::new("spectrum_table").description("Spectrum as a table"))?;
        outputs.register(
            OutputDescriptor::new("summary")
                .description("Peak bin of every recording")
                .existence_check(OverwriteMode::Always),
        )?;
        outputs.register(
            OutputDescriptor::new("raw_dump")
                .description("Debug dump of the samples")
                .disabled_by_default(),
        )
    }

    fn run(&self, ctx: &StepContext<'_>, recordings: Vec<Coords>) -> anyhow::Result<Vec<Coords>> {
        let outputs = ctx.outputs();
        let mut peaks = Vec::new();

        for coords in &recordings {
            let power: Vec<f64> = (0..BINS)
                .map(|bin| (bin as f64 * PI / BINS as f64).sin().powi(2) * (coords.run.len() as f64))
                .collect();
            let peak = power
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(bin, _)| bin)
                .unwrap_or_default();
            peaks.push(json!({ "coords": coords.to_string(), "peak": peak }));

            if ctx.should_generate("spectrum") {
                outputs.save_array(&power, &[BINS], "spectrum", "npy", Target::at(coords.clone()))?;
            }

            if ctx.should_generate("spectrum_table") {
                let table = power
                    .iter()
                    .enumerate()
                    .fold(Table::new(["bin", "power"]), |table, (bin, p)| table.row([json!(bin), json!(p)]));
                outputs.save_table(&table, "spectrum_table", "tsv", Target::at(coords.clone()))?;
            }

            if ctx.should_generate("raw_dump") {
                outputs.save_text(&format!("{power:?}"), "raw_dump", Target::at(coords.clone()))?;
            }
        }

        if ctx.should_generate("summary") {
            outputs.save_json(&peaks, "summary", Target::flat())?;
        }

        Ok(recordings)
    }
}

fn main() -> ExitCode {
    strata::cli::main(|config: Arc<Config>| {
        let recordings = vec![Coords::new("01", "01", "rest", "1"), Coords::new("02", "01", "rest", "1")];
        Ok((Pipeline::builder(config).step(Spectrum).build()?, recordings))
    })
}
