//! Two steps over a handful of generated recordings. Run it twice to see the
//! second run reuse the artifacts of the first.

use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use strata::{
    Apply, Config, Coords, Dataset, ItemState, Manifest, Outcome, OverwriteMode, Pipeline, Serializer, Step,
    StepContext,
};

struct Normalize;

impl Step<Dataset<String>> for Normalize {
    fn name(&self) -> &str {
        "01_normalize"
    }

    fn description(&self) -> &str {
        "Normalize"
    }

    fn run(&self, ctx: &StepContext<'_>, mut data: Dataset<String>) -> anyhow::Result<Dataset<String>> {
        ctx.apply(
            &mut data,
            |state, _| {
                let path = state.location().ok_or_else(|| anyhow::anyhow!("recording isn't on disk"))?;
                let text = fs::read_to_string(path)?;
                anyhow::ensure!(!text.trim().is_empty(), "empty recording");
                Outcome::object(text.trim().to_lowercase()).field("Characters", text.len())
            },
            Apply::new().serializer(Serializer::new(".txt", |path, text: &String| Ok(fs::write(path, text)?))),
        )?;
        Ok(data)
    }
}

struct Count;

impl Step<Dataset<String>> for Count {
    fn name(&self) -> &str {
        "02_count"
    }

    fn description(&self) -> &str {
        "Count words"
    }

    fn run(&self, ctx: &StepContext<'_>, mut data: Dataset<String>) -> anyhow::Result<Dataset<String>> {
        ctx.apply(
            &mut data,
            |state, _| {
                let text = match state {
                    ItemState::Memory(text) => text.clone(),
                    other => {
                        let path = other.location().ok_or_else(|| anyhow::anyhow!("nothing to count"))?;
                        fs::read_to_string(path)?
                    }
                };
                Ok(Outcome::object(text.split_whitespace().count().to_string()))
            },
            Apply::in_memory(),
        )?;
        Ok(data)
    }
}

fn write_recordings(root: &Utf8Path) -> anyhow::Result<Manifest> {
    let mut manifest = Manifest::new();
    let recordings = [("01", "1", "Alpha beta GAMMA"), ("01", "2", "delta"), ("02", "1", "   ")];

    for (subject, run, text) in recordings {
        let path = root.join(format!("raw/sub-{subject}_run-{run}.edf"));
        fs::create_dir_all(root.join("raw"))?;
        fs::write(&path, text)?;

        let coords = Coords::new(subject, "01", "rest", run);
        manifest
            .entry(coords.subject)
            .or_default()
            .entry(coords.session)
            .or_default()
            .entry(coords.task)
            .or_default()
            .insert(coords.run, path);
    }

    Ok(manifest)
}

fn main() -> anyhow::Result<()> {
    strata::logging::init()?;

    let dir = std::env::temp_dir().join("strata-trivial");
    let root = Utf8Path::from_path(&dir).ok_or_else(|| anyhow::anyhow!("temporary directory isn't UTF-8"))?;

    let mut config = Config::default()
        .with_deriv_root(root.join("derivatives"))
        .with_overwrite_mode(OverwriteMode::Never);
    config.sources = write_recordings(root)?;
    let config = Arc::new(config);

    let data = Dataset::from_manifest(&config.sources, &config.filter());
    let pipeline = Pipeline::builder(config).step(Normalize).step(Count).build()?;

    let data = pipeline.run(data)?;
    print!("{data}");
    Ok(())
}
