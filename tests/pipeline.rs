use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};
use strata::{
    Apply, Config, Coords, Dataset, Filter, ItemState, Outcome, OutputDescriptor, OutputError, OutputRegistry,
    OutputSpec, OverwriteMode, Pipeline, PipelineError, Report, Serializer, Step, StepContext, Target, lookup,
};

struct Scratch {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
}

fn scratch() -> Scratch {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
    Scratch { _dir: dir, root }
}

fn config(root: &Utf8Path) -> Config {
    let mut config = Config::default()
        .with_deriv_root(root.join("derivatives"))
        .with_overwrite_mode(OverwriteMode::Never)
        .with_auto_response("default")
        .with_version("test");

    for subject in ["01", "02"] {
        let path = root.join(format!("raw/sub-{subject}.edf"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("samples of {subject}")).unwrap();
        config
            .sources
            .entry(subject.into())
            .or_default()
            .entry("01".into())
            .or_default()
            .entry("rest".into())
            .or_default()
            .insert("1".into(), path);
    }

    config
}

struct Filter01;

impl Step<Dataset<String>> for Filter01 {
    fn name(&self) -> &str {
        "01_filter"
    }

    fn description(&self) -> &str {
        "Filter"
    }

    fn register_outputs(&self, outputs: &mut OutputRegistry) -> Result<(), OutputError> {
        outputs.register(OutputDescriptor::new("psd").description("Power spectrum").suffix("psd"))?;
        outputs.register(OutputDescriptor::new("stats").description("Summary statistics"))?;
        outputs.register(OutputDescriptor::new("debug").description("Raw dump").disabled_by_default())
    }

    fn run(&self, ctx: &StepContext<'_>, mut data: Dataset<String>) -> anyhow::Result<Dataset<String>> {
        ctx.apply(
            &mut data,
            |state, _| {
                let path = state.location().ok_or_else(|| anyhow::anyhow!("no file"))?;
                Ok(Outcome::object(fs::read_to_string(path)?.to_uppercase()))
            },
            Apply::new().serializer(Serializer::new(".txt", |path, text: &String| Ok(fs::write(path, text)?))),
        )?;

        for coords in data.coords(&Filter::all()) {
            if ctx.should_generate("psd") {
                ctx.outputs()
                    .save_figure(b"%PDF", "psd", None, Target::at(coords.clone()))?;
            }
            if ctx.should_generate("debug") {
                ctx.outputs().save_text("debug", "debug", Target::at(coords.clone()))?;
            }
        }

        if ctx.should_generate("stats") {
            ctx.outputs()
                .save_json(&json!({ "items": data.len() }), "stats", Target::flat())?;
        }

        Ok(data)
    }
}

struct Reload;

impl Step<Dataset<String>> for Reload {
    fn name(&self) -> &str {
        "02_reload"
    }

    fn description(&self) -> &str {
        "Reload"
    }

    fn run(&self, ctx: &StepContext<'_>, _: Dataset<String>) -> anyhow::Result<Dataset<String>> {
        let mut fresh = Dataset::from_manifest(&ctx.config().sources, &ctx.config().filter());
        fresh.set(
            Coords::new("03", "01", "rest", "1"),
            ItemState::file(ctx.config().data_dir.join("missing.edf")),
        );

        let report = ctx.apply(&mut fresh, lookup::from_derivatives("01Filter"), Apply::in_memory())?;
        anyhow::ensure!(report.dropped == vec![Coords::new("03", "01", "rest", "1")]);
        Ok(fresh)
    }
}

fn pipeline(config: Config) -> Pipeline<Dataset<String>> {
    Pipeline::builder(Arc::new(config))
        .step(Filter01)
        .step(Reload)
        .build()
        .unwrap()
}

fn files_under(root: &Utf8Path) -> Vec<String> {
    let mut files: Vec<String> = glob::glob(&format!("{root}/**/*"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .map(|path| path.strip_prefix(root).unwrap().to_string_lossy().into_owned())
        .collect();
    files.sort();
    files
}

#[test]
fn default_selection_skips_disabled_outputs() {
    let tmp = scratch();
    let config = config(&tmp.root);
    let data = Dataset::from_manifest(&config.sources, &config.filter());
    let deriv = config.deriv_root.clone();

    let data = pipeline(config).run(data).unwrap();

    let artifact = deriv.join("sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01Filter_eeg.txt");
    assert_eq!(data.get(&Coords::new("01", "01", "rest", "1")), Some(&ItemState::Artifact(artifact)));

    let files = files_under(&deriv);
    assert!(files.contains(&"sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01_psd_psd.pdf".into()));
    assert!(files.contains(&"sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01_psd_psd.pdf.json".into()));
    assert!(files.contains(&"01_stats_data.json".into()));
    assert!(!files.iter().any(|file| file.contains("debug")));

    let stats: Value = serde_json::from_str(&fs::read_to_string(deriv.join("01_stats_data.json")).unwrap()).unwrap();
    assert_eq!(stats, json!({ "items": 2 }));
}

#[test]
fn scoped_selection_and_skip() {
    let tmp = scratch();
    let config = config(&tmp.root)
        .with_outputs_to_generate(Some("01:debug,01:psd".parse().unwrap()))
        .with_outputs_to_skip(Some(OutputSpec::Global(vec!["ps*".into()])));
    let data = Dataset::from_manifest(&config.sources, &config.filter());
    let deriv = config.deriv_root.clone();

    pipeline(config).run(data).unwrap();

    let files = files_under(&deriv);
    assert!(files.iter().any(|file| file.ends_with("desc-01_debug_log.txt")));
    assert!(!files.iter().any(|file| file.contains("_psd")));
    assert!(!files.iter().any(|file| file.contains("stats")));
}

#[test]
fn selected_steps_and_report() {
    let tmp = scratch();
    let config = config(&tmp.root);
    let data = Dataset::from_manifest(&config.sources, &config.filter());
    let deriv = config.deriv_root.clone();

    let only_first = pipeline(config.clone()).select(&["01"]).unwrap();
    assert_eq!(only_first.len(), 1);
    only_first.run(data).unwrap();

    let report = Report::scan(&deriv, &Filter::all()).unwrap();
    assert_eq!(report.rows.len(), 2);
    assert!(report.descriptions.contains("01Filter"));
    assert!(report.descriptions.contains("01_psd"));

    let reloaded: Dataset<()> = lookup::scan(&deriv, "01Filter", &Filter::all().subjects(["02"])).unwrap();
    assert_eq!(reloaded.len(), 1);
}

#[test]
fn failing_step_names_itself() {
    struct Broken;

    impl Step<Dataset<String>> for Broken {
        fn name(&self) -> &str {
            "05_broken"
        }

        fn description(&self) -> &str {
            "Broken"
        }

        fn run(&self, _: &StepContext<'_>, _: Dataset<String>) -> anyhow::Result<Dataset<String>> {
            anyhow::bail!("configuration is missing a montage")
        }
    }

    let tmp = scratch();
    let pipeline = Pipeline::builder(Arc::new(config(&tmp.root)))
        .step(Broken)
        .build()
        .unwrap();

    match pipeline.run(Dataset::new()) {
        Err(PipelineError::Step(name, err)) => {
            assert_eq!(name, "05_broken");
            assert!(err.to_string().contains("montage"));
        }
        other => panic!("unexpected result {:?}", other.map(|data| data.len())),
    }
}
