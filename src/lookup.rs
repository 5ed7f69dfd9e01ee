//! Finding artifacts produced by earlier runs.

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::config::Config;
use crate::dataset::{Dataset, Filter, ItemState};
use crate::engine::Outcome;
use crate::error::LookupError;
use crate::path::{ArtifactId, parse_entities};

const SIDECAR_EXTENSION: &str = ".json";

fn glob_paths(pattern: &str) -> Result<Vec<Utf8PathBuf>, LookupError> {
    let mut paths = Vec::new();
    for entry in glob::glob(pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Glob pattern matching the artifact `id` describes. An empty suffix or
/// extension matches any.
pub fn pattern_for(id: &ArtifactId) -> String {
    let entities: Vec<String> = id
        .entities()
        .into_iter()
        .map(|(entity, label)| format!("{}-{label}", entity.key()))
        .collect();

    let mut name = Pattern::escape(&entities.join("_"));
    if id.suffix.is_empty() {
        name.push_str("_*");
    } else {
        name.push('_');
        name.push_str(&Pattern::escape(&id.suffix));
    }
    if id.extension.is_empty() {
        name.push_str(".*");
    } else {
        name.push_str(&Pattern::escape(&id.extension));
    }

    format!("{}/{name}", Pattern::escape(id.directory().as_str()))
}

/// The single existing file matching `id`. Sidecars are never matched unless
/// asked for by extension.
pub fn find_unique(id: &ArtifactId) -> Result<Utf8PathBuf, LookupError> {
    let pattern = pattern_for(id);
    let mut matches = glob_paths(&pattern)?;

    if id.extension != SIDECAR_EXTENSION {
        matches.retain(|path| !path.as_str().ends_with(SIDECAR_EXTENSION));
    }

    match matches.len() {
        0 => Err(LookupError::NotFound(pattern)),
        1 => Ok(matches.remove(0)),
        count => Err(LookupError::Ambiguous { pattern, count }),
    }
}

/// Worker re-pointing each item at its artifact with the given description.
///
/// A missing or ambiguous artifact fails the item, which the engine then
/// drops.
pub fn from_derivatives<T>(
    description: impl Into<String>,
) -> impl FnMut(&ItemState<T>, &ArtifactId) -> anyhow::Result<Outcome<T>> {
    let description = description.into();
    move |_, id| {
        let query = id.clone().description(&description);
        let path = find_unique(&query)?;
        Ok(Outcome::state(ItemState::Artifact(path)))
    }
}

/// Worker re-pointing each item at its raw recording under `bids_root`, the
/// `<datatype>` file with `source_extension` and no description.
///
/// A missing recording fails the item.
pub fn from_bids<T>(config: &Config) -> impl FnMut(&ItemState<T>, &ArtifactId) -> anyhow::Result<Outcome<T>> + use<T> {
    let root = config.bids_root.clone();
    let datatype = config.datatype.clone();
    let extension = config.source_extension.clone();
    let acquisition = config.acquisition.clone();

    move |_, id| {
        let query = ArtifactId::new(&root, id.coords.clone())
            .datatype(&datatype)
            .suffix(&datatype)
            .extension(&extension)
            .acquisition(acquisition.clone());
        let path = find_unique(&query)?;
        Ok(Outcome::state(ItemState::file(path)))
    }
}

/// Builds a dataset from the artifacts found under `root` carrying
/// `description`.
pub fn scan<T>(root: &Utf8Path, description: &str, filter: &Filter) -> Result<Dataset<T>, LookupError> {
    let pattern = format!("{}/sub-*/**/*", Pattern::escape(root.as_str()));
    let mut dataset = Dataset::new();

    for path in glob_paths(&pattern)? {
        let Some(parsed) = path.file_name().and_then(parse_entities) else {
            continue;
        };
        if parsed.extension == SIDECAR_EXTENSION || parsed.get("desc") != Some(description) {
            continue;
        }

        let coords = parsed.coords();
        if !filter.allows_coords(&coords) {
            continue;
        }

        if let Some(previous) = dataset.set(coords.clone(), ItemState::Artifact(path)) {
            tracing::warn!("Several artifacts for {coords} with description {description}, ignoring {previous}");
        }
    }

    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::dataset::Coords;

    fn touch(root: &Utf8Path, rel: &str) -> Utf8PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "").unwrap();
        path
    }

    fn id(root: &Utf8Path, subject: &str) -> ArtifactId {
        ArtifactId::new(root, Coords::new(subject, "01", "rest", "1"))
            .description("01Filter")
            .datatype("eeg")
    }

    #[test]
    fn test_find_unique() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let fif = touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01Filter_eeg.fif");
        touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01Filter_eeg.json");
        touch(root, "sub-02/ses-01/eeg/sub-02_ses-01_task-rest_run-1_desc-01Filter_eeg.fif");
        touch(root, "sub-02/ses-01/eeg/sub-02_ses-01_task-rest_run-1_desc-01Filter_markers.fif");

        assert_eq!(find_unique(&id(root, "01")).unwrap(), fif);
        assert_eq!(find_unique(&id(root, "01").suffix("eeg").extension("fif")).unwrap(), fif);

        let ambiguous = find_unique(&id(root, "02")).unwrap_err();
        assert!(matches!(ambiguous, LookupError::Ambiguous { count: 2, .. }));
        assert!(find_unique(&id(root, "02").suffix("eeg")).is_ok());

        assert!(matches!(find_unique(&id(root, "03")), Err(LookupError::NotFound(_))));
    }

    #[test]
    fn test_from_bids() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let edf = touch(root, "bids/sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_eeg.edf");
        touch(root, "bids/sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_eeg.json");
        touch(root, "bids/sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_channels.tsv");
        touch(root, "bids/sub-02/ses-01/eeg/sub-02_ses-01_task-rest_run-1_eeg.vhdr");

        let mut config = Config::default();
        config.bids_root = root.join("bids");
        let mut worker = from_bids::<()>(&config);

        let at = |subject: &str| ArtifactId::new(root.join("derivatives"), Coords::new(subject, "01", "rest", "1"));
        let outcome = worker(&ItemState::file("elsewhere.edf"), &at("01")).unwrap();
        assert_eq!(outcome, Outcome::state(ItemState::file(edf)));

        let err = worker(&ItemState::file("elsewhere.edf"), &at("02")).unwrap_err();
        assert!(matches!(err.downcast_ref::<LookupError>(), Some(LookupError::NotFound(_))));

        config.source_extension = "vhdr".into();
        let mut worker = from_bids::<()>(&config);
        assert!(worker(&ItemState::file("elsewhere.edf"), &at("02")).is_ok());
    }

    #[test]
    fn test_scan() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01Filter_eeg.fif");
        touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01Filter_eeg.json");
        touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-2_desc-01Filter_eeg.fif");
        touch(root, "sub-02/ses-01/eeg/sub-02_ses-01_task-rest_run-1_desc-02Epochs_eeg.fif");
        touch(root, "sub-03/ses-01/eeg/sub-03_ses-01_task-rest_run-1_desc-01Filter_eeg.fif");

        let all: Dataset<()> = scan(root, "01Filter", &Filter::all()).unwrap();
        assert_eq!(all.len(), 3);

        let some: Dataset<()> = scan(root, "01Filter", &Filter::all().subjects(["03"])).unwrap();
        assert_eq!(some.coords(&Filter::all()), vec![Coords::new("03", "01", "rest", "1")]);
    }
}
