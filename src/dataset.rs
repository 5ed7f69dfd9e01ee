//! The hierarchical dataset walked by the engine.
//!
//! Items are addressed by four keys (subject → session → task → run). Every
//! level is a [`BTreeMap`], so iteration follows the sorted key order and is
//! reproducible across runs on identical input.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use camino::{Utf8Path, Utf8PathBuf};

/// Run key given to the single item produced by [`Dataset::concatenate_runs`].
pub const CONCATENATED_RUN: &str = "99";

/// Source manifest: subject → session → task → run → source file.
pub type Manifest = BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, Utf8PathBuf>>>>;

type Runs<T> = BTreeMap<String, ItemState<T>>;
type Tasks<T> = BTreeMap<String, Runs<T>>;
type Sessions<T> = BTreeMap<String, Tasks<T>>;

/// Coordinates of a single item.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coords {
    pub subject: String,
    pub session: String,
    pub task: String,
    pub run: String,
}

impl Coords {
    pub fn new(
        subject: impl Into<String>,
        session: impl Into<String>,
        task: impl Into<String>,
        run: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            session: session.into(),
            task: task.into(),
            run: run.into(),
        }
    }
}

impl Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject {}, session {}, task {}, run {}",
            self.subject, self.session, self.task, self.run
        )
    }
}

/// Opaque reference to the raw input of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A single source file.
    File(Utf8PathBuf),
    /// Several runs of the same task, in run order.
    Runs(Vec<Utf8PathBuf>),
}

/// The current state of a single item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState<T> {
    /// Raw input, not yet touched by any step.
    Source(Source),
    /// A result persisted at the given location.
    Artifact(Utf8PathBuf),
    /// A result kept in memory.
    Memory(T),
}

impl<T> ItemState<T> {
    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        ItemState::Source(Source::File(path.into()))
    }

    /// The on-disk location this state refers to, when it refers to exactly one.
    pub fn location(&self) -> Option<&Utf8Path> {
        match self {
            ItemState::Source(Source::File(path)) | ItemState::Artifact(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&T> {
        match self {
            ItemState::Memory(value) => Some(value),
            _ => None,
        }
    }
}

/// Allow-lists restricting which branches are visited. An empty list allows
/// everything on that level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub subjects: Vec<String>,
    pub sessions: Vec<String>,
    pub tasks: Vec<String>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn sessions<I, S>(mut self, sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sessions = sessions.into_iter().map(Into::into).collect();
        self
    }

    pub fn tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    /// Uses `self` where it restricts a level and `fallback` otherwise.
    pub fn or(&self, fallback: &Filter) -> Filter {
        let pick = |own: &Vec<String>, other: &Vec<String>| {
            if own.is_empty() { other.clone() } else { own.clone() }
        };

        Filter {
            subjects: pick(&self.subjects, &fallback.subjects),
            sessions: pick(&self.sessions, &fallback.sessions),
            tasks: pick(&self.tasks, &fallback.tasks),
        }
    }

    fn allows(list: &[String], key: &str) -> bool {
        list.is_empty() || list.iter().any(|item| item == key)
    }

    pub fn allows_subject(&self, subject: &str) -> bool {
        Self::allows(&self.subjects, subject)
    }

    pub fn allows_session(&self, session: &str) -> bool {
        Self::allows(&self.sessions, session)
    }

    pub fn allows_task(&self, task: &str) -> bool {
        Self::allows(&self.tasks, task)
    }

    pub fn allows_coords(&self, coords: &Coords) -> bool {
        self.allows_subject(&coords.subject)
            && self.allows_session(&coords.session)
            && self.allows_task(&coords.task)
    }
}

/// Hierarchical collection of items, mutated in place by the engine.
#[derive(Debug, Clone)]
pub struct Dataset<T> {
    tree: BTreeMap<String, Sessions<T>>,
}

impl<T> Default for Dataset<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dataset<T> {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    /// Builds a dataset of raw sources from a manifest, keeping only the
    /// branches allowed by `filter`.
    pub fn from_manifest(manifest: &Manifest, filter: &Filter) -> Self {
        let mut dataset = Self::new();

        for (subject, sessions) in manifest {
            for (session, tasks) in sessions {
                for (task, runs) in tasks {
                    for (run, path) in runs {
                        let coords = Coords::new(subject, session, task, run);
                        if filter.allows_coords(&coords) {
                            dataset.set(coords, ItemState::file(path.clone()));
                        }
                    }
                }
            }
        }

        dataset
    }

    pub fn get(&self, coords: &Coords) -> Option<&ItemState<T>> {
        self.tree
            .get(&coords.subject)?
            .get(&coords.session)?
            .get(&coords.task)?
            .get(&coords.run)
    }

    pub fn get_mut(&mut self, coords: &Coords) -> Option<&mut ItemState<T>> {
        self.tree
            .get_mut(&coords.subject)?
            .get_mut(&coords.session)?
            .get_mut(&coords.task)?
            .get_mut(&coords.run)
    }

    /// Stores `state` at `coords`, returning the previous state if any.
    pub fn set(&mut self, coords: Coords, state: ItemState<T>) -> Option<ItemState<T>> {
        let Coords {
            subject,
            session,
            task,
            run,
        } = coords;

        self.tree
            .entry(subject)
            .or_default()
            .entry(session)
            .or_default()
            .entry(task)
            .or_default()
            .insert(run, state)
    }

    /// Removes the item at `coords`. Branches left empty are pruned, so the
    /// coordinate is never observed again.
    pub fn delete(&mut self, coords: &Coords) -> Option<ItemState<T>> {
        let sessions = self.tree.get_mut(&coords.subject)?;
        let tasks = sessions.get_mut(&coords.session)?;
        let runs = tasks.get_mut(&coords.task)?;
        let removed = runs.remove(&coords.run);

        if runs.is_empty() {
            tasks.remove(&coords.task);
        }
        if tasks.is_empty() {
            sessions.remove(&coords.session);
        }
        if sessions.is_empty() {
            self.tree.remove(&coords.subject);
        }

        removed
    }

    /// Iterates over every item in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (Coords, &ItemState<T>)> {
        self.tree.iter().flat_map(|(subject, sessions)| {
            sessions.iter().flat_map(move |(session, tasks)| {
                tasks.iter().flat_map(move |(task, runs)| {
                    runs.iter()
                        .map(move |(run, state)| (Coords::new(subject, session, task, run), state))
                })
            })
        })
    }

    /// A view over the items allowed by `filter`. Nothing is copied, and the
    /// branches outside the filter are left untouched.
    pub fn filtered<'a>(
        &'a self,
        filter: &'a Filter,
    ) -> impl Iterator<Item = (Coords, &'a ItemState<T>)> + 'a {
        self.tree
            .iter()
            .filter(move |(subject, _)| filter.allows_subject(subject))
            .flat_map(move |(subject, sessions)| {
                sessions
                    .iter()
                    .filter(move |(session, _)| filter.allows_session(session))
                    .flat_map(move |(session, tasks)| {
                        tasks
                            .iter()
                            .filter(move |(task, _)| filter.allows_task(task))
                            .flat_map(move |(task, runs)| {
                                runs.iter().map(move |(run, state)| {
                                    (Coords::new(subject, session, task, run), state)
                                })
                            })
                    })
            })
    }

    /// Coordinates allowed by `filter`, in traversal order.
    pub fn coords(&self, filter: &Filter) -> Vec<Coords> {
        self.filtered(filter).map(|(coords, _)| coords).collect()
    }

    /// Drops every item not allowed by `filter`.
    pub fn retain(&mut self, filter: &Filter) {
        self.tree.retain(|subject, sessions| {
            if !filter.allows_subject(subject) {
                return false;
            }
            sessions.retain(|session, tasks| {
                if !filter.allows_session(session) {
                    return false;
                }
                tasks.retain(|task, runs| filter.allows_task(task) && !runs.is_empty());
                !tasks.is_empty()
            });
            !sessions.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.tree
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Merges all runs of each task into a single item keyed
    /// [`CONCATENATED_RUN`], holding the run locations in run order.
    ///
    /// Only branches allowed by `filter` survive. Items kept in memory have no
    /// location to concatenate and are dropped with a warning.
    pub fn concatenate_runs(&mut self, filter: &Filter) {
        self.retain(filter);

        for sessions in self.tree.values_mut() {
            for tasks in sessions.values_mut() {
                for (task, runs) in tasks.iter_mut() {
                    let mut files = Vec::new();

                    for (run, state) in std::mem::take(runs) {
                        match state {
                            ItemState::Source(Source::File(path)) | ItemState::Artifact(path) => {
                                files.push(path)
                            }
                            ItemState::Source(Source::Runs(paths)) => files.extend(paths),
                            ItemState::Memory(_) => {
                                tracing::warn!(
                                    "Run {run} of task {task} is held in memory and can't be concatenated, dropping it"
                                );
                            }
                        }
                    }

                    if !files.is_empty() {
                        runs.insert(
                            CONCATENATED_RUN.to_string(),
                            ItemState::Source(Source::Runs(files)),
                        );
                    }
                }
                tasks.retain(|_, runs| !runs.is_empty());
            }
            sessions.retain(|_, tasks| !tasks.is_empty());
        }
        self.tree.retain(|_, sessions| !sessions.is_empty());
    }
}

impl<T> Display for ItemState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Source(Source::File(path)) => write!(f, "{path}"),
            ItemState::Source(Source::Runs(paths)) => {
                let paths: Vec<_> = paths.iter().map(|path| path.as_str()).collect();
                write!(f, "[{}]", paths.join(", "))
            }
            ItemState::Artifact(path) => write!(f, "{path}"),
            ItemState::Memory(_) => write!(f, "<in memory>"),
        }
    }
}

impl<T> Display for Dataset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "Dataset with no items.");
        }

        writeln!(f, "Dataset handling the following items:")?;
        for (subject, sessions) in &self.tree {
            writeln!(f, "| Subject {subject}")?;
            for (session, tasks) in sessions {
                writeln!(f, "|--- Session {session}")?;
                for (task, runs) in tasks {
                    writeln!(f, "|----- Task {task}")?;
                    for (run, state) in runs {
                        writeln!(f, "|------- Run {run}: {state}")?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        let mut manifest = Manifest::new();
        for (subject, session, task, run, file) in [
            ("02", "01", "rest", "1", "raw/02_rest_1.edf"),
            ("01", "01", "rest", "2", "raw/01_rest_2.edf"),
            ("01", "01", "rest", "1", "raw/01_rest_1.edf"),
            ("01", "02", "motor", "1", "raw/01_motor_1.edf"),
        ] {
            manifest
                .entry(subject.into())
                .or_default()
                .entry(session.into())
                .or_default()
                .entry(task.into())
                .or_default()
                .insert(run.into(), file.into());
        }
        manifest
    }

    #[test]
    fn test_iteration_order_is_sorted() {
        let dataset: Dataset<()> = Dataset::from_manifest(&manifest(), &Filter::all());
        let order: Vec<_> = dataset.iter().map(|(c, _)| (c.subject, c.task, c.run)).collect();
        assert_eq!(
            order,
            vec![
                ("01".into(), "rest".into(), "1".into()),
                ("01".into(), "rest".into(), "2".into()),
                ("01".into(), "motor".into(), "1".into()),
                ("02".into(), "rest".into(), "1".into()),
            ]
        );
    }

    #[test]
    fn test_manifest_filter() {
        let filter = Filter::all().subjects(["01"]).tasks(["rest"]);
        let dataset: Dataset<()> = Dataset::from_manifest(&manifest(), &filter);
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_filtered_view_leaves_other_branches() {
        let dataset: Dataset<()> = Dataset::from_manifest(&manifest(), &Filter::all());
        let filter = Filter::all().sessions(["02"]);
        let coords = dataset.coords(&filter);
        assert_eq!(coords, vec![Coords::new("01", "02", "motor", "1")]);
        assert_eq!(dataset.len(), 4);
    }

    #[test]
    fn test_delete_prunes_and_stays_deleted() {
        let mut dataset: Dataset<()> = Dataset::from_manifest(&manifest(), &Filter::all());
        let gone = Coords::new("02", "01", "rest", "1");

        assert!(dataset.delete(&gone).is_some());
        assert!(dataset.get(&gone).is_none());
        assert!(dataset.iter().all(|(c, _)| c != gone));
        assert!(dataset.delete(&gone).is_none());
        assert_eq!(dataset.len(), 3);
        assert!(!dataset.to_string().contains("Subject 02"));
    }

    #[test]
    fn test_concatenate_runs() {
        let mut dataset: Dataset<()> = Dataset::from_manifest(&manifest(), &Filter::all());
        dataset.concatenate_runs(&Filter::all().subjects(["01"]));

        assert_eq!(dataset.len(), 2);
        let state = dataset.get(&Coords::new("01", "01", "rest", CONCATENATED_RUN)).unwrap();
        assert_eq!(
            state,
            &ItemState::Source(Source::Runs(vec![
                "raw/01_rest_1.edf".into(),
                "raw/01_rest_2.edf".into()
            ]))
        );
        assert_eq!(state.to_string(), "[raw/01_rest_1.edf, raw/01_rest_2.edf]");
    }

    #[test]
    fn test_display_tree() {
        let mut dataset: Dataset<u32> = Dataset::new();
        dataset.set(Coords::new("01", "01", "rest", "1"), ItemState::Memory(4));
        let text = dataset.to_string();
        assert!(text.contains("| Subject 01"));
        assert!(text.contains("|------- Run 1: <in memory>"));

        let empty: Dataset<u32> = Dataset::new();
        assert_eq!(empty.to_string(), "Dataset with no items.\n");
    }

    #[test]
    fn test_filter_or_fallback() {
        let own = Filter::all().tasks(["rest"]);
        let config = Filter::all().subjects(["01"]).tasks(["motor"]);
        let merged = own.or(&config);
        assert_eq!(merged.subjects, vec!["01".to_string()]);
        assert_eq!(merged.tasks, vec!["rest".to_string()]);
    }
}
