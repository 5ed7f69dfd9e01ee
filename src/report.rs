//! Inventory of the artifacts found in a directory tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::fs;

use camino::Utf8Path;
use glob::Pattern;

use crate::dataset::Filter;
use crate::error::{LookupError, OutputError};
use crate::path::parse_entities;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub runs: BTreeSet<String>,
    pub descriptions: BTreeSet<String>,
}

/// One row per subject, session and task, listing the runs found and which
/// descriptions are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub descriptions: BTreeSet<String>,
    pub rows: BTreeMap<(String, String, String), Row>,
}

impl Report {
    pub fn scan(root: &Utf8Path, filter: &Filter) -> Result<Self, LookupError> {
        let pattern = format!("{}/sub-*/**/*", Pattern::escape(root.as_str()));
        let mut report = Report::default();

        for entry in glob::glob(&pattern)? {
            let path = camino::Utf8PathBuf::try_from(entry?)?;
            if !path.is_file() {
                continue;
            }
            let Some(parsed) = path.file_name().and_then(parse_entities) else {
                continue;
            };
            if parsed.extension.ends_with(".json") {
                continue;
            }

            let coords = parsed.coords();
            if !filter.allows_coords(&coords) {
                continue;
            }

            let row = report
                .rows
                .entry((coords.subject, coords.session, coords.task))
                .or_default();
            if !coords.run.is_empty() {
                row.runs.insert(coords.run);
            }
            if let Some(desc) = parsed.get("desc") {
                row.descriptions.insert(desc.to_string());
                report.descriptions.insert(desc.to_string());
            }
        }

        Ok(report)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn cells(&self) -> Vec<Vec<String>> {
        let mut table = vec![
            ["subject", "session", "task", "runs"]
                .into_iter()
                .map(String::from)
                .chain(self.descriptions.iter().cloned())
                .collect::<Vec<_>>(),
        ];

        for ((subject, session, task), row) in &self.rows {
            let runs: Vec<&str> = row.runs.iter().map(String::as_str).collect();
            let mut line = vec![subject.clone(), session.clone(), task.clone(), runs.join(", ")];
            line.extend(
                self.descriptions
                    .iter()
                    .map(|desc| if row.descriptions.contains(desc) { "✓" } else { "-" }.to_string()),
            );
            table.push(line);
        }

        table
    }

    pub fn to_tsv(&self) -> String {
        let mut out = String::new();
        for line in self.cells() {
            let line: Vec<String> = line
                .into_iter()
                .map(|cell| match cell.as_str() {
                    "✓" => "true".into(),
                    "-" => "false".into(),
                    _ => cell,
                })
                .collect();
            out.push_str(&line.join("\t"));
            out.push('\n');
        }
        out
    }

    pub fn write_tsv(&self, path: &Utf8Path) -> Result<(), OutputError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OutputError::Io(parent.to_owned(), e))?;
        }
        fs::write(path, self.to_tsv()).map_err(|e| OutputError::Io(path.to_owned(), e))
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No artifacts found.");
        }

        let cells = self.cells();
        let columns = cells[0].len();
        let widths: Vec<usize> = (0..columns)
            .map(|i| cells.iter().map(|line| line[i].chars().count()).max().unwrap_or(0))
            .collect();

        for line in &cells {
            let padded: Vec<String> = line
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect();
            writeln!(f, "{}", padded.join("  ").trim_end())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Utf8Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_scan_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01Filter_eeg.fif");
        touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-1_desc-01Filter_eeg.json");
        touch(root, "sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-2_desc-02Epochs_eeg.fif");
        touch(root, "sub-02/ses-01/eeg/sub-02_ses-01_task-rest_run-1_desc-01Filter_eeg.fif");

        let report = Report::scan(root, &Filter::all()).unwrap();
        assert_eq!(report.rows.len(), 2);
        let row = &report.rows[&("01".into(), "01".into(), "rest".into())];
        assert_eq!(row.runs.iter().collect::<Vec<_>>(), ["1", "2"]);

        let tsv = report.to_tsv();
        assert_eq!(tsv.lines().next(), Some("subject\tsession\ttask\truns\t01Filter\t02Epochs"));
        assert!(tsv.contains("02\t01\trest\t1\ttrue\tfalse"));

        let text = report.to_string();
        assert!(text.starts_with("subject"));

        let filtered = Report::scan(root, &Filter::all().subjects(["02"])).unwrap();
        assert_eq!(filtered.rows.len(), 1);
    }

    #[test]
    fn test_write_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let report = Report::default();
        let path = root.join("deriv").join("pipeline_report_deriv_dir.tsv");
        report.write_tsv(&path).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "subject\tsession\ttask\truns\n");
        assert_eq!(report.to_string(), "No artifacts found.\n");
    }
}
