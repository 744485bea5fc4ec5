//! Staged files, the JSON batch report and the terminal summary.

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

use crate::{
    commit::CommitReport,
    engine::{BatchOutcome, BatchSummary, PassStats},
    error::ErrorClass,
    io_utils,
    schema::Schema,
    table::{self, Align},
    transform::{DuplicateNotice, RejectedRow, RowPosition},
};

pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, Serialize)]
pub struct ViolationEntry {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub entity: String,
    pub position: RowPosition,
    pub pass: usize,
    pub class: ErrorClass,
    pub violations: Vec<ViolationEntry>,
}

impl From<&RejectedRow> for ErrorEntry {
    fn from(row: &RejectedRow) -> Self {
        ErrorEntry {
            entity: row.entity.clone(),
            position: row.position.clone(),
            pass: row.pass,
            class: row.class,
            violations: row
                .violations
                .iter()
                .map(|violation| ViolationEntry {
                    kind: violation.kind(),
                    message: violation.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub history: Vec<PassStats>,
    /// Rows rejected for their own data.
    pub errors: Vec<ErrorEntry>,
    /// Rows whose lookup key matched several rows or was missing.
    pub fk_errors: Vec<ErrorEntry>,
    /// Rows still waiting on a foreign key.
    pub unresolved: Vec<ErrorEntry>,
    pub duplicates: Vec<DuplicateNotice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitReport>,
}

impl BatchReport {
    pub fn new(outcome: &BatchOutcome, commit: Option<CommitReport>) -> Self {
        BatchReport {
            summary: outcome.summary(),
            history: outcome.history.clone(),
            errors: outcome
                .outcomes()
                .flat_map(|entity| entity.data_errors())
                .map(ErrorEntry::from)
                .collect(),
            fk_errors: outcome
                .outcomes()
                .flat_map(|entity| entity.fk_errors())
                .map(ErrorEntry::from)
                .collect(),
            unresolved: outcome
                .outcomes()
                .flat_map(|entity| &entity.unresolved)
                .map(ErrorEntry::from)
                .collect(),
            duplicates: outcome
                .outcomes()
                .flat_map(|entity| entity.duplicates.iter().cloned())
                .collect(),
            commit,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Creating {parent:?}"))?;
        }
        let file = File::create(path).with_context(|| format!("Creating report {path:?}"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("Writing report {path:?}"))
    }
}

/// Writes `<dir>/<ENTITY>.csv` for every entity with staged rows, aligned to
/// the store header or, for new tables, the declared field order. Files left
/// by an earlier run for entities with nothing staged now are removed.
pub fn write_staged(
    dir: &Path,
    schema: &Schema,
    outcome: &BatchOutcome,
    delimiter: u8,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("Creating staging directory {dir:?}"))?;
    let mut written = Vec::new();
    for entity in outcome.outcomes().filter(|entity| !entity.staged.is_empty()) {
        let definition = schema.require_entity(&entity.name)?;
        let columns = definition.output_columns();
        let path = dir.join(format!("{}.csv", entity.name));
        let mut writer = io_utils::create_csv_writer(&path, delimiter)?;
        writer
            .write_record(&columns)
            .with_context(|| format!("Writing header to {path:?}"))?;
        for row in &entity.staged {
            writer
                .write_record(columns.iter().map(|column| row.cell(column)))
                .with_context(|| format!("Writing staged row {} to {path:?}", row.position))?;
        }
        writer.flush().with_context(|| format!("Flushing {path:?}"))?;
        info!("Staged {} row(s) of {} to {path:?}", entity.staged.len(), entity.name);
        written.push(path);
    }
    for entity in schema.entities.keys() {
        let path = dir.join(format!("{entity}.csv"));
        if outcome.staged(entity).is_empty() && path.is_file() {
            fs::remove_file(&path).with_context(|| format!("Removing stale {path:?}"))?;
            info!("Removed stale staged file {path:?}");
        }
    }
    Ok(written)
}

pub fn render_summary(summary: &BatchSummary) -> String {
    let rows = summary
        .entities
        .iter()
        .map(|entity| {
            vec![
                entity.entity.clone(),
                format!("{:?}", entity.state),
                entity.valid.to_string(),
                entity.duplicates.to_string(),
                entity.errors.to_string(),
                entity.fk_errors.to_string(),
                entity.unresolved.to_string(),
            ]
        })
        .collect::<Vec<_>>();
    let mut rendered = table::render_table(
        &[
            "entity",
            "state",
            "valid",
            "duplicates",
            "errors",
            "fk errors",
            "unresolved",
        ],
        &[
            Align::Left,
            Align::Right,
            Align::Left,
            Align::Right,
            Align::Right,
            Align::Right,
            Align::Right,
        ],
        &rows,
    );
    let verdict = if summary.converged {
        "converged"
    } else {
        "stopped at pass limit"
    };
    rendered.push_str(&format!("{} pass(es), {verdict}\n", summary.passes));
    rendered
}

pub fn print_summary(summary: &BatchSummary) {
    print!("{}", render_summary(summary));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EntityState, EntitySummary, StopReason};

    #[test]
    fn summary_lists_counts_and_verdict() {
        let summary = BatchSummary {
            passes: 2,
            converged: true,
            stop_reason: StopReason::Exhausted,
            entities: vec![EntitySummary {
                entity: "VENDORS".to_string(),
                state: EntityState::Converged,
                valid: 2,
                duplicates: 1,
                errors: 0,
                fk_errors: 0,
                unresolved: 0,
            }],
        };
        let rendered = render_summary(&summary);
        assert!(rendered.starts_with("entity "));
        assert!(rendered.contains("VENDORS  Converged"));
        assert!(rendered.ends_with("2 pass(es), converged\n"));
    }
}
