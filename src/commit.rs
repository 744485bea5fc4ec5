//! Appends staged rows to the persistent store.
//!
//! Every file that is about to change is snapshotted into the backup
//! directory first. Each entity is then written through a temporary copy that
//! replaces the original in one rename, so a failed entity never leaves a
//! half-written table behind; entities already written in the same commit are
//! restored from their snapshots.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use log::{error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    engine::{BatchOutcome, EntityState},
    io_utils,
    schema::{EntityDefinition, Schema},
    store::StoreLayout,
    transform::StagedRow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Nothing is written unless every entity is free of errors.
    #[default]
    Strict,
    /// Clean entities are written; entities with errors are left untouched.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub entity: String,
    pub source: PathBuf,
    pub backup: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommittedEntity {
    pub entity: String,
    pub path: PathBuf,
    pub rows_appended: usize,
    /// The store file did not exist before this commit.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldEntity {
    pub entity: String,
    pub outstanding_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub mode: CommitMode,
    /// Strict mode refused to write anything.
    pub aborted: bool,
    pub committed: Vec<CommittedEntity>,
    pub held: Vec<HeldEntity>,
    pub snapshots: Vec<Snapshot>,
}

impl CommitReport {
    pub fn rows_appended(&self) -> usize {
        self.committed.iter().map(|entity| entity.rows_appended).sum()
    }
}

pub struct AppendCommitter<'a> {
    schema: &'a Schema,
    layout: &'a StoreLayout,
    backup_dir: PathBuf,
    mode: CommitMode,
}

impl<'a> AppendCommitter<'a> {
    pub fn new(
        schema: &'a Schema,
        layout: &'a StoreLayout,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        AppendCommitter {
            schema,
            layout,
            backup_dir: backup_dir.into(),
            mode: CommitMode::Strict,
        }
    }

    pub fn with_mode(mut self, mode: CommitMode) -> Self {
        self.mode = mode;
        self
    }

    /// Commits `outcome` and records the post-commit state of every entity.
    pub fn commit(&self, outcome: &mut BatchOutcome) -> Result<CommitReport> {
        let held = outcome
            .outcomes()
            .filter(|entity| !entity.is_clean())
            .map(|entity| HeldEntity {
                entity: entity.name.clone(),
                outstanding_errors: entity.outstanding_errors(),
            })
            .collect::<Vec<_>>();

        let mut report = CommitReport {
            mode: self.mode,
            aborted: false,
            committed: Vec::new(),
            held,
            snapshots: Vec::new(),
        };

        if self.mode == CommitMode::Strict && !report.held.is_empty() {
            warn!(
                "Strict commit aborted: {} entit(ies) have outstanding errors",
                report.held.len()
            );
            report.aborted = true;
            mark_held(outcome, &report.held);
            return Ok(report);
        }

        let targets = outcome
            .outcomes()
            .filter(|entity| entity.is_clean() && !entity.staged.is_empty())
            .map(|entity| entity.name.clone())
            .collect::<Vec<_>>();

        for entity in &targets {
            let path = self.layout.path_for(entity);
            if path.exists() {
                let snapshot = self
                    .snapshot(entity, &path)
                    .with_context(|| format!("Snapshotting {path:?}"))?;
                report.snapshots.push(snapshot);
            }
        }

        for entity in &targets {
            match self.append_entity(entity, outcome.staged(entity)) {
                Ok(committed) => {
                    info!(
                        "✓ Appended {} row(s) to {:?}",
                        committed.rows_appended, committed.path
                    );
                    report.committed.push(committed);
                }
                Err(err) => {
                    error!("Commit of {entity} failed; restoring earlier entities");
                    let unrestored = self.restore(&report);
                    if unrestored.is_empty() {
                        return Err(err.context(format!("Committing {entity}")));
                    }
                    return Err(err.context(format!(
                        "Committing {entity}; could not restore {}",
                        unrestored.join(", ")
                    )));
                }
            }
        }

        for entity in outcome.entities.values_mut() {
            if entity.is_clean() {
                entity.state = EntityState::Committed;
            }
        }
        mark_held(outcome, &report.held);
        Ok(report)
    }

    fn snapshot(&self, entity: &str, source: &Path) -> Result<Snapshot> {
        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("Creating backup directory {:?}", self.backup_dir))?;
        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(entity);
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut backup = self.backup_dir.join(format!("{stem}_{stamp}.bak.csv"));
        let mut attempt = 1;
        while backup.exists() {
            backup = self
                .backup_dir
                .join(format!("{stem}_{stamp}_{attempt}.bak.csv"));
            attempt += 1;
        }
        let contents = fs::read(source).with_context(|| format!("Reading {source:?}"))?;
        fs::write(&backup, &contents).with_context(|| format!("Writing backup {backup:?}"))?;
        let sha256 = format!("{:x}", Sha256::digest(&contents));
        info!("Backed up {source:?} to {backup:?} (sha256 {sha256})");
        Ok(Snapshot {
            entity: entity.to_string(),
            source: source.to_path_buf(),
            backup,
            sha256,
            bytes: contents.len() as u64,
        })
    }

    fn append_entity(&self, entity: &str, rows: &[StagedRow]) -> Result<CommittedEntity> {
        let definition = self.schema.require_entity(entity)?;
        let path = self.layout.path_for(entity);
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("Store path {path:?} has no file name"))?;
        let temp = path.with_file_name(format!(".{file_name}.tmp"));
        let created = !path.exists();

        let result = self.write_entity(definition, &path, &temp, created, rows);
        if let Err(err) = result {
            if temp.exists() {
                let _ = fs::remove_file(&temp);
            }
            return Err(err);
        }

        Ok(CommittedEntity {
            entity: entity.to_string(),
            path,
            rows_appended: rows.len(),
            created,
        })
    }

    /// Builds the new table contents in `temp`, then renames it over `path`.
    fn write_entity(
        &self,
        definition: &EntityDefinition,
        path: &Path,
        temp: &Path,
        created: bool,
        rows: &[StagedRow],
    ) -> Result<()> {
        let existing_headers = if created {
            Vec::new()
        } else {
            let mut reader =
                io_utils::open_csv_reader_from_path(path, self.layout.delimiter, true, false)?;
            io_utils::reader_headers(&mut reader, self.layout.encoding)?
        };

        let columns = if existing_headers.is_empty() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Creating data directory {parent:?}"))?;
            }
            let columns = definition.output_columns();
            let mut writer = io_utils::create_csv_writer(temp, self.layout.delimiter)?;
            writer
                .write_record(&columns)
                .with_context(|| format!("Writing header to {temp:?}"))?;
            writer.flush()?;
            columns
        } else {
            fs::copy(path, temp).with_context(|| format!("Copying {path:?} to {temp:?}"))?;
            if io_utils::lacks_trailing_newline(temp)? {
                fs::OpenOptions::new()
                    .append(true)
                    .open(temp)
                    .and_then(|mut file| file.write_all(b"\n"))
                    .with_context(|| format!("Terminating last row of {temp:?}"))?;
            }
            existing_headers
        };

        let mut writer = io_utils::append_csv_writer(temp, self.layout.delimiter)?;
        for row in rows {
            let record = columns.iter().map(|column| row.cell(column));
            writer
                .write_record(record)
                .with_context(|| format!("Writing {} row from {}", definition.name, row.position))?;
        }
        writer.flush().with_context(|| format!("Flushing {temp:?}"))?;
        drop(writer);
        fs::rename(temp, path).with_context(|| format!("Replacing {path:?}"))?;
        Ok(())
    }

    /// Rolls back every committed entity, returning those that could not be
    /// rolled back.
    fn restore(&self, report: &CommitReport) -> Vec<String> {
        let mut unrestored = Vec::new();
        for committed in &report.committed {
            let result = match report
                .snapshots
                .iter()
                .find(|snapshot| snapshot.entity == committed.entity)
            {
                Some(snapshot) => fs::copy(&snapshot.backup, &snapshot.source)
                    .map(|_| ())
                    .with_context(|| {
                        format!("Restoring {:?} from {:?}", snapshot.source, snapshot.backup)
                    }),
                None if committed.created => fs::remove_file(&committed.path)
                    .with_context(|| format!("Removing {:?}", committed.path)),
                None => Ok(()),
            };
            match result {
                Ok(()) => warn!("Restored {}", committed.entity),
                Err(err) => {
                    error!("Could not restore {}: {err:#}", committed.entity);
                    unrestored.push(committed.entity.clone());
                }
            }
        }
        unrestored
    }
}

fn mark_held(outcome: &mut BatchOutcome, held: &[HeldEntity]) {
    for entity in held {
        if let Some(state) = outcome.entities.get_mut(&entity.entity) {
            state.state = EntityState::Error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn restore_attempts_every_entity_and_names_failures() {
        let dir = tempdir().unwrap();
        let schema = Schema::from_yaml_str(
            "entities:\n  A:\n    fields: [{ name: ID, type: identifier, key: true }]\n",
        )
        .unwrap();
        let layout = StoreLayout::new(dir.path());
        let committer = AppendCommitter::new(&schema, &layout, dir.path().join("backups"));

        let lost = dir.path().join("LOST.csv");
        let kept = dir.path().join("KEPT.csv");
        let kept_backup = dir.path().join("KEPT.bak.csv");
        let created = dir.path().join("NEW.csv");
        fs::write(&lost, "ID\nchanged\n").unwrap();
        fs::write(&kept, "ID\nchanged\n").unwrap();
        fs::write(&kept_backup, "ID\n").unwrap();
        fs::write(&created, "ID\n").unwrap();

        let committed = |entity: &str, path: &Path, created: bool| CommittedEntity {
            entity: entity.to_string(),
            path: path.to_path_buf(),
            rows_appended: 1,
            created,
        };
        let snapshot = |entity: &str, source: &Path, backup: PathBuf| Snapshot {
            entity: entity.to_string(),
            source: source.to_path_buf(),
            backup,
            sha256: String::new(),
            bytes: 0,
        };
        let report = CommitReport {
            mode: CommitMode::Partial,
            aborted: false,
            committed: vec![
                committed("LOST", &lost, false),
                committed("KEPT", &kept, false),
                committed("NEW", &created, true),
            ],
            held: Vec::new(),
            snapshots: vec![
                snapshot("LOST", &lost, dir.path().join("missing.bak.csv")),
                snapshot("KEPT", &kept, kept_backup),
            ],
        };

        assert_eq!(committer.restore(&report), vec!["LOST".to_string()]);
        assert_eq!(fs::read_to_string(&kept).unwrap(), "ID\n");
        assert!(!created.exists());
        assert_eq!(fs::read_to_string(&lost).unwrap(), "ID\nchanged\n");
    }
}
