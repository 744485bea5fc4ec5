//! Multi-pass staging engine.
//!
//! Rows are attempted entity by entity in ingestion order. A row that fails
//! only on a foreign key that may still appear is kept for the next pass;
//! every other outcome is final. Each pass starts from a fresh [`PassCache`]
//! snapshot, so rows staged in pass N become resolvable in pass N + 1.
//!
//! The loop stops when nothing is left to retry, when a full pass stages or
//! rejects nothing, or at the pass limit, whichever comes first. Rows still
//! waiting at that point are reported as unresolved, separately from rows
//! rejected for their own data.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    cache::PassCache,
    data::InputRow,
    error::{ErrorClass, FkFailure, Violation},
    ledger::{BatchLedger, EntityLedger},
    mapping::MappingConfig,
    schema::Schema,
    store::PersistentStore,
    transform::{
        CandidateRow, DuplicateKind, DuplicateNotice, RejectedRow, RowPosition, RowTransformer,
        StagedRow, TransformOutcome,
    },
};

pub const MAX_PASSES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Not yet attempted in this batch.
    Pending,
    /// Some rows staged, some still waiting on foreign keys.
    PartiallyStaged,
    /// Nothing left that another pass could fix.
    Converged,
    Committed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every row reached a final state.
    Exhausted,
    /// A full pass changed nothing.
    NoProgress,
    PassLimit,
}

/// Counters taken after each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub pass: usize,
    pub staged: usize,
    pub pending: usize,
    pub terminal: usize,
    /// Entities with no row waiting on a foreign key.
    pub clear_entities: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOutcome {
    pub name: String,
    pub state: EntityState,
    pub staged: Vec<StagedRow>,
    pub duplicates: Vec<DuplicateNotice>,
    /// Rows rejected for good, for their own data or an ambiguous or
    /// missing lookup key.
    pub errors: Vec<RejectedRow>,
    /// Rows still waiting on a foreign key when the loop stopped.
    pub unresolved: Vec<RejectedRow>,
}

impl EntityOutcome {
    fn new(name: &str) -> Self {
        EntityOutcome {
            name: name.to_string(),
            state: EntityState::Pending,
            staged: Vec::new(),
            duplicates: Vec::new(),
            errors: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    /// Terminal rejections caused by the row's own data.
    pub fn data_errors(&self) -> impl Iterator<Item = &RejectedRow> {
        self.errors.iter().filter(|row| !row.is_fk_failure())
    }

    /// Terminal rejections caused only by foreign keys.
    pub fn fk_errors(&self) -> impl Iterator<Item = &RejectedRow> {
        self.errors.iter().filter(|row| row.is_fk_failure())
    }

    pub fn outstanding_errors(&self) -> usize {
        self.errors.len() + self.unresolved.len()
    }

    pub fn is_clean(&self) -> bool {
        self.outstanding_errors() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySummary {
    pub entity: String,
    pub state: EntityState,
    pub valid: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub fk_errors: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub passes: usize,
    pub converged: bool,
    pub stop_reason: StopReason,
    pub entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Entities that received input, in ingestion order.
    pub order: Vec<String>,
    pub entities: BTreeMap<String, EntityOutcome>,
    pub passes: usize,
    pub stop_reason: StopReason,
    pub history: Vec<PassStats>,
}

impl BatchOutcome {
    /// True unless the loop was cut off by the pass limit.
    pub fn converged(&self) -> bool {
        self.stop_reason != StopReason::PassLimit
    }

    pub fn entity(&self, name: &str) -> Option<&EntityOutcome> {
        self.entities.get(name)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.order
            .iter()
            .filter_map(|name| self.entities.get(name))
    }

    pub fn staged(&self, entity: &str) -> &[StagedRow] {
        self.entities
            .get(entity)
            .map(|outcome| outcome.staged.as_slice())
            .unwrap_or_default()
    }

    pub fn is_clean(&self) -> bool {
        self.entities.values().all(EntityOutcome::is_clean)
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            passes: self.passes,
            converged: self.converged(),
            stop_reason: self.stop_reason,
            entities: self
                .outcomes()
                .map(|outcome| EntitySummary {
                    entity: outcome.name.clone(),
                    state: outcome.state,
                    valid: outcome.staged.len(),
                    duplicates: outcome.duplicates.len(),
                    errors: outcome.data_errors().count(),
                    fk_errors: outcome.fk_errors().count(),
                    unresolved: outcome.unresolved.len(),
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
struct PendingRow {
    candidate: CandidateRow,
    last_rejection: Option<RejectedRow>,
}

pub struct StagingEngine<'a> {
    schema: &'a Schema,
    mapping: &'a MappingConfig,
    store: &'a PersistentStore,
    max_passes: usize,
}

impl<'a> StagingEngine<'a> {
    pub fn new(
        schema: &'a Schema,
        mapping: &'a MappingConfig,
        store: &'a PersistentStore,
    ) -> Result<Self> {
        mapping.validate(schema)?;
        Ok(StagingEngine {
            schema,
            mapping,
            store,
            max_passes: MAX_PASSES,
        })
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes.max(1);
        self
    }

    /// Stages every row of `sheets` (keyed by sheet name).
    pub fn run(&self, sheets: &BTreeMap<String, Vec<InputRow>>) -> Result<BatchOutcome> {
        let mut pending = self.candidates(sheets);
        let order = self
            .schema
            .ingestion_order
            .iter()
            .filter(|entity| pending.contains_key(*entity))
            .cloned()
            .collect::<Vec<_>>();
        let mut outcomes = order
            .iter()
            .map(|entity| (entity.clone(), EntityOutcome::new(entity)))
            .collect::<BTreeMap<_, _>>();

        let transformer = RowTransformer::new(self.schema);
        let mut ledger = BatchLedger::build(self.schema, self.store);
        let mut staged: BTreeMap<String, Vec<StagedRow>> = BTreeMap::new();
        let mut history = Vec::new();
        let fallback_ledger = EntityLedger::default();

        let mut pass = 0;
        let mut settling = false;
        let stop_reason = loop {
            pass += 1;
            // A settling pass lets optional lookups give up on targets that
            // are still pending but stopped moving.
            let unsettled = if settling {
                info!("Pass {pass}: settling optional lookups with no match");
                BTreeSet::new()
            } else {
                pending
                    .iter()
                    .filter(|(_, rows)| !rows.is_empty())
                    .map(|(entity, _)| entity.clone())
                    .collect::<BTreeSet<_>>()
            };
            let mut cache = PassCache::build(pass, self.schema, self.store, &staged, unsettled);
            let mut progress = false;

            for entity_name in &order {
                let Some(rows) = pending.get_mut(entity_name) else {
                    continue;
                };
                if rows.is_empty() {
                    continue;
                }
                let Some(entity) = self.schema.entity(entity_name) else {
                    continue;
                };
                let Some(outcome) = outcomes.get_mut(entity_name) else {
                    continue;
                };
                let attempted = rows.len();
                let mut retry = Vec::new();
                for row in rows.drain(..) {
                    let mapping = &self.mapping.sheets[row.candidate.mapping];
                    let entity_ledger = ledger.entity(entity_name).unwrap_or(&fallback_ledger);
                    match transformer.transform(&row.candidate, mapping, &mut cache, entity_ledger)
                    {
                        TransformOutcome::Staged(staged_row) => {
                            ledger.entity_mut(entity).record(
                                entity,
                                &staged_row.identifier,
                                &staged_row.values,
                            );
                            staged
                                .entry(entity_name.clone())
                                .or_default()
                                .push(staged_row.clone());
                            outcome.staged.push(staged_row);
                        }
                        TransformOutcome::Duplicate(notice) => {
                            if let DuplicateKind::UniqueSkip { constraint } = &notice.kind {
                                warn!(
                                    "{entity_name} {}: skipped, '{constraint}' already taken",
                                    notice.position
                                );
                            }
                            outcome.duplicates.push(notice);
                        }
                        TransformOutcome::Rejected { violations, class } => {
                            let rejected = RejectedRow {
                                entity: entity_name.clone(),
                                position: row.candidate.position.clone(),
                                violations,
                                pass,
                                class,
                            };
                            match class {
                                ErrorClass::Retryable => retry.push(PendingRow {
                                    candidate: row.candidate,
                                    last_rejection: Some(rejected),
                                }),
                                ErrorClass::Terminal => outcome.errors.push(rejected),
                            }
                        }
                    }
                }
                progress |= retry.len() < attempted;
                outcome.state = if retry.is_empty() {
                    EntityState::Converged
                } else {
                    EntityState::PartiallyStaged
                };
                debug!(
                    "Pass {pass}: {entity_name} attempted {attempted}, {} left to retry",
                    retry.len()
                );
                *rows = retry;
            }

            let stats = PassStats {
                pass,
                staged: outcomes.values().map(|o| o.staged.len()).sum(),
                pending: pending.values().map(Vec::len).sum(),
                terminal: outcomes.values().map(|o| o.errors.len()).sum(),
                clear_entities: order
                    .iter()
                    .filter(|entity| pending.get(*entity).is_none_or(Vec::is_empty))
                    .count(),
            };
            info!(
                "Pass {pass}: {} staged, {} waiting on foreign keys, {} rejected",
                stats.staged, stats.pending, stats.terminal
            );
            history.push(stats);

            if stats.pending == 0 {
                break StopReason::Exhausted;
            }
            if !progress && (settling || !self.waits_on_optional(&pending)) {
                break StopReason::NoProgress;
            }
            if pass >= self.max_passes {
                break StopReason::PassLimit;
            }
            settling = !progress;
        };

        for (entity_name, rows) in pending {
            let Some(outcome) = outcomes.get_mut(&entity_name) else {
                continue;
            };
            if rows.is_empty() {
                continue;
            }
            outcome.state = match stop_reason {
                StopReason::PassLimit => EntityState::PartiallyStaged,
                _ => EntityState::Converged,
            };
            outcome.unresolved = rows
                .into_iter()
                .filter_map(|row| row.last_rejection)
                .collect();
        }

        for outcome in order.iter().filter_map(|name| outcomes.get(name)) {
            let message = format!(
                "{}: {} valid, {} duplicate(s), {} error(s), {} unresolved",
                outcome.name,
                outcome.staged.len(),
                outcome.duplicates.len(),
                outcome.errors.len(),
                outcome.unresolved.len()
            );
            if outcome.is_clean() {
                info!("✓ {message}");
            } else {
                warn!("{message}");
            }
        }
        if stop_reason == StopReason::PassLimit {
            warn!("Stopped at the pass limit ({}) before converging", self.max_passes);
        }

        Ok(BatchOutcome {
            order,
            entities: outcomes,
            passes: pass,
            stop_reason,
            history,
        })
    }

    /// True if some pending row was last held back by an optional lookup.
    fn waits_on_optional(&self, pending: &BTreeMap<String, Vec<PendingRow>>) -> bool {
        pending.values().flatten().any(|row| {
            let lookups = &self.mapping.sheets[row.candidate.mapping].lookups;
            row.last_rejection
                .iter()
                .flat_map(|rejection| &rejection.violations)
                .any(|violation| match violation {
                    Violation::FkUnresolved {
                        field,
                        reason: FkFailure::NotFound,
                        ..
                    } => lookups
                        .iter()
                        .any(|lookup| lookup.optional && &lookup.field == field),
                    _ => false,
                })
        })
    }

    fn candidates(
        &self,
        sheets: &BTreeMap<String, Vec<InputRow>>,
    ) -> BTreeMap<String, Vec<PendingRow>> {
        let mut grouped: BTreeMap<String, Vec<PendingRow>> = BTreeMap::new();
        for (idx, sheet) in self.mapping.sheets.iter().enumerate() {
            let Some(rows) = sheets.get(&sheet.sheet) else {
                warn!("No rows supplied for sheet '{}'", sheet.sheet);
                continue;
            };
            let entry = grouped.entry(sheet.entity.clone()).or_default();
            for (row_idx, raw) in rows.iter().enumerate() {
                entry.push(PendingRow {
                    candidate: CandidateRow {
                        entity: sheet.entity.clone(),
                        position: RowPosition::new(&sheet.sheet, row_idx + 1),
                        mapping: idx,
                        raw: raw.clone(),
                    },
                    last_rejection: None,
                });
            }
        }
        grouped
    }
}
