//! Per-pass read snapshot used by foreign-key lookups.
//!
//! The cache is rebuilt from scratch at the start of every pass and holds the
//! persistent rows followed by every row staged in earlier passes. Indexes are
//! built lazily, once per (entity, match-field tuple), so a pass costs one scan
//! per entity and lookup shape rather than one per row.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;
use log::debug;

use crate::{
    data::fold,
    schema::Schema,
    store::PersistentStore,
    transform::StagedRow,
    validate::{canonical_identifier, canonical_stored},
};

#[derive(Debug, Clone)]
struct CachedRow {
    identifier: String,
    values: BTreeMap<String, String>,
}

type KeyIndex = HashMap<Vec<String>, Vec<String>>;

#[derive(Debug, Default)]
pub struct PassCache {
    pass: usize,
    rows: BTreeMap<String, Vec<CachedRow>>,
    indexes: HashMap<(String, Vec<String>), KeyIndex>,
    unsettled: BTreeSet<String>,
}

impl PassCache {
    /// Snapshots `store` plus `staged` for one pass. `unsettled` names the
    /// entities that still have rows waiting to be staged.
    pub fn build(
        pass: usize,
        schema: &Schema,
        store: &PersistentStore,
        staged: &BTreeMap<String, Vec<StagedRow>>,
        unsettled: BTreeSet<String>,
    ) -> Self {
        let mut rows = BTreeMap::new();
        for entity in schema.entities.values() {
            let mut cached = Vec::new();
            for record in store.rows(&entity.name) {
                let Some(identifier) = record
                    .get(&entity.id_field)
                    .map(|id| canonical_identifier(id))
                    .filter(|id| !id.is_empty())
                else {
                    continue;
                };
                let values = record
                    .iter()
                    .map(|(column, raw)| {
                        (column.clone(), canonical_stored(entity.field(column), raw))
                    })
                    .collect();
                cached.push(CachedRow { identifier, values });
            }
            for row in staged.get(&entity.name).into_iter().flatten() {
                let values = row
                    .values
                    .iter()
                    .map(|(field, value)| {
                        let folded = value
                            .as_ref()
                            .map(|value| fold(&value.as_display()))
                            .unwrap_or_default();
                        (field.clone(), folded)
                    })
                    .collect();
                cached.push(CachedRow {
                    identifier: row.identifier.clone(),
                    values,
                });
            }
            if !cached.is_empty() {
                rows.insert(entity.name.clone(), cached);
            }
        }
        debug!(
            "Pass {pass}: cache holds {} row(s) across {} entit(ies)",
            rows.values().map(Vec::len).sum::<usize>(),
            rows.len()
        );
        PassCache {
            pass,
            rows,
            indexes: HashMap::new(),
            unsettled,
        }
    }

    pub fn pass(&self) -> usize {
        self.pass
    }

    /// True while `entity` still has rows that a later pass may stage.
    pub fn is_unsettled(&self, entity: &str) -> bool {
        self.unsettled.contains(entity)
    }

    /// Distinct identifiers of `entity` rows whose folded values equal every
    /// criterion, persistent rows first.
    pub fn lookup(&mut self, entity: &str, criteria: &[(String, String)]) -> Vec<String> {
        let fields = criteria
            .iter()
            .map(|(field, _)| field.clone())
            .collect::<Vec<_>>();
        let key = criteria
            .iter()
            .map(|(_, value)| value.clone())
            .collect::<Vec<_>>();
        let rows = &self.rows;
        let index = self
            .indexes
            .entry((entity.to_string(), fields.clone()))
            .or_insert_with(|| build_index(rows.get(entity).map(Vec::as_slice), &fields));
        index.get(&key).cloned().unwrap_or_default()
    }
}

fn build_index(rows: Option<&[CachedRow]>, fields: &[String]) -> KeyIndex {
    let mut index = KeyIndex::new();
    for row in rows.unwrap_or_default() {
        let key = fields
            .iter()
            .map(|field| row.values.get(field).cloned().unwrap_or_default())
            .collect::<Vec<_>>();
        if key.iter().any(String::is_empty) {
            continue;
        }
        index.entry(key).or_default().push(row.identifier.clone());
    }
    for identifiers in index.values_mut() {
        *identifiers = std::mem::take(identifiers)
            .into_iter()
            .unique_by(|id| fold(id))
            .collect();
    }
    index
}
