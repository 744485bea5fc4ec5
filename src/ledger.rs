//! Live per-entity index of identifiers, unique tuples and dedup keys.
//!
//! Unlike the pass cache, the ledger is updated the moment a row is staged so
//! that two rows of the same batch (or even the same pass) can never claim the
//! same identifier, unique tuple or dedup key.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::{
    data::fold,
    schema::{EntityDefinition, Schema},
    store::{PersistentStore, Record},
    validate::{FieldValues, canonical_identifier, canonical_stored, key_tuple},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Store,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOwner {
    pub identifier: String,
    pub origin: Origin,
}

#[derive(Debug, Clone, Default)]
pub struct EntityLedger {
    ids: HashSet<String>,
    unique: Vec<HashSet<Vec<String>>>,
    dedup: HashMap<Vec<String>, DedupOwner>,
}

impl EntityLedger {
    pub fn new(entity: &EntityDefinition) -> Self {
        EntityLedger {
            ids: HashSet::new(),
            unique: vec![HashSet::new(); entity.unique.len()],
            dedup: HashMap::new(),
        }
    }

    /// Indexes persisted rows, rendering each stored value the way the
    /// validator would render the same input.
    pub fn from_store(entity: &EntityDefinition, rows: &[Record]) -> Self {
        let mut ledger = EntityLedger::new(entity);
        for row in rows {
            let stored_key = |fields: &[String]| -> Option<Vec<String>> {
                fields
                    .iter()
                    .map(|field| {
                        let raw = row.get(field).map(String::as_str).unwrap_or_default();
                        Some(canonical_stored(entity.field(field), raw))
                            .filter(|folded| !folded.is_empty())
                    })
                    .collect()
            };
            let identifier = row
                .get(&entity.id_field)
                .map(|id| canonical_identifier(id))
                .unwrap_or_default();
            if !identifier.is_empty() {
                ledger.ids.insert(fold(&identifier));
            }
            for (idx, constraint) in entity.unique.iter().enumerate() {
                if let Some(key) = stored_key(&constraint.fields) {
                    ledger.unique[idx].insert(key);
                }
            }
            if entity.is_deduplicated()
                && !identifier.is_empty()
                && let Some(key) = stored_key(&entity.dedup_key)
            {
                ledger.dedup.entry(key).or_insert(DedupOwner {
                    identifier,
                    origin: Origin::Store,
                });
            }
        }
        ledger
    }

    pub fn contains_id(&self, identifier: &str) -> bool {
        self.ids.contains(&fold(identifier))
    }

    pub fn unique_collision(&self, constraint: usize, key: &[String]) -> bool {
        self.unique
            .get(constraint)
            .is_some_and(|seen| seen.contains(key))
    }

    pub fn dedup_owner(&self, key: &[String]) -> Option<&DedupOwner> {
        self.dedup.get(key)
    }

    /// Registers a freshly staged row.
    pub fn record(&mut self, entity: &EntityDefinition, identifier: &str, values: &FieldValues) {
        self.ids.insert(fold(identifier));
        for (idx, constraint) in entity.unique.iter().enumerate() {
            if let Some(key) = key_tuple(&constraint.fields, values) {
                self.unique[idx].insert(key);
            }
        }
        if entity.is_deduplicated()
            && let Some(key) = key_tuple(&entity.dedup_key, values)
        {
            self.dedup.entry(key).or_insert_with(|| DedupOwner {
                identifier: identifier.to_string(),
                origin: Origin::Batch,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchLedger {
    entities: BTreeMap<String, EntityLedger>,
}

impl BatchLedger {
    pub fn build(schema: &Schema, store: &PersistentStore) -> Self {
        let entities = schema
            .entities
            .values()
            .map(|entity| {
                (
                    entity.name.clone(),
                    EntityLedger::from_store(entity, store.rows(&entity.name)),
                )
            })
            .collect();
        BatchLedger { entities }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityLedger> {
        self.entities.get(name)
    }

    pub fn entity_mut(&mut self, entity: &EntityDefinition) -> &mut EntityLedger {
        self.entities
            .entry(entity.name.clone())
            .or_insert_with(|| EntityLedger::new(entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    fn vendors() -> Schema {
        Schema::from_yaml_str(
            r#"
entities:
  VENDORS:
    fields:
      - { name: ID, type: identifier, key: true }
      - { name: CODE, type: text }
      - { name: RATING, type: decimal }
    unique:
      - { name: vendor_code, fields: [CODE] }
    dedup_key: [CODE]
"#,
        )
        .unwrap()
    }

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn store_rows_seed_ids_and_keys_case_insensitively() {
        let schema = vendors();
        let entity = schema.entity("VENDORS").unwrap();
        let rows = vec![record(&[
            ("ID", "550E8400-E29B-41D4-A716-446655440000"),
            ("CODE", " Abc "),
        ])];
        let ledger = EntityLedger::from_store(entity, &rows);
        assert!(ledger.contains_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(ledger.unique_collision(0, &["abc".to_string()]));
        let owner = ledger.dedup_owner(&["abc".to_string()]).unwrap();
        assert_eq!(owner.origin, Origin::Store);
    }

    #[test]
    fn recorded_rows_keep_first_dedup_owner() {
        let schema = vendors();
        let entity = schema.entity("VENDORS").unwrap();
        let mut ledger = EntityLedger::new(entity);
        let mut values = FieldValues::new();
        values.insert("CODE".to_string(), Some(Value::Text("XYZ".to_string())));
        ledger.record(entity, "first", &values);
        ledger.record(entity, "second", &values);
        let owner = ledger.dedup_owner(&["xyz".to_string()]).unwrap();
        assert_eq!(owner.identifier, "first");
        assert_eq!(owner.origin, Origin::Batch);
        assert_eq!(ledger.len(), 2);
    }
}
