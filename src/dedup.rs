//! Natural-key deduplication for master-data entities.

use crate::{
    data::{CellValue, InputRow, fold},
    error::Violation,
    ledger::{EntityLedger, Origin},
    schema::EntityDefinition,
    validate::coerce_field,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    New,
    DuplicateInBatch { identifier: String },
    DuplicateInStore { identifier: String },
}

pub struct Deduplicator;

impl Deduplicator {
    /// Classifies a mapped row. Entities without a dedup key are always
    /// [`DedupDecision::New`].
    pub fn classify(
        entity: &EntityDefinition,
        mapped: &InputRow,
        ledger: &EntityLedger,
    ) -> Result<DedupDecision, Violation> {
        let Some(key) = Self::key(entity, mapped)? else {
            return Ok(DedupDecision::New);
        };
        Ok(match ledger.dedup_owner(&key) {
            None => DedupDecision::New,
            Some(owner) => match owner.origin {
                Origin::Batch => DedupDecision::DuplicateInBatch {
                    identifier: owner.identifier.clone(),
                },
                Origin::Store => DedupDecision::DuplicateInStore {
                    identifier: owner.identifier.clone(),
                },
            },
        })
    }

    /// Folded dedup key of a mapped row; `None` for entities that are never
    /// deduplicated.
    pub fn key(
        entity: &EntityDefinition,
        mapped: &InputRow,
    ) -> Result<Option<Vec<String>>, Violation> {
        if !entity.is_deduplicated() {
            return Ok(None);
        }
        let empty = CellValue::Empty;
        let mut key = Vec::with_capacity(entity.dedup_key.len());
        for name in &entity.dedup_key {
            let raw = mapped.get(name).unwrap_or(&empty);
            let coerced = match entity.field(name) {
                Some(field) => coerce_field(field, raw)?.map(|value| value.as_display()),
                None => Some(raw.as_text().to_string()).filter(|text| !text.is_empty()),
            };
            match coerced.map(|text| fold(&text)).filter(|text| !text.is_empty()) {
                Some(component) => key.push(component),
                None => {
                    return Err(Violation::EmptyDedupKey {
                        fields: entity.dedup_key.clone(),
                    });
                }
            }
        }
        Ok(Some(key))
    }
}
