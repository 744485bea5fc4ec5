//! Per-row transformation pipeline.
//!
//! Every candidate row goes through the same fixed sequence: column mapping
//! and defaults, identifier assignment, deduplication, foreign-key resolution,
//! then field coercion and rule checks. The outcome is exactly one of a staged
//! row, a duplicate notice, or a rejection carrying every violation found.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use log::debug;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    cache::PassCache,
    data::{CellValue, InputRow},
    dedup::{DedupDecision, Deduplicator},
    error::{ErrorClass, Violation, classify},
    ledger::EntityLedger,
    mapping::{IdPolicy, SheetMapping},
    resolver::{FkResolver, Resolution},
    schema::{DuplicatePolicy, EntityDefinition, Schema},
    validate::{self, FieldValues},
};

/// Where a row came from: sheet name and 1-based data-row number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RowPosition {
    pub sheet: String,
    pub row: usize,
}

impl RowPosition {
    pub fn new(sheet: impl Into<String>, row: usize) -> Self {
        RowPosition {
            sheet: sheet.into(),
            row,
        }
    }
}

impl fmt::Display for RowPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sheet, self.row)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRow {
    pub entity: String,
    pub position: RowPosition,
    /// Index of the sheet mapping that produced this row.
    pub mapping: usize,
    pub raw: InputRow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRow {
    pub entity: String,
    pub position: RowPosition,
    pub identifier: String,
    pub values: FieldValues,
}

impl StagedRow {
    /// Cell text for `column`; blank for undeclared or empty fields.
    pub fn cell(&self, column: &str) -> String {
        self.values
            .get(column)
            .and_then(Option::as_ref)
            .map(|value| value.as_display())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub entity: String,
    pub position: RowPosition,
    pub violations: Vec<Violation>,
    pub pass: usize,
    pub class: ErrorClass,
}

impl RejectedRow {
    /// True when every violation is a foreign key that could not be resolved.
    pub fn is_fk_failure(&self) -> bool {
        !self.violations.is_empty()
            && self
                .violations
                .iter()
                .all(|violation| matches!(violation, Violation::FkUnresolved { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuplicateKind {
    InBatch,
    InStore,
    UniqueSkip { constraint: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateNotice {
    pub entity: String,
    pub position: RowPosition,
    /// Identifier of the row this one collapses onto, when known.
    pub identifier: Option<String>,
    #[serde(flatten)]
    pub kind: DuplicateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Staged(StagedRow),
    Duplicate(DuplicateNotice),
    Rejected {
        violations: Vec<Violation>,
        class: ErrorClass,
    },
}

impl TransformOutcome {
    fn rejected(violations: Vec<Violation>) -> Self {
        let class = classify(&violations);
        TransformOutcome::Rejected { violations, class }
    }
}

pub struct RowTransformer<'a> {
    schema: &'a Schema,
    resolver: FkResolver<'a>,
}

impl<'a> RowTransformer<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        RowTransformer {
            schema,
            resolver: FkResolver::new(schema),
        }
    }

    pub fn transform(
        &self,
        candidate: &CandidateRow,
        mapping: &SheetMapping,
        cache: &mut PassCache,
        ledger: &EntityLedger,
    ) -> TransformOutcome {
        let Some(entity) = self.schema.entity(&candidate.entity) else {
            return TransformOutcome::rejected(vec![Violation::DataClass {
                message: format!("entity '{}' is not declared", candidate.entity),
            }]);
        };

        let mut mapped = map_columns(&candidate.raw, mapping);

        let id_field = mapping.id_column(&entity.id_field).to_string();
        let assigned = assign_identifier(&id_field, mapped.get(&id_field), mapping.id.policy);
        let identifier = match assigned {
            Ok(identifier) => identifier,
            Err(violation) => return TransformOutcome::rejected(vec![violation]),
        };
        mapped.insert(id_field.clone(), CellValue::Text(identifier.clone()));

        match Deduplicator::classify(entity, &mapped, ledger) {
            Ok(DedupDecision::New) => {}
            Ok(DedupDecision::DuplicateInBatch { identifier }) => {
                return self.duplicate(candidate, Some(identifier), DuplicateKind::InBatch);
            }
            Ok(DedupDecision::DuplicateInStore { identifier }) => {
                return self.duplicate(candidate, Some(identifier), DuplicateKind::InStore);
            }
            Err(violation) => return TransformOutcome::rejected(vec![violation]),
        }

        let mut violations = Vec::new();
        for lookup in &mapping.lookups {
            match self.resolver.resolve(lookup, &mapped, &candidate.raw, cache) {
                Ok(Resolution::Resolved(id)) => {
                    mapped.insert(lookup.field.clone(), CellValue::Text(id));
                }
                Ok(Resolution::Empty) => {
                    mapped.insert(lookup.field.clone(), CellValue::Empty);
                }
                Err(violation) => violations.push(violation),
            }
        }

        let (values, field_violations) = coerce_row(entity, &mapped);
        // A field that already failed coercion or lookup is not also reported missing.
        let failed_fields = violations
            .iter()
            .chain(&field_violations)
            .filter_map(violation_field)
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        violations.extend(field_violations);
        violations.extend(
            validate::check_required(entity, &values)
                .into_iter()
                .filter(|violation| {
                    violation_field(violation).is_none_or(|field| !failed_fields.contains(field))
                }),
        );
        violations.extend(validate::check_xor(entity, &values));

        let unique = validate::check_unique(entity, &identifier, &values, ledger);
        if entity.duplicate_policy == DuplicatePolicy::Skip
            && violations.is_empty()
            && let Some(Violation::DuplicateUniqueConstraint { constraint, .. }) = unique.first()
        {
            return self.duplicate(
                candidate,
                None,
                DuplicateKind::UniqueSkip {
                    constraint: constraint.clone(),
                },
            );
        }
        if entity.duplicate_policy == DuplicatePolicy::Error {
            violations.extend(unique);
        }

        if !violations.is_empty() {
            debug!(
                "{} {}: {} violation(s)",
                candidate.entity,
                candidate.position,
                violations.len()
            );
            return TransformOutcome::rejected(violations);
        }

        TransformOutcome::Staged(StagedRow {
            entity: entity.name.clone(),
            position: candidate.position.clone(),
            identifier,
            values,
        })
    }

    fn duplicate(
        &self,
        candidate: &CandidateRow,
        identifier: Option<String>,
        kind: DuplicateKind,
    ) -> TransformOutcome {
        debug!(
            "{} {}: duplicate ({kind:?})",
            candidate.entity, candidate.position
        );
        TransformOutcome::Duplicate(DuplicateNotice {
            entity: candidate.entity.clone(),
            position: candidate.position.clone(),
            identifier,
            kind,
        })
    }
}

/// Applies the column map, then fills defaults for fields left blank.
pub fn map_columns(raw: &InputRow, mapping: &SheetMapping) -> InputRow {
    let mut mapped = mapping
        .column_map
        .iter()
        .filter_map(|(column, field)| raw.get(column).map(|value| (field.clone(), value.clone())))
        .collect::<InputRow>();
    for (field, default) in &mapping.defaults {
        if mapped.get(field).is_none_or(CellValue::is_blank) {
            mapped.insert(field.clone(), default.to_cell());
        }
    }
    mapped
}

fn assign_identifier(
    id_field: &str,
    current: Option<&CellValue>,
    policy: IdPolicy,
) -> Result<String, Violation> {
    match current.filter(|value| !value.is_blank()) {
        None => match policy {
            IdPolicy::GenerateIfBlank => Ok(Uuid::new_v4().hyphenated().to_string()),
            IdPolicy::Preserve => Err(Violation::MissingRequiredField {
                field: id_field.to_string(),
            }),
        },
        Some(value) => {
            let text = value.as_text();
            match value {
                CellValue::Text(_) => validate::parse_identifier(&text),
                _ => None,
            }
            .map(|id| id.hyphenated().to_string())
            .ok_or_else(|| Violation::InvalidIdentifierFormat {
                field: id_field.to_string(),
                value: text.to_string(),
            })
        }
    }
}

fn coerce_row(entity: &EntityDefinition, mapped: &InputRow) -> (FieldValues, Vec<Violation>) {
    let empty = CellValue::Empty;
    let mut values = BTreeMap::new();
    let mut violations = Vec::new();
    for field in &entity.fields {
        let raw = mapped.get(&field.name).unwrap_or(&empty);
        match validate::coerce_field(field, raw) {
            Ok(value) => {
                values.insert(field.name.clone(), value);
            }
            Err(violation) => {
                values.insert(field.name.clone(), None);
                violations.push(violation);
            }
        }
    }
    (values, violations)
}

fn violation_field(violation: &Violation) -> Option<&str> {
    match violation {
        Violation::InvalidIdentifierFormat { field, .. }
        | Violation::InvalidInteger { field, .. }
        | Violation::InvalidDecimal { field, .. }
        | Violation::InvalidBoolean { field, .. }
        | Violation::InvalidTimestamp { field, .. }
        | Violation::InvalidEnumValue { field, .. }
        | Violation::FkUnresolved { field, .. }
        | Violation::MissingRequiredField { field } => Some(field),
        _ => None,
    }
}
