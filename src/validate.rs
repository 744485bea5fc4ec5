//! Field coercion and row-level rule checks.
//!
//! Coercion is driven purely by the [`FieldKind`] tag of each field; there is
//! no per-entity code. Uniqueness is checked against a [`EntityLedger`] that
//! covers the persisted rows plus every row staged so far in the batch.

use std::{collections::BTreeMap, sync::OnceLock};

use regex::Regex;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use uuid::Uuid;

use crate::{
    data::{CellValue, Value, fold, parse_decimal, parse_timestamp},
    error::{Violation, XorProblem},
    ledger::EntityLedger,
    schema::{EntityDefinition, FieldDef, FieldKind},
};

/// Coerced values of one row, keyed by field name. `None` is blank.
pub type FieldValues = BTreeMap<String, Option<Value>>;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
        )
        .expect("identifier pattern is valid")
    })
}

pub fn parse_identifier(value: &str) -> Option<Uuid> {
    let trimmed = value.trim();
    if !identifier_pattern().is_match(trimmed) {
        return None;
    }
    Uuid::parse_str(trimmed).ok()
}

/// Lowercase hyphenated form of a stored identifier; other text is only
/// trimmed.
pub fn canonical_identifier(value: &str) -> String {
    parse_identifier(value)
        .map(|id| id.hyphenated().to_string())
        .unwrap_or_else(|| value.trim().to_string())
}

const TRUE_TOKENS: &[&str] = &["true", "1", "yes", "t", "y"];
const FALSE_TOKENS: &[&str] = &["false", "0", "no", "f", "n"];

pub fn parse_boolean(value: &str) -> Option<bool> {
    let lowered = value.trim().to_ascii_lowercase();
    if TRUE_TOKENS.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSE_TOKENS.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Coerces one raw value to the field's kind. Blank input is `Ok(None)`.
pub fn coerce_field(field: &FieldDef, raw: &CellValue) -> Result<Option<Value>, Violation> {
    if raw.is_blank() {
        return Ok(None);
    }
    let text = raw.as_text();
    let invalid =
        |make: fn(String, String) -> Violation| make(field.name.clone(), text.to_string());

    let value = match &field.kind {
        FieldKind::Identifier => match raw {
            CellValue::Text(_) => parse_identifier(&text).map(Value::Identifier),
            _ => None,
        }
        .ok_or_else(|| {
            invalid(|field, value| Violation::InvalidIdentifierFormat { field, value })
        })?,
        FieldKind::Text => Value::Text(text.to_string()),
        FieldKind::Integer => match raw {
            CellValue::Number(number) => whole_number(*number),
            CellValue::Text(_) => text
                .parse::<i64>()
                .ok()
                .or_else(|| parse_decimal(&text).and_then(whole_number)),
            _ => None,
        }
        .map(Value::Integer)
        .ok_or_else(|| invalid(|field, value| Violation::InvalidInteger { field, value }))?,
        FieldKind::Decimal => match raw {
            CellValue::Number(number) => Some(*number),
            CellValue::Text(_) => parse_decimal(&text),
            _ => None,
        }
        .map(Value::Decimal)
        .ok_or_else(|| invalid(|field, value| Violation::InvalidDecimal { field, value }))?,
        FieldKind::Boolean => match raw {
            CellValue::Boolean(flag) => Some(*flag),
            CellValue::Number(number) if *number == Decimal::ONE => Some(true),
            CellValue::Number(number) if number.is_zero() => Some(false),
            CellValue::Text(_) => parse_boolean(&text),
            _ => None,
        }
        .map(Value::Boolean)
        .ok_or_else(|| invalid(|field, value| Violation::InvalidBoolean { field, value }))?,
        FieldKind::Timestamp => match raw {
            CellValue::Timestamp(ts) => Some(*ts),
            CellValue::Text(_) => parse_timestamp(&text),
            _ => None,
        }
        .map(Value::Timestamp)
        .ok_or_else(|| invalid(|field, value| Violation::InvalidTimestamp { field, value }))?,
        FieldKind::Enum { allowed, .. } => {
            let wanted = fold(&text);
            let canonical = allowed
                .iter()
                .find(|candidate| fold(candidate) == wanted)
                .ok_or_else(|| Violation::InvalidEnumValue {
                    field: field.name.clone(),
                    value: text.to_string(),
                    allowed: allowed.clone(),
                })?;
            Value::Enum(canonical.clone())
        }
    };
    Ok(Some(value))
}

fn whole_number(number: Decimal) -> Option<i64> {
    if number.fract().is_zero() {
        number.trunc().to_i64()
    } else {
        None
    }
}

/// Renders a persisted text value the way a freshly coerced value of the
/// same field would render, so store and batch keys compare equal.
pub fn canonical_stored(field: Option<&FieldDef>, raw: &str) -> String {
    let rendered = field
        .and_then(|field| coerce_field(field, &CellValue::from(raw)).ok().flatten())
        .map(|value| value.as_display())
        .unwrap_or_else(|| raw.to_string());
    fold(&rendered)
}

/// Folded key tuple over `fields`, or `None` if any component is blank.
pub fn key_tuple(fields: &[String], values: &FieldValues) -> Option<Vec<String>> {
    fields
        .iter()
        .map(|field| {
            values
                .get(field)
                .and_then(Option::as_ref)
                .map(|value| fold(&value.as_display()))
                .filter(|folded| !folded.is_empty())
        })
        .collect()
}

pub fn check_required(entity: &EntityDefinition, values: &FieldValues) -> Vec<Violation> {
    entity
        .fields
        .iter()
        .filter(|field| field.is_required())
        .filter(|field| values.get(&field.name).is_none_or(Option::is_none))
        .map(|field| Violation::MissingRequiredField {
            field: field.name.clone(),
        })
        .collect()
}

pub fn check_xor(entity: &EntityDefinition, values: &FieldValues) -> Vec<Violation> {
    entity
        .xor_groups
        .iter()
        .filter_map(|group| {
            let set = group
                .iter()
                .filter(|field| values.get(*field).is_some_and(Option::is_some))
                .cloned()
                .collect::<Vec<_>>();
            let problem = match set.len() {
                1 => return None,
                0 => XorProblem::NoneSet,
                _ => XorProblem::MultipleSet(set),
            };
            Some(Violation::XorConstraintViolated {
                fields: group.clone(),
                problem,
            })
        })
        .collect()
}

/// Checks the row's identifier and every declared unique constraint against
/// the ledger. Constraints with a blank component are not checked.
pub fn check_unique(
    entity: &EntityDefinition,
    identifier: &str,
    values: &FieldValues,
    ledger: &EntityLedger,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    if ledger.contains_id(identifier) {
        violations.push(Violation::DuplicateUniqueConstraint {
            constraint: format!("{} (primary key)", entity.id_field),
            values: vec![(entity.id_field.clone(), identifier.to_string())],
        });
    }
    for (idx, constraint) in entity.unique.iter().enumerate() {
        let Some(key) = key_tuple(&constraint.fields, values) else {
            continue;
        };
        if ledger.unique_collision(idx, &key) {
            violations.push(Violation::DuplicateUniqueConstraint {
                constraint: constraint.name.clone(),
                values: constraint
                    .fields
                    .iter()
                    .map(|field| {
                        let shown = values
                            .get(field)
                            .and_then(Option::as_ref)
                            .map(Value::as_display)
                            .unwrap_or_default();
                        (field.clone(), shown)
                    })
                    .collect(),
            });
        }
    }
    violations
}
