//! Foreign-key resolution by natural key.

use crate::{
    cache::PassCache,
    data::{CellValue, InputRow},
    error::{FkFailure, Violation},
    mapping::FkLookup,
    schema::Schema,
    validate::{canonical_stored, parse_identifier},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    /// Optional lookup with nothing to point at.
    Empty,
}

pub struct FkResolver<'a> {
    schema: &'a Schema,
}

impl<'a> FkResolver<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        FkResolver { schema }
    }

    /// Resolves one lookup for a row. `mapped` holds the row's values keyed
    /// by entity field after column mapping and defaults; `raw` is the source
    /// row keyed by sheet column.
    pub fn resolve(
        &self,
        lookup: &FkLookup,
        mapped: &InputRow,
        raw: &InputRow,
        cache: &mut PassCache,
    ) -> Result<Resolution, Violation> {
        if let Some(direct) = mapped.get(&lookup.field).filter(|value| !value.is_blank()) {
            let text = direct.as_text();
            return match direct {
                CellValue::Text(_) => parse_identifier(&text),
                _ => None,
            }
            .map(|id| Resolution::Resolved(id.hyphenated().to_string()))
            .ok_or_else(|| Violation::InvalidIdentifierFormat {
                field: lookup.field.clone(),
                value: text.to_string(),
            });
        }

        let target = self.schema.entity(&lookup.entity);
        let mut shown = Vec::with_capacity(lookup.match_rules.len());
        let mut criteria = Vec::with_capacity(lookup.match_rules.len());
        for rule in &lookup.match_rules {
            let value = mapped
                .get(&rule.from)
                .filter(|value| !value.is_blank())
                .or_else(|| raw.get(&rule.from))
                .filter(|value| !value.is_blank());
            let text = value.map(|value| value.as_text().to_string()).unwrap_or_default();
            let field = target.and_then(|entity| entity.field(&rule.field));
            criteria.push((rule.field.clone(), canonical_stored(field, &text)));
            shown.push((rule.field.clone(), text));
        }

        let failure = |reason: FkFailure, shown: Vec<(String, String)>| Violation::FkUnresolved {
            field: lookup.field.clone(),
            target: lookup.entity.clone(),
            lookup: shown,
            reason,
        };

        if criteria.iter().any(|(_, value)| value.is_empty()) {
            return if lookup.optional {
                Ok(Resolution::Empty)
            } else {
                Err(failure(FkFailure::MissingKey, shown))
            };
        }

        let mut matches = cache.lookup(&lookup.entity, &criteria);
        match matches.len() {
            1 => Ok(Resolution::Resolved(matches.remove(0))),
            0 if lookup.optional && !cache.is_unsettled(&lookup.entity) => Ok(Resolution::Empty),
            0 => Err(failure(FkFailure::NotFound, shown)),
            count => Err(failure(FkFailure::Ambiguous { matches: count }, shown)),
        }
    }
}
