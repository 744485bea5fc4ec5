//! Sheet-to-entity mapping configuration.
//!
//! A mapping file lists, per input sheet, the target entity, how source
//! columns map onto entity fields, default values, the identifier policy and
//! the foreign-key lookups to perform.

use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path, str::FromStr};

use anyhow::{Context, Result, ensure};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{data::CellValue, schema::Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdPolicy {
    #[default]
    #[serde(alias = "generate_if_blank")]
    GenerateIfBlank,
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdSpec {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default, alias = "uuidPolicy")]
    pub policy: IdPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    /// Natural-key field on the referenced entity.
    pub field: String,
    /// Source column (or already-mapped field) supplying the value.
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FkLookup {
    /// FK field on the entity being staged.
    pub field: String,
    /// Referenced entity.
    pub entity: String,
    #[serde(rename = "match")]
    pub match_rules: Vec<MatchRule>,
    #[serde(default)]
    pub optional: bool,
}

/// YAML scalar accepted as a default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl DefaultValue {
    pub fn to_cell(&self) -> CellValue {
        match self {
            DefaultValue::Boolean(flag) => CellValue::Boolean(*flag),
            DefaultValue::Integer(number) => CellValue::from(*number),
            DefaultValue::Float(number) => {
                let rendered = number.to_string();
                Decimal::from_str(&rendered)
                    .map(CellValue::Number)
                    .unwrap_or(CellValue::Text(rendered))
            }
            DefaultValue::Text(text) => CellValue::from(text.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetMapping {
    pub sheet: String,
    pub entity: String,
    #[serde(default)]
    pub id: IdSpec,
    #[serde(default, alias = "columnMap")]
    pub column_map: BTreeMap<String, String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, DefaultValue>,
    #[serde(default)]
    pub lookups: Vec<FkLookup>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    pub sheets: Vec<SheetMapping>,
}

impl MappingConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening mapping file {path:?}"))?;
        serde_yaml::from_reader(BufReader::new(file)).context("Parsing mapping YAML")
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context("Parsing mapping YAML")
    }

    /// Checks every mapping against the compiled schema so the engine never
    /// meets an unknown entity or field mid-batch.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        for sheet in &self.sheets {
            let context = || format!("Mapping for sheet '{}' -> {}", sheet.sheet, sheet.entity);
            let entity = schema.require_entity(&sheet.entity).with_context(context)?;
            for field in sheet.column_map.values() {
                ensure!(
                    entity.has_field(field),
                    "{}: column map targets undeclared field '{field}'",
                    context()
                );
            }
            for field in sheet.defaults.keys() {
                ensure!(
                    entity.has_field(field),
                    "{}: default for undeclared field '{field}'",
                    context()
                );
            }
            if let Some(column) = &sheet.id.column {
                ensure!(
                    entity.has_field(column),
                    "{}: id column '{column}' is not a field",
                    context()
                );
            }
            for lookup in &sheet.lookups {
                ensure!(
                    entity.has_field(&lookup.field),
                    "{}: lookup writes undeclared field '{}'",
                    context(),
                    lookup.field
                );
                let target = schema
                    .require_entity(&lookup.entity)
                    .with_context(context)?;
                ensure!(
                    !lookup.match_rules.is_empty(),
                    "{}: lookup for '{}' has no match rules",
                    context(),
                    lookup.field
                );
                for rule in &lookup.match_rules {
                    ensure!(
                        target.has_field(&rule.field),
                        "{}: {} has no field '{}'",
                        context(),
                        lookup.entity,
                        rule.field
                    );
                }
            }
        }
        Ok(())
    }
}

impl SheetMapping {
    /// Field holding the row identifier for this mapping.
    pub fn id_column<'a>(&'a self, default: &'a str) -> &'a str {
        self.id.column.as_deref().unwrap_or(default)
    }
}
