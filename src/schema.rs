//! Compiled entity schema, YAML loading, and ingestion ordering.
//!
//! The schema is runtime data: entities, their fields and the rules that
//! apply to them are loaded from a YAML document and compiled into
//! [`Schema`], which the rest of the crate inspects generically through the
//! [`FieldKind`] tag of each field.
//!
//! ## Responsibilities
//!
//! - YAML schema loading via `serde_yaml`, including named and inline enums
//! - Cross-checking unique constraints, XOR groups and dedup keys against the
//!   declared fields
//! - Deriving the dependency graph and a deterministic ingestion order
//! - Binding the column list of each entity's persistent table

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::File,
    io::BufReader,
    path::Path,
    str::FromStr,
};

use anyhow::{Context, Result, anyhow, bail, ensure};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

use crate::store::PersistentStore;

pub const DEFAULT_ID_FIELD: &str = "ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Identifier,
    Text,
    Integer,
    Decimal,
    Boolean,
    Timestamp,
    Enum { name: String, allowed: Vec<String> },
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Identifier => "identifier",
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Boolean => "boolean",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Enum { .. } => "enum",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Enum { name, .. } => write!(f, "enum({name})"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl FromStr for FieldKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let kind = match normalized.as_str() {
            "identifier" | "uuid" | "guid" | "id" => FieldKind::Identifier,
            "text" | "string" | "largestring" => FieldKind::Text,
            "integer" | "int" | "integer64" => FieldKind::Integer,
            "decimal" | "float" | "double" | "number" => FieldKind::Decimal,
            "boolean" | "bool" => FieldKind::Boolean,
            "timestamp" | "datetime" | "date" => FieldKind::Timestamp,
            other => {
                // String(100), Decimal(15,3) and friends keep their base kind.
                if let Some((base, _)) = other.split_once('(') {
                    return FieldKind::from_str(base);
                }
                return Err(anyhow!("Unknown field type '{value}'"));
            }
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Rows that only break a unique constraint are dropped with a notice.
    Skip,
    #[default]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub key: bool,
    pub required: bool,
    pub references: Option<String>,
}

impl FieldDef {
    pub fn is_required(&self) -> bool {
        self.key || self.required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDefinition {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub id_field: String,
    pub unique: Vec<UniqueConstraint>,
    pub xor_groups: Vec<Vec<String>>,
    pub dedup_key: Vec<String>,
    pub duplicate_policy: DuplicatePolicy,
    pub dependencies: BTreeSet<String>,
    pub store_columns: Option<Vec<String>>,
}

impl EntityDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    pub fn is_deduplicated(&self) -> bool {
        !self.dedup_key.is_empty()
    }

    /// Column order used when writing rows: the store's header if one
    /// exists, otherwise the declared field order.
    pub fn output_columns(&self) -> Vec<String> {
        self.store_columns
            .clone()
            .unwrap_or_else(|| self.field_names())
    }

    /// Declared fields the store header lacks, and store columns the schema
    /// does not declare.
    pub fn column_drift(&self) -> Option<ColumnDrift> {
        let columns = self.store_columns.as_ref()?;
        let missing_in_store = self
            .fields
            .iter()
            .filter(|field| !columns.contains(&field.name))
            .map(|field| field.name.clone())
            .collect();
        let extra_in_store = columns
            .iter()
            .filter(|column| !self.has_field(column))
            .cloned()
            .collect();
        Some(ColumnDrift {
            entity: self.name.clone(),
            missing_in_store,
            extra_in_store,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDrift {
    pub entity: String,
    pub missing_in_store: Vec<String>,
    pub extra_in_store: Vec<String>,
}

impl ColumnDrift {
    pub fn is_clean(&self) -> bool {
        self.missing_in_store.is_empty() && self.extra_in_store.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub entities: BTreeMap<String, EntityDefinition>,
    pub ingestion_order: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    enums: BTreeMap<String, Vec<String>>,
    entities: BTreeMap<String, EntityDocument>,
    #[serde(default)]
    ingestion_order: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct EntityDocument {
    fields: Vec<FieldDocument>,
    #[serde(default)]
    unique: Vec<UniqueConstraint>,
    #[serde(default)]
    xor: Vec<Vec<String>>,
    #[serde(default)]
    dedup_key: Vec<String>,
    #[serde(default)]
    duplicate_policy: DuplicatePolicy,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FieldDocument {
    name: String,
    #[serde(rename = "type")]
    kind: YamlValue,
    #[serde(default)]
    key: bool,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    references: Option<String>,
}

impl Schema {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let document: SchemaDocument =
            serde_yaml::from_reader(BufReader::new(file)).context("Parsing schema YAML")?;
        Self::compile(document).with_context(|| format!("Compiling schema {path:?}"))
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let document: SchemaDocument =
            serde_yaml::from_str(input).context("Parsing schema YAML")?;
        Self::compile(document)
    }

    fn compile(document: SchemaDocument) -> Result<Self> {
        let mut entities = BTreeMap::new();
        for (name, entity) in &document.entities {
            let definition = compile_entity(name, entity, &document.enums)
                .with_context(|| format!("Entity '{name}'"))?;
            entities.insert(name.clone(), definition);
        }

        let known: BTreeSet<String> = entities.keys().cloned().collect();
        for definition in entities.values_mut() {
            let name = definition.name.clone();
            definition.dependencies.retain(|dep| {
                if dep == &name {
                    return false;
                }
                let keep = known.contains(dep);
                if !keep {
                    warn!("Entity '{name}' references unknown entity '{dep}'; ignoring dependency");
                }
                keep
            });
        }

        let ingestion_order = match document.ingestion_order {
            Some(order) => {
                for entity in &order {
                    ensure!(
                        known.contains(entity),
                        "Ingestion order names unknown entity '{entity}'"
                    );
                }
                let mut order = order;
                for entity in &known {
                    if !order.contains(entity) {
                        order.push(entity.clone());
                    }
                }
                order
            }
            None => topo_sort(&dependency_graph(&entities)),
        };

        Ok(Schema {
            entities,
            ingestion_order,
        })
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDefinition> {
        self.entities.get(name)
    }

    pub fn require_entity(&self, name: &str) -> Result<&EntityDefinition> {
        self.entity(name)
            .ok_or_else(|| anyhow!("Entity '{name}' is not declared in the schema"))
    }

    pub fn dependencies(&self) -> BTreeMap<String, BTreeSet<String>> {
        dependency_graph(&self.entities)
    }

    /// Records each entity's persistent column list. Must run before the
    /// schema is shared with the staging engine.
    pub fn bind_store_columns(&mut self, store: &PersistentStore) {
        for definition in self.entities.values_mut() {
            definition.store_columns = store
                .table(&definition.name)
                .filter(|table| !table.headers.is_empty())
                .map(|table| table.headers.clone());
            if let Some(drift) = definition.column_drift()
                && !drift.is_clean()
            {
                warn!(
                    "Column drift for {}: missing in store [{}], extra in store [{}]",
                    drift.entity,
                    drift.missing_in_store.join(", "),
                    drift.extra_in_store.join(", ")
                );
            }
        }
    }
}

fn compile_entity(
    name: &str,
    entity: &EntityDocument,
    enums: &BTreeMap<String, Vec<String>>,
) -> Result<EntityDefinition> {
    let mut fields = Vec::with_capacity(entity.fields.len());
    let mut dependencies: BTreeSet<String> = entity.depends_on.iter().cloned().collect();
    for field in &entity.fields {
        ensure!(
            fields.iter().all(|f: &FieldDef| f.name != field.name),
            "Field '{}' declared twice",
            field.name
        );
        let kind = parse_field_kind(&field.kind, enums)
            .with_context(|| format!("Field '{}'", field.name))?;
        if let Some(target) = &field.references {
            dependencies.insert(target.clone());
        }
        fields.push(FieldDef {
            name: field.name.clone(),
            kind,
            key: field.key,
            required: field.required,
            references: field.references.clone(),
        });
    }

    let id_field = fields
        .iter()
        .find(|field| field.key)
        .or_else(|| fields.iter().find(|field| field.name == DEFAULT_ID_FIELD))
        .map(|field| field.name.clone())
        .ok_or_else(|| anyhow!("No key field declared and no '{DEFAULT_ID_FIELD}' field"))?;
    ensure!(
        fields
            .iter()
            .any(|field| field.name == id_field && field.kind == FieldKind::Identifier),
        "Key field '{id_field}' must be of identifier type"
    );

    let check_fields = |fields_to_check: &[String], what: &str| -> Result<()> {
        ensure!(!fields_to_check.is_empty(), "{what} lists no fields");
        for field in fields_to_check {
            ensure!(
                fields.iter().any(|f| &f.name == field),
                "{what} refers to undeclared field '{field}'"
            );
        }
        Ok(())
    };
    for constraint in &entity.unique {
        check_fields(
            &constraint.fields,
            &format!("Unique constraint '{}'", constraint.name),
        )?;
    }
    for group in &entity.xor {
        check_fields(group, "XOR group")?;
        ensure!(group.len() >= 2, "XOR group needs at least two fields");
    }
    if !entity.dedup_key.is_empty() {
        check_fields(&entity.dedup_key, "Dedup key")?;
    }

    Ok(EntityDefinition {
        name: name.to_string(),
        fields,
        id_field,
        unique: entity.unique.clone(),
        xor_groups: entity.xor.clone(),
        dedup_key: entity.dedup_key.clone(),
        duplicate_policy: entity.duplicate_policy,
        dependencies,
        store_columns: None,
    })
}

fn parse_field_kind(value: &YamlValue, enums: &BTreeMap<String, Vec<String>>) -> Result<FieldKind> {
    if let Some(token) = value.as_str() {
        if let Some(allowed) = enums.get(token) {
            return Ok(FieldKind::Enum {
                name: token.to_string(),
                allowed: allowed.clone(),
            });
        }
        return FieldKind::from_str(token);
    }

    if let Some(mapping) = value.as_mapping()
        && mapping.len() == 1
        && let Some((key, val)) = mapping.iter().next()
    {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("Structured type key must be a string"))?
            .trim()
            .to_ascii_lowercase();
        if key != "enum" {
            bail!("Unsupported structured type '{key}'");
        }
        if let Some(name) = val.as_str() {
            let allowed = enums
                .get(name)
                .ok_or_else(|| anyhow!("Unknown enum '{name}'"))?;
            return Ok(FieldKind::Enum {
                name: name.to_string(),
                allowed: allowed.clone(),
            });
        }
        if let Some(items) = val.as_sequence() {
            let allowed = items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow!("Enum values must be strings"))
                })
                .collect::<Result<Vec<_>>>()?;
            ensure!(!allowed.is_empty(), "Inline enum lists no values");
            return Ok(FieldKind::Enum {
                name: "inline".to_string(),
                allowed,
            });
        }
    }

    Err(anyhow!("Unsupported field type representation: {value:?}"))
}

fn dependency_graph(
    entities: &BTreeMap<String, EntityDefinition>,
) -> BTreeMap<String, BTreeSet<String>> {
    entities
        .iter()
        .map(|(name, definition)| (name.clone(), definition.dependencies.clone()))
        .collect()
}

/// Kahn's algorithm with alphabetical tie-breaking. Entities caught in a
/// cycle are appended in alphabetical order.
pub fn topo_sort(deps: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut nodes: BTreeSet<String> = deps.keys().cloned().collect();
    nodes.extend(deps.values().flatten().cloned());

    let mut incoming: BTreeMap<&str, BTreeSet<&str>> =
        nodes.iter().map(|n| (n.as_str(), BTreeSet::new())).collect();
    let mut outgoing: BTreeMap<&str, BTreeSet<&str>> =
        nodes.iter().map(|n| (n.as_str(), BTreeSet::new())).collect();
    for (node, targets) in deps {
        for target in targets {
            if target == node {
                continue;
            }
            incoming
                .entry(node.as_str())
                .or_default()
                .insert(target.as_str());
            outgoing
                .entry(target.as_str())
                .or_default()
                .insert(node.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = incoming
        .iter()
        .filter(|(_, inbound)| inbound.is_empty())
        .map(|(node, _)| *node)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        let dependents = outgoing.get(node).cloned().unwrap_or_default();
        for dependent in dependents {
            if let Some(inbound) = incoming.get_mut(dependent) {
                inbound.remove(node);
                if inbound.is_empty() {
                    ready.insert(dependent);
                }
            }
        }
    }

    for node in &nodes {
        if !order.contains(node) {
            order.push(node.clone());
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(node, deps)| {
                (
                    node.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn topo_sort_places_dependencies_first() {
        let deps = graph(&[
            ("SERVICEORDERS", &["PROJECTS", "VENDORS"]),
            ("PROJECTS", &["SPVS"]),
            ("SPVS", &[]),
            ("VENDORS", &[]),
        ]);
        assert_eq!(
            topo_sort(&deps),
            vec!["SPVS", "PROJECTS", "VENDORS", "SERVICEORDERS"]
        );
    }

    #[test]
    fn topo_sort_appends_cycles_alphabetically() {
        let deps = graph(&[("B", &["A"]), ("A", &["B"]), ("C", &[])]);
        assert_eq!(topo_sort(&deps), vec!["C", "A", "B"]);
    }

    #[test]
    fn field_kind_parses_sized_types() {
        assert_eq!(FieldKind::from_str("String(100)").unwrap(), FieldKind::Text);
        assert_eq!(
            FieldKind::from_str("Decimal(15,3)").unwrap(),
            FieldKind::Decimal
        );
        assert_eq!(FieldKind::from_str("UUID").unwrap(), FieldKind::Identifier);
        assert!(FieldKind::from_str("Blob").is_err());
    }

    #[test]
    fn references_become_dependencies() {
        let schema = Schema::from_yaml_str(
            r#"
enums:
  Status: [Active, Closed]
entities:
  PROJECTS:
    fields:
      - { name: ID, type: identifier, key: true }
      - { name: NAME, type: text }
      - { name: STATUS, type: Status }
      - { name: SPV_ID, type: identifier, references: SPVS }
  SPVS:
    fields:
      - { name: ID, type: identifier, key: true }
      - { name: NAME, type: text }
"#,
        )
        .unwrap();
        assert_eq!(schema.ingestion_order, vec!["SPVS", "PROJECTS"]);
        let projects = schema.entity("PROJECTS").unwrap();
        assert!(matches!(
            &projects.field("STATUS").unwrap().kind,
            FieldKind::Enum { allowed, .. } if allowed.len() == 2
        ));
    }

    #[test]
    fn unique_constraints_must_name_declared_fields() {
        let err = Schema::from_yaml_str(
            r#"
entities:
  VENDORS:
    fields:
      - { name: ID, type: identifier, key: true }
    unique:
      - { name: unique_code, fields: [CODE] }
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("undeclared field 'CODE'"));
    }
}
