//! Persistent, append-only CSV tables.
//!
//! One file per entity in a data directory, named by a pattern containing an
//! `{entity}` placeholder. The store is loaded once per run and is read-only
//! to the staging core; only the committer writes to the files it points at.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use encoding_rs::Encoding;
use log::{debug, info};

use crate::io_utils;

/// A persisted row: column name to raw text.
pub type Record = BTreeMap<String, String>;

pub const DEFAULT_STORE_PATTERN: &str = "{entity}.csv";

#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub data_dir: PathBuf,
    pub pattern: String,
    pub delimiter: u8,
    pub encoding: &'static Encoding,
}

impl StoreLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        StoreLayout {
            data_dir: data_dir.into(),
            pattern: DEFAULT_STORE_PATTERN.to_string(),
            delimiter: io_utils::DEFAULT_CSV_DELIMITER,
            encoding: encoding_rs::UTF_8,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        ensure!(
            pattern.contains("{entity}"),
            "Store pattern '{pattern}' lacks an {{entity}} placeholder"
        );
        self.pattern = pattern;
        Ok(self)
    }

    pub fn path_for(&self, entity: &str) -> PathBuf {
        self.data_dir.join(self.pattern.replace("{entity}", entity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub entity: String,
    pub headers: Vec<String>,
    pub rows: Vec<Record>,
}

impl Table {
    pub fn new(entity: impl Into<String>, headers: Vec<String>) -> Self {
        Table {
            entity: entity.into(),
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Record) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PersistentStore {
    layout: Option<StoreLayout>,
    tables: BTreeMap<String, Table>,
}

impl PersistentStore {
    /// A store with no backing directory, used for staging dry runs and tests.
    pub fn in_memory() -> Self {
        PersistentStore::default()
    }

    /// Loads the table for each named entity whose file exists.
    pub fn load<'a, I>(layout: StoreLayout, entities: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut tables = BTreeMap::new();
        for entity in entities {
            let path = layout.path_for(entity);
            if !path.exists() {
                debug!("No store file for {entity} at {path:?}");
                continue;
            }
            let table = read_table(entity, &path, layout.delimiter, layout.encoding)
                .with_context(|| format!("Loading {entity} from {path:?}"))?;
            info!("Loaded {} row(s) of {entity} from {path:?}", table.len());
            tables.insert(entity.to_string(), table);
        }
        Ok(PersistentStore {
            layout: Some(layout),
            tables,
        })
    }

    pub fn insert_table(&mut self, table: Table) {
        self.tables.insert(table.entity.clone(), table);
    }

    pub fn layout(&self) -> Option<&StoreLayout> {
        self.layout.as_ref()
    }

    pub fn table(&self, entity: &str) -> Option<&Table> {
        self.tables.get(entity)
    }

    pub fn rows(&self, entity: &str) -> &[Record] {
        self.tables
            .get(entity)
            .map(|table| table.rows.as_slice())
            .unwrap_or_default()
    }
}

pub fn read_table(
    entity: &str,
    path: &Path,
    delimiter: u8,
    encoding: &'static Encoding,
) -> Result<Table> {
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter, true, false)?;
    let headers = io_utils::reader_headers(&mut reader, encoding)?;
    let mut table = Table::new(entity, headers);
    for (row_idx, record) in reader.byte_records().enumerate() {
        let record =
            record.with_context(|| format!("Reading row {} in {path:?}", row_idx + 2))?;
        let decoded = io_utils::decode_record(&record, encoding)?;
        let row = table
            .headers
            .iter()
            .cloned()
            .zip(decoded)
            .collect::<Record>();
        table.push(row);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_substitutes_entity_into_pattern() {
        let layout = StoreLayout::new("/data")
            .with_pattern("ENTITIES-{entity}.csv")
            .unwrap();
        assert_eq!(
            layout.path_for("VENDORS"),
            PathBuf::from("/data/ENTITIES-VENDORS.csv")
        );
        assert!(StoreLayout::new("/data").with_pattern("fixed.csv").is_err());
    }

    #[test]
    fn missing_tables_read_as_empty() {
        let store = PersistentStore::in_memory();
        assert!(store.rows("VENDORS").is_empty());
        assert!(store.layout().is_none());
    }
}
