#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sheet_stage::data::{CellValue, InputRow};
use tempfile::{TempDir, tempdir};

pub const SCHEMA: &str = r#"
enums:
  ProjectType: [Solar, Wind]
entities:
  VENDORS:
    fields:
      - { name: ID, type: identifier, key: true }
      - { name: CODE, type: text, required: true }
      - { name: NAME, type: text }
    unique:
      - { name: vendor_code, fields: [CODE] }
    duplicate_policy: skip
  PROJECTS:
    fields:
      - { name: ID, type: identifier, key: true }
      - { name: NAME, type: text, required: true }
      - { name: TYPE, type: { enum: ProjectType } }
      - { name: VENDOR_ID, type: identifier, references: VENDORS }
    dedup_key: [NAME]
  SOLARPROJECTATTRIBUTES:
    fields:
      - { name: ID, type: identifier, key: true }
      - { name: PROJECT_ID, type: identifier, references: PROJECTS, required: true }
      - { name: CAPACITY_MW, type: decimal }
  UNITSCOPE:
    fields:
      - { name: ID, type: identifier, key: true }
      - { name: RFI_ID, type: text }
      - { name: NC_ID, type: text }
    xor:
      - [RFI_ID, NC_ID]
"#;

pub const MAPPING: &str = r#"
sheets:
  - sheet: Vendors
    entity: VENDORS
    column_map: { "Code": CODE, "Vendor": NAME }
  - sheet: Projects
    entity: PROJECTS
    column_map: { "Project": NAME, "Type": TYPE }
    lookups:
      - field: VENDOR_ID
        entity: VENDORS
        match: [{ field: CODE, from: "Vendor Code" }]
        optional: true
  - sheet: Solar
    entity: SOLARPROJECTATTRIBUTES
    column_map: { "Capacity (MW)": CAPACITY_MW }
    lookups:
      - field: PROJECT_ID
        entity: PROJECTS
        match: [{ field: NAME, from: "Project" }]
  - sheet: Units
    entity: UNITSCOPE
    column_map: { "RFI": RFI_ID, "NC": NC_ID }
"#;

pub const VENDOR_ABC: &str = "0b6f8a52-6d0e-4c55-9d0b-3c1e1f6a0001";
pub const PROJECT_BETA: &str = "0b6f8a52-6d0e-4c55-9d0b-3c1e1f6a0002";

/// Builds one input row from `(column, value)` pairs.
pub fn row(cells: &[(&str, &str)]) -> InputRow {
    cells
        .iter()
        .map(|(column, value)| (column.to_string(), CellValue::from(*value)))
        .collect()
}

/// Sheet name to rows, as handed to the staging engine.
pub fn sheets(entries: Vec<(&str, Vec<InputRow>)>) -> BTreeMap<String, Vec<InputRow>> {
    entries
        .into_iter()
        .map(|(sheet, rows)| (sheet.to_string(), rows))
        .collect()
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` under the workspace, creating parent directories.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write temp file");
        path
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.temp_dir.path().join(name)).expect("read temp file")
    }

    /// Header and data rows of a CSV file under the workspace.
    pub fn csv(&self, name: &str) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(self.temp_dir.path().join(name)).expect("open csv");
        let headers = reader
            .headers()
            .expect("headers")
            .iter()
            .map(str::to_string)
            .collect();
        let rows = reader
            .records()
            .map(|record| {
                record
                    .expect("record")
                    .iter()
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        (headers, rows)
    }

    /// Writes the shared schema and mapping, returning their paths.
    pub fn write_config(&self) -> (PathBuf, PathBuf) {
        (
            self.write("schema.yml", SCHEMA),
            self.write("mapping.yml", MAPPING),
        )
    }
}
