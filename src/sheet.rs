//! Sheet export reader.
//!
//! Sheets arrive as CSV exports whose first rows may form a hierarchical
//! header (a group title above several sub-columns). The header rows are
//! merged per column into `Parent > Child` names.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use encoding_rs::Encoding;
use log::{info, warn};

use crate::{
    data::{CellValue, InputRow},
    io_utils,
    mapping::MappingConfig,
};

pub const HEADER_SEPARATOR: &str = " > ";

#[derive(Debug, Clone)]
pub struct SheetOptions {
    pub header_rows: usize,
    pub delimiter: Option<u8>,
    pub encoding: &'static Encoding,
}

impl Default for SheetOptions {
    fn default() -> Self {
        SheetOptions {
            header_rows: 1,
            delimiter: None,
            encoding: encoding_rs::UTF_8,
        }
    }
}

/// Joins the non-blank parts of each column across the header rows.
/// Trailing columns without any header text are dropped.
pub fn merge_header_rows(rows: &[Vec<String>]) -> Vec<String> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut headers = (0..width)
        .map(|col| {
            rows.iter()
                .filter_map(|row| row.get(col))
                .map(|part| part.trim())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(HEADER_SEPARATOR)
        })
        .collect::<Vec<_>>();
    while headers.last().is_some_and(String::is_empty) {
        headers.pop();
    }
    headers
}

pub fn read_sheet(path: &Path, options: &SheetOptions) -> Result<Vec<InputRow>> {
    ensure!(options.header_rows > 0, "A sheet needs at least one header row");
    let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter, false, true)?;
    let mut records = reader.byte_records();

    let mut header_rows = Vec::with_capacity(options.header_rows);
    for idx in 0..options.header_rows {
        match records.next() {
            Some(record) => {
                let record = record.with_context(|| format!("Reading header row {}", idx + 1))?;
                header_rows.push(io_utils::decode_record(&record, options.encoding)?);
            }
            None => break,
        }
    }
    let headers = merge_header_rows(&header_rows);

    let mut rows = Vec::new();
    for (idx, record) in records.enumerate() {
        let line = idx + options.header_rows + 1;
        let record = record.with_context(|| format!("Reading line {line} in {path:?}"))?;
        let decoded = io_utils::decode_record(&record, options.encoding)?;
        if decoded.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        let row = headers
            .iter()
            .zip(decoded)
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, value)| (header.clone(), CellValue::from(value)))
            .collect::<InputRow>();
        rows.push(row);
    }
    Ok(rows)
}

/// Reads `<dir>/<sheet>.csv` once for every sheet the mapping refers to.
pub fn load_sheets(
    dir: &Path,
    mapping: &MappingConfig,
    options: &SheetOptions,
) -> Result<BTreeMap<String, Vec<InputRow>>> {
    let mut sheets = BTreeMap::new();
    for sheet in &mapping.sheets {
        if sheets.contains_key(&sheet.sheet) {
            continue;
        }
        let path = sheet_path(dir, &sheet.sheet);
        if !path.exists() {
            warn!("Sheet '{}' not found at {path:?}; no rows", sheet.sheet);
            sheets.insert(sheet.sheet.clone(), Vec::new());
            continue;
        }
        let rows = read_sheet(&path, options)
            .with_context(|| format!("Reading sheet '{}' from {path:?}", sheet.sheet))?;
        info!("Read {} row(s) from sheet '{}'", rows.len(), sheet.sheet);
        sheets.insert(sheet.sheet.clone(), rows);
    }
    Ok(sheets)
}

fn sheet_path(dir: &Path, sheet: &str) -> PathBuf {
    dir.join(format!("{sheet}.csv"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn merge_header_rows_joins_hierarchy() {
        let headers = merge_header_rows(&[
            row(&["Project", "Vendor", "", ""]),
            row(&["", "Code", "Name", ""]),
        ]);
        assert_eq!(headers, vec!["Project", "Vendor > Code", "Name"]);
    }

    #[test]
    fn merge_header_rows_pads_short_rows() {
        let headers = merge_header_rows(&[row(&["A"]), row(&["", "B"])]);
        assert_eq!(headers, vec!["A", "B"]);
    }
}
