use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{engine::MAX_PASSES, store::DEFAULT_STORE_PATTERN};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Stage spreadsheet exports into append-only CSV tables",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stage every mapped sheet and write staged tables plus a report, without touching the store
    Stage(StageArgs),
    /// Stage, then append the staged rows to the store
    Commit(CommitArgs),
    /// Print the ingestion order derived from the schema
    Order(OrderArgs),
    /// Compare declared fields with the columns of each store table
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Schema definition (YAML)
    #[arg(short, long)]
    pub schema: PathBuf,
    /// Directory holding one CSV table per entity
    #[arg(short, long = "data-dir")]
    pub data_dir: PathBuf,
    /// File name pattern of store tables; `{entity}` is replaced by the entity name
    #[arg(long = "store-pattern", default_value = DEFAULT_STORE_PATTERN)]
    pub store_pattern: String,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
}

#[derive(Debug, Args)]
pub struct StageArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    /// Sheet-to-entity mapping (YAML)
    #[arg(short, long)]
    pub mapping: PathBuf,
    /// Directory holding sheet exports as `<sheet>.csv`
    #[arg(long = "sheets-dir")]
    pub sheets_dir: PathBuf,
    /// Number of header rows at the top of each sheet export
    #[arg(long = "header-rows", default_value_t = 1)]
    pub header_rows: usize,
    /// Character encoding of the sheet exports (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Upper bound on resolution passes
    #[arg(long = "max-passes", default_value_t = MAX_PASSES)]
    pub max_passes: usize,
    /// Where staged tables and report.json are written (defaults to <data-dir>/staging)
    #[arg(long = "staging-dir")]
    pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CommitArgs {
    #[command(flatten)]
    pub stage: StageArgs,
    /// Commit every entity without outstanding errors instead of all-or-nothing
    #[arg(long)]
    pub partial: bool,
    /// Where snapshots of modified tables are kept (defaults to <data-dir>/backups)
    #[arg(long = "backup-dir")]
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct OrderArgs {
    /// Schema definition (YAML)
    #[arg(short, long)]
    pub schema: PathBuf,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

impl StageArgs {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.store.data_dir.join("staging"))
    }
}

impl CommitArgs {
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.stage.store.data_dir.join("backups"))
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
