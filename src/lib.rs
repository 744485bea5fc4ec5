pub mod cache;
pub mod cli;
pub mod commit;
pub mod data;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod io_utils;
pub mod ledger;
pub mod mapping;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod schema;
pub mod sheet;
pub mod store;
pub mod table;
pub mod transform;
pub mod validate;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use log::{LevelFilter, info};

use crate::{
    cli::{Cli, Commands},
    pipeline::Workspace,
    schema::Schema,
    table::Align,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("sheet_stage", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Stage(args) => pipeline::stage(&args),
        Commands::Commit(args) => pipeline::commit(&args),
        Commands::Order(args) => handle_order(&args),
        Commands::Check(args) => handle_check(&args),
    }
}

fn handle_order(args: &cli::OrderArgs) -> Result<()> {
    let schema = Schema::load(&args.schema)
        .with_context(|| format!("Loading schema from {:?}", args.schema))?;
    let dependencies = schema.dependencies();
    for (idx, entity) in schema.ingestion_order.iter().enumerate() {
        let after = dependencies
            .get(entity)
            .filter(|deps| !deps.is_empty())
            .map(|deps| format!("  (after {})", deps.iter().join(", ")))
            .unwrap_or_default();
        println!("{:>3}. {entity}{after}", idx + 1);
    }
    Ok(())
}

fn handle_check(args: &cli::CheckArgs) -> Result<()> {
    info!(
        "Checking store tables in {:?} (delimiter '{}')",
        args.store.data_dir,
        io_utils::printable_delimiter(
            args.store
                .delimiter
                .unwrap_or(io_utils::DEFAULT_CSV_DELIMITER)
        )
    );
    let workspace = Workspace::open(&args.store)?;
    let mut rows = Vec::new();
    for entity in &workspace.schema.ingestion_order {
        let Some(definition) = workspace.schema.entity(entity) else {
            continue;
        };
        let row = match definition.column_drift() {
            None => vec![entity.clone(), "no table".to_string(), String::new(), String::new()],
            Some(drift) => vec![
                entity.clone(),
                if drift.is_clean() { "ok" } else { "drift" }.to_string(),
                drift.missing_in_store.join(", "),
                drift.extra_in_store.join(", "),
            ],
        };
        rows.push(row);
    }
    table::print_table(
        &["entity", "status", "missing in store", "extra in store"],
        &[Align::Left],
        &rows,
    );
    Ok(())
}
