//! `stage` and `commit` command handlers.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use crate::{
    cli::{CommitArgs, StageArgs, StoreArgs},
    commit::{AppendCommitter, CommitMode},
    data::InputRow,
    engine::{BatchOutcome, StagingEngine},
    io_utils,
    mapping::MappingConfig,
    report::{self, BatchReport, REPORT_FILE},
    schema::Schema,
    sheet::{self, SheetOptions},
    store::{PersistentStore, StoreLayout},
};

/// Everything a run reads before staging starts.
pub struct Workspace {
    pub schema: Schema,
    pub layout: StoreLayout,
    pub store: PersistentStore,
}

impl Workspace {
    /// Loads the schema and the store tables it declares, binding each
    /// entity to its store header.
    pub fn open(args: &StoreArgs) -> Result<Self> {
        let mut schema = Schema::load(&args.schema)
            .with_context(|| format!("Loading schema from {:?}", args.schema))?;
        let mut layout = StoreLayout::new(&args.data_dir).with_pattern(&args.store_pattern)?;
        if let Some(delimiter) = args.delimiter {
            layout.delimiter = delimiter;
        }
        let store = PersistentStore::load(
            layout.clone(),
            schema.entities.keys().map(String::as_str),
        )
        .with_context(|| format!("Loading store from {:?}", args.data_dir))?;
        schema.bind_store_columns(&store);
        Ok(Workspace {
            schema,
            layout,
            store,
        })
    }
}

struct StagedBatch {
    workspace: Workspace,
    outcome: BatchOutcome,
}

fn stage_batch(args: &StageArgs) -> Result<StagedBatch> {
    let workspace = Workspace::open(&args.store)?;
    let mapping = MappingConfig::load(&args.mapping)
        .with_context(|| format!("Loading mapping from {:?}", args.mapping))?;
    let options = SheetOptions {
        header_rows: args.header_rows,
        delimiter: args.store.delimiter,
        encoding: io_utils::resolve_encoding(args.input_encoding.as_deref())?,
    };
    let sheets: BTreeMap<String, Vec<InputRow>> =
        sheet::load_sheets(&args.sheets_dir, &mapping, &options)?;

    info!(
        "Staging {} sheet mapping(s) in order: {}",
        mapping.sheets.len(),
        workspace.schema.ingestion_order.join(" -> ")
    );
    let outcome = StagingEngine::new(&workspace.schema, &mapping, &workspace.store)?
        .with_max_passes(args.max_passes)
        .run(&sheets)?;

    let staging_dir = args.staging_dir();
    report::write_staged(
        &staging_dir,
        &workspace.schema,
        &outcome,
        workspace.layout.delimiter,
    )?;
    Ok(StagedBatch { workspace, outcome })
}

pub fn stage(args: &StageArgs) -> Result<()> {
    let StagedBatch { outcome, .. } = stage_batch(args)?;
    let report = BatchReport::new(&outcome, None);
    let path = args.staging_dir().join(REPORT_FILE);
    report.save(&path)?;
    info!("Report written to {path:?}");
    report::print_summary(&report.summary);
    Ok(())
}

pub fn commit(args: &CommitArgs) -> Result<()> {
    let StagedBatch {
        workspace,
        mut outcome,
    } = stage_batch(&args.stage)?;
    let mode = if args.partial {
        CommitMode::Partial
    } else {
        CommitMode::Strict
    };
    let commit_report =
        AppendCommitter::new(&workspace.schema, &workspace.layout, args.backup_dir())
            .with_mode(mode)
            .commit(&mut outcome)?;

    let aborted = commit_report.aborted;
    let held = commit_report.held.len();
    let appended = commit_report.rows_appended();
    let report = BatchReport::new(&outcome, Some(commit_report));
    let path = args.stage.staging_dir().join(REPORT_FILE);
    report.save(&path)?;
    info!("Report written to {path:?}");
    report::print_summary(&report.summary);

    if aborted {
        bail!("Strict commit aborted: {held} entit(ies) have outstanding errors; nothing was written");
    }
    if held > 0 {
        warn!("Partial commit left {held} entit(ies) with errors untouched");
    }
    info!("✓ Committed {appended} row(s)");
    Ok(())
}
