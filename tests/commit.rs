mod common;

use std::{collections::BTreeMap, fs};

use common::{MAPPING, SCHEMA, TestWorkspace, VENDOR_ABC, row, sheets};
use sha2::{Digest, Sha256};
use sheet_stage::{
    commit::{AppendCommitter, CommitMode, CommitReport},
    data::InputRow,
    engine::{BatchOutcome, EntityState, StagingEngine},
    mapping::MappingConfig,
    schema::Schema,
    store::{PersistentStore, StoreLayout},
};

struct Run {
    schema: Schema,
    layout: StoreLayout,
    outcome: BatchOutcome,
}

fn stage(workspace: &TestWorkspace, input: BTreeMap<String, Vec<InputRow>>) -> Run {
    let mut schema = Schema::from_yaml_str(SCHEMA).expect("schema");
    let layout = StoreLayout::new(workspace.path().join("data"));
    let store = PersistentStore::load(
        layout.clone(),
        schema.entities.keys().map(String::as_str),
    )
    .expect("load store");
    schema.bind_store_columns(&store);
    let mapping = MappingConfig::from_yaml_str(MAPPING).expect("mapping");
    let outcome = StagingEngine::new(&schema, &mapping, &store)
        .expect("engine")
        .run(&input)
        .expect("run");
    Run {
        schema,
        layout,
        outcome,
    }
}

fn commit(workspace: &TestWorkspace, run: &mut Run, mode: CommitMode) -> CommitReport {
    AppendCommitter::new(&run.schema, &run.layout, workspace.path().join("backups"))
        .with_mode(mode)
        .commit(&mut run.outcome)
        .expect("commit")
}

fn mixed_batch() -> BTreeMap<String, Vec<InputRow>> {
    sheets(vec![
        (
            "Vendors",
            vec![row(&[("Code", "XYZ"), ("Vendor", "Xylo")])],
        ),
        ("Units", vec![row(&[("RFI", "RFI-1"), ("NC", "NC-1")])]),
    ])
}

const VENDORS_CSV: &str = "ID,CODE,NAME\n0b6f8a52-6d0e-4c55-9d0b-3c1e1f6a0001,ABC,Acme\n";

#[test]
fn strict_commit_writes_nothing_when_any_entity_has_errors() {
    let workspace = TestWorkspace::new();
    workspace.write("data/VENDORS.csv", VENDORS_CSV);
    let mut run = stage(&workspace, mixed_batch());

    let report = commit(&workspace, &mut run, CommitMode::Strict);

    assert!(report.aborted);
    assert!(report.committed.is_empty());
    assert!(report.snapshots.is_empty());
    assert_eq!(report.held.len(), 1);
    assert_eq!(report.held[0].entity, "UNITSCOPE");
    assert_eq!(report.held[0].outstanding_errors, 1);
    assert_eq!(workspace.read("data/VENDORS.csv"), VENDORS_CSV);
    assert!(!workspace.path().join("data/UNITSCOPE.csv").exists());
    assert!(!workspace.path().join("backups").exists());
    assert_eq!(run.outcome.entity("UNITSCOPE").unwrap().state, EntityState::Error);
    assert_eq!(
        run.outcome.entity("VENDORS").unwrap().state,
        EntityState::Converged
    );
}

#[test]
fn partial_commit_appends_clean_entities_only() {
    let workspace = TestWorkspace::new();
    workspace.write("data/VENDORS.csv", VENDORS_CSV);
    let mut run = stage(&workspace, mixed_batch());

    let report = commit(&workspace, &mut run, CommitMode::Partial);

    assert!(!report.aborted);
    assert_eq!(report.rows_appended(), 1);
    assert_eq!(report.committed[0].entity, "VENDORS");
    assert!(!report.committed[0].created);
    let (headers, rows) = workspace.csv("data/VENDORS.csv");
    assert_eq!(headers, vec!["ID", "CODE", "NAME"]);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], VENDOR_ABC);
    assert_eq!(&rows[1][1..], ["XYZ", "Xylo"]);
    let staged_id = &run.outcome.staged("VENDORS")[0].identifier;
    assert_eq!(&rows[1][0], staged_id);

    assert!(!workspace.path().join("data/UNITSCOPE.csv").exists());
    assert_eq!(
        run.outcome.entity("VENDORS").unwrap().state,
        EntityState::Committed
    );
    assert_eq!(run.outcome.entity("UNITSCOPE").unwrap().state, EntityState::Error);
}

#[test]
fn snapshot_preserves_original_bytes() {
    let workspace = TestWorkspace::new();
    workspace.write("data/VENDORS.csv", VENDORS_CSV);
    let mut run = stage(
        &workspace,
        sheets(vec![("Vendors", vec![row(&[("Code", "XYZ")])])]),
    );

    let report = commit(&workspace, &mut run, CommitMode::Strict);

    assert_eq!(report.snapshots.len(), 1);
    let snapshot = &report.snapshots[0];
    let name = snapshot
        .backup
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap();
    assert!(name.starts_with("VENDORS_"), "{name}");
    assert!(name.ends_with(".bak.csv"), "{name}");
    assert_eq!(fs::read_to_string(&snapshot.backup).unwrap(), VENDORS_CSV);
    assert_eq!(
        snapshot.sha256,
        format!("{:x}", Sha256::digest(VENDORS_CSV.as_bytes()))
    );
    assert_eq!(snapshot.bytes, VENDORS_CSV.len() as u64);
}

#[test]
fn rows_follow_the_existing_store_header() {
    let workspace = TestWorkspace::new();
    workspace.write(
        "data/VENDORS.csv",
        "CODE,ID,LEGACY\nABC,0b6f8a52-6d0e-4c55-9d0b-3c1e1f6a0001,keep\n",
    );
    let mut run = stage(
        &workspace,
        sheets(vec![(
            "Vendors",
            vec![row(&[("Code", "XYZ"), ("Vendor", "dropped")])],
        )]),
    );

    commit(&workspace, &mut run, CommitMode::Strict);

    let (headers, rows) = workspace.csv("data/VENDORS.csv");
    assert_eq!(headers, vec!["CODE", "ID", "LEGACY"]);
    assert_eq!(rows[0], vec!["ABC", VENDOR_ABC, "keep"]);
    assert_eq!(rows[1][0], "XYZ");
    assert_eq!(rows[1][2], "");
}

#[test]
fn missing_trailing_newline_is_repaired_before_appending() {
    let workspace = TestWorkspace::new();
    workspace.write("data/VENDORS.csv", VENDORS_CSV.trim_end());
    let mut run = stage(
        &workspace,
        sheets(vec![("Vendors", vec![row(&[("Code", "XYZ")])])]),
    );

    commit(&workspace, &mut run, CommitMode::Strict);

    let (_, rows) = workspace.csv("data/VENDORS.csv");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][2], "Acme");
    assert_eq!(rows[1][1], "XYZ");
    assert!(!workspace.path().join("data/.VENDORS.csv.tmp").exists());
}

#[test]
fn new_tables_are_created_with_a_header() {
    let workspace = TestWorkspace::new();
    let mut run = stage(
        &workspace,
        sheets(vec![("Units", vec![row(&[("RFI", "RFI-1")])])]),
    );

    let report = commit(&workspace, &mut run, CommitMode::Strict);

    assert!(report.committed[0].created);
    assert!(report.snapshots.is_empty());
    let (headers, rows) = workspace.csv("data/UNITSCOPE.csv");
    assert_eq!(headers, vec!["ID", "RFI_ID", "NC_ID"]);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1], "RFI-1");
    assert_eq!(rows[0][2], "");
}

#[test]
fn recommitting_persisted_rows_changes_nothing() {
    let workspace = TestWorkspace::new();
    workspace.write("data/VENDORS.csv", VENDORS_CSV);
    let mut run = stage(
        &workspace,
        sheets(vec![("Vendors", vec![row(&[("Code", "abc")])])]),
    );

    let report = commit(&workspace, &mut run, CommitMode::Strict);

    assert!(!report.aborted);
    assert_eq!(report.rows_appended(), 0);
    assert!(report.snapshots.is_empty());
    assert_eq!(run.outcome.entity("VENDORS").unwrap().duplicates.len(), 1);
    assert_eq!(workspace.read("data/VENDORS.csv"), VENDORS_CSV);
}

#[test]
fn committed_rows_are_seen_by_the_next_batch() {
    let workspace = TestWorkspace::new();
    let input = || {
        sheets(vec![
            ("Projects", vec![row(&[("Project", "Alpha"), ("Type", "Wind")])]),
            ("Solar", vec![row(&[("Project", "alpha"), ("Capacity (MW)", "4")])]),
        ])
    };
    let mut first = stage(&workspace, input());
    commit(&workspace, &mut first, CommitMode::Strict);
    let project_id = first.outcome.staged("PROJECTS")[0].identifier.clone();

    let second = stage(&workspace, input());
    let projects = second.outcome.entity("PROJECTS").unwrap();
    assert!(projects.staged.is_empty());
    assert_eq!(projects.duplicates[0].identifier.as_ref(), Some(&project_id));
    let solar = second.outcome.staged("SOLARPROJECTATTRIBUTES");
    assert_eq!(solar[0].cell("PROJECT_ID"), project_id);
    assert_eq!(second.outcome.passes, 1);
}

#[test]
fn failed_entity_restores_earlier_ones_and_keeps_its_error() {
    let workspace = TestWorkspace::new();
    workspace.write("data/VENDORS.csv", VENDORS_CSV);
    workspace.write("data/PROJECTS.csv", "ID,NAME,TYPE,VENDOR_ID\n");
    fs::create_dir_all(workspace.path().join("data/.PROJECTS.csv.tmp")).expect("blocking dir");
    let mut run = stage(
        &workspace,
        sheets(vec![
            ("Vendors", vec![row(&[("Code", "XYZ")])]),
            ("Projects", vec![row(&[("Project", "Alpha")])]),
        ]),
    );

    let err = AppendCommitter::new(&run.schema, &run.layout, workspace.path().join("backups"))
        .with_mode(CommitMode::Strict)
        .commit(&mut run.outcome)
        .expect_err("projects cannot be written");

    let message = format!("{err:#}");
    assert!(message.starts_with("Committing PROJECTS:"), "{message}");
    assert!(message.contains("Copying"), "{message}");
    assert!(!message.contains("could not restore"), "{message}");
    assert_eq!(workspace.read("data/VENDORS.csv"), VENDORS_CSV);
    assert_eq!(
        workspace.read("data/PROJECTS.csv"),
        "ID,NAME,TYPE,VENDOR_ID\n"
    );
}
