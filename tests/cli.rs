mod common;

use std::path::Path;

use assert_cmd::Command;
use common::TestWorkspace;
use predicates::str::contains;
use serde_json::Value;

fn sheet_stage() -> Command {
    Command::cargo_bin("sheet-stage").expect("binary exists")
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

/// A workspace with config, an empty data directory and two sheets where the
/// attributes need a second pass to find their project.
fn staged_workspace() -> TestWorkspace {
    let workspace = TestWorkspace::new();
    workspace.write_config();
    workspace.write("sheets/Projects.csv", "Project,Type\nAlpha,solar\nBeta,Wind\n");
    workspace.write("sheets/Solar.csv", "Project,Capacity (MW)\nalpha,12.5\n");
    std::fs::create_dir_all(workspace.path().join("data")).expect("data dir");
    workspace
}

fn stage_args(workspace: &TestWorkspace, command: &str) -> Vec<String> {
    let root = workspace.path();
    vec![
        command.to_string(),
        "-s".to_string(),
        arg(&root.join("schema.yml")).to_string(),
        "-d".to_string(),
        arg(&root.join("data")).to_string(),
        "-m".to_string(),
        arg(&root.join("mapping.yml")).to_string(),
        "--sheets-dir".to_string(),
        arg(&root.join("sheets")).to_string(),
    ]
}

#[test]
fn order_lists_entities_after_their_dependencies() {
    let workspace = TestWorkspace::new();
    let (schema, _) = workspace.write_config();
    sheet_stage()
        .args(["order", "-s", arg(&schema)])
        .assert()
        .success()
        .stdout(contains("1. UNITSCOPE"))
        .stdout(contains("3. PROJECTS  (after VENDORS)"))
        .stdout(contains("4. SOLARPROJECTATTRIBUTES  (after PROJECTS)"));
}

#[test]
fn check_reports_column_drift() {
    let workspace = TestWorkspace::new();
    let (schema, _) = workspace.write_config();
    workspace.write("data/VENDORS.csv", "ID,CODE,LEGACY\n");
    workspace.write("data/UNITSCOPE.csv", "ID,RFI_ID,NC_ID\n");
    sheet_stage()
        .args([
            "check",
            "-s",
            arg(&schema),
            "-d",
            arg(&workspace.path().join("data")),
        ])
        .assert()
        .success()
        .stdout(contains("drift"))
        .stdout(contains("LEGACY"))
        .stdout(contains("no table"))
        .stdout(contains("ok"));
}

#[test]
fn stage_writes_report_and_staged_tables_only() {
    let workspace = staged_workspace();
    sheet_stage()
        .args(stage_args(&workspace, "stage"))
        .assert()
        .success()
        .stdout(contains("2 pass(es), converged"));

    let report: Value =
        serde_json::from_str(&workspace.read("data/staging/report.json")).expect("report json");
    assert_eq!(report["summary"]["passes"], 2);
    assert_eq!(report["summary"]["converged"], true);
    assert_eq!(report["summary"]["stop_reason"], "exhausted");
    assert!(report["commit"].is_null());

    let (headers, rows) = workspace.csv("data/staging/PROJECTS.csv");
    assert_eq!(headers, vec!["ID", "NAME", "TYPE", "VENDOR_ID"]);
    assert_eq!(rows.len(), 2);
    let (_, attributes) = workspace.csv("data/staging/SOLARPROJECTATTRIBUTES.csv");
    assert_eq!(attributes[0][1], rows[0][0]);
    assert!(!workspace.path().join("data/PROJECTS.csv").exists());
}

#[test]
fn strict_commit_fails_when_rows_are_rejected() {
    let workspace = staged_workspace();
    workspace.write("sheets/Units.csv", "RFI,NC\nRFI-1,NC-1\n");
    sheet_stage()
        .args(stage_args(&workspace, "commit"))
        .assert()
        .failure()
        .stderr(contains("Strict commit aborted"));

    assert!(!workspace.path().join("data/PROJECTS.csv").exists());
    let report: Value =
        serde_json::from_str(&workspace.read("data/staging/report.json")).expect("report json");
    assert_eq!(report["commit"]["aborted"], true);
    assert_eq!(report["errors"][0]["entity"], "UNITSCOPE");
    assert_eq!(
        report["errors"][0]["violations"][0]["kind"],
        "XorConstraintViolated"
    );
}

#[test]
fn partial_commit_appends_clean_entities() {
    let workspace = staged_workspace();
    workspace.write("sheets/Units.csv", "RFI,NC\nRFI-1,NC-1\n");
    let mut args = stage_args(&workspace, "commit");
    args.push("--partial".to_string());
    sheet_stage().args(args).assert().success();

    let (_, projects) = workspace.csv("data/PROJECTS.csv");
    assert_eq!(projects.len(), 2);
    let (_, attributes) = workspace.csv("data/SOLARPROJECTATTRIBUTES.csv");
    assert_eq!(attributes.len(), 1);
    assert!(!workspace.path().join("data/UNITSCOPE.csv").exists());

    let report: Value =
        serde_json::from_str(&workspace.read("data/staging/report.json")).expect("report json");
    assert_eq!(report["commit"]["held"][0]["entity"], "UNITSCOPE");
}

#[test]
fn second_commit_of_the_same_sheets_appends_nothing_new_for_projects() {
    let workspace = staged_workspace();
    sheet_stage()
        .args(stage_args(&workspace, "commit"))
        .assert()
        .success();
    let before = workspace.read("data/PROJECTS.csv");

    sheet_stage()
        .args(stage_args(&workspace, "commit"))
        .assert()
        .success();
    assert_eq!(workspace.read("data/PROJECTS.csv"), before);
    assert!(
        std::fs::read_dir(workspace.path().join("data/backups"))
            .expect("backups dir")
            .count()
            >= 1
    );
}

#[test]
fn restaging_removes_files_for_entities_with_nothing_staged() {
    let workspace = staged_workspace();
    sheet_stage()
        .args(stage_args(&workspace, "stage"))
        .assert()
        .success();
    let attributes = workspace
        .path()
        .join("data/staging/SOLARPROJECTATTRIBUTES.csv");
    assert!(attributes.exists());

    std::fs::remove_file(workspace.path().join("sheets/Solar.csv")).expect("remove sheet");
    sheet_stage()
        .args(stage_args(&workspace, "stage"))
        .assert()
        .success();
    assert!(!attributes.exists());
    assert!(workspace.path().join("data/staging/PROJECTS.csv").exists());
}
