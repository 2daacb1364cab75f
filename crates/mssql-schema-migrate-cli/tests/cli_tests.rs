//! CLI integration tests for mssql-schema-migrate.
//!
//! These tests verify command-line argument parsing, help output, exit codes,
//! and the session and progress commands against a JSON session store.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Get a command for the mssql-schema-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("mssql-schema-migrate").unwrap()
}

/// Write a config using a JSON session store under `dir`.
fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("config.yaml");
    let mut content = format!(
        "session_store:\n  backend: json\n  path: {}\n",
        dir.join("sessions").display()
    );
    content.push_str(extra);
    fs::write(&path, content).unwrap();
    path
}

/// Command with `--config` pointing at `config`.
fn with_config(config: &Path) -> Command {
    let mut c = cmd();
    c.args(["--config", config.to_str().unwrap()]);
    c
}

fn create_session(config: &Path, root: &Path) {
    with_config(config)
        .args([
            "session",
            "create",
            "--database",
            "Sales",
            "--server",
            "sqlhost,1433",
            "--folder-root",
            root.to_str().unwrap(),
            "--schema-from",
            "corpuser",
            "--schema-to",
            "sales",
        ])
        .assert()
        .success();
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("session"))
        .stdout(predicate::str::contains("stage"))
        .stdout(predicate::str::contains("progress"))
        .stdout(predicate::str::contains("databases"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_stage_run_help() {
    cmd()
        .args(["stage", "run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--stage"))
        .stdout(predicate::str::contains("--database"))
        .stdout(predicate::str::contains("--counterparty-server"))
        .stdout(predicate::str::contains("--counterparty-database"))
        .stdout(predicate::str::contains("--manifest"));
}

#[test]
fn test_session_create_help() {
    cmd()
        .args(["session", "create", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--folder-root"))
        .stdout(predicate::str::contains("--schema-from"))
        .stdout(predicate::str::contains("--schema-to"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-schema-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flag_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: config.yaml]"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Stage List Tests
// =============================================================================

#[test]
fn test_stage_list_needs_no_config() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "stage", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cleanup-schema"))
        .stdout(predicate::str::contains("move-rows"))
        .stdout(predicate::str::contains("16"));
}

#[test]
fn test_stage_list_json() {
    cmd()
        .args(["--output-json", "stage", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"stage\": 16"))
        .stdout(predicate::str::contains("\"name\": \"apply-objects\""));
}

// =============================================================================
// Exit Code Tests - Config Errors (Exit Code 2)
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_2() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "session", "show", "--database", "Sales"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "session", "show", "--database", "Sales"])
        .assert()
        .code(2);
}

#[test]
fn test_invalid_pipeline_value_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "pipeline:\n  export_attempts: 0\n");

    with_config(&config)
        .args(["session", "show", "--database", "Sales"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("export_attempts"));
}

// =============================================================================
// Session Tests
// =============================================================================

#[test]
fn test_session_create_and_show() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let root = dir.path().join("artifacts");

    create_session(&config, &root);
    assert!(root.join("Sales").join("scripts").is_dir());

    with_config(&config)
        .args(["--output-json", "session", "show", "--database", "Sales"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"database_name\": \"Sales\""))
        .stdout(predicate::str::contains("\"schema_to\": \"sales\""));
}

#[test]
fn test_session_create_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let root = dir.path().join("artifacts");

    create_session(&config, &root);
    let first = with_config(&config)
        .args(["session", "show", "--database", "Sales"])
        .output()
        .unwrap();
    create_session(&config, &root);
    let second = with_config(&config)
        .args(["session", "show", "--database", "Sales"])
        .output()
        .unwrap();

    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn test_session_show_missing_exits_with_code_3() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    with_config(&config)
        .args(["session", "show", "--database", "Nope"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("create the folder first"));
}

#[test]
fn test_set_counterparty() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    create_session(&config, &dir.path().join("artifacts"));

    with_config(&config)
        .args([
            "session",
            "set-counterparty",
            "--database",
            "Sales",
            "--counterparty-server",
            "legacyhost",
            "--counterparty-database",
            "LegacySales",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Counterparty server: legacyhost"))
        .stdout(predicate::str::contains("Counterparty database: LegacySales"));
}

#[test]
fn test_set_counterparty_without_fields_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    create_session(&config, &dir.path().join("artifacts"));

    with_config(&config)
        .args(["session", "set-counterparty", "--database", "Sales"])
        .assert()
        .code(2);
}

#[test]
fn test_session_unlock() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    create_session(&config, &dir.path().join("artifacts"));

    with_config(&config)
        .args(["session", "unlock", "--database", "Sales"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Running:").not());
}

// =============================================================================
// Stage Run Tests
// =============================================================================

#[test]
fn test_stage_run_missing_session_exits_with_code_3() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    with_config(&config)
        .args(["stage", "run", "--stage", "1", "--database", "Nope"])
        .assert()
        .code(3);
}

#[test]
fn test_stage_run_unknown_stage() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    with_config(&config)
        .args(["stage", "run", "--stage", "17", "--database", "Sales"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown stage: 17"));
}

/// Config whose tool runs `sh <scripts>/<script>` with scripts under `dir`.
#[cfg(unix)]
fn shell_tool_config(dir: &Path) -> PathBuf {
    let scripts = dir.join("scripts");
    fs::create_dir_all(&scripts).unwrap();
    write_config(
        dir,
        &format!(
            "tool:\n  program: sh\n  program_args: []\n  scripts_dir: {}\n",
            scripts.display()
        ),
    )
}

#[cfg(unix)]
#[test]
fn test_stage_run_stderr_exits_with_code_5() {
    let dir = TempDir::new().unwrap();
    let config = shell_tool_config(dir.path());
    fs::write(
        dir.path().join("scripts").join("step4.ps1"),
        "echo 'Cannot alter schema' >&2\n",
    )
    .unwrap();
    create_session(&config, &dir.path().join("artifacts"));

    with_config(&config)
        .args(["--output-json", "stage", "run", "--stage", "4", "--database", "Sales"])
        .assert()
        .code(5)
        .stdout(predicate::str::contains("\"status\": \"failed\""));

    let errors = dir.path().join("artifacts").join("Sales").join("ErrorLogs").join("step4");
    let log = fs::read_dir(&errors)
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().contains("_step4_errors_"))
        .map(|e| fs::read_to_string(e.path()).unwrap())
        .unwrap();
    assert!(log.contains("PowerShell Errors:"));
    assert!(log.contains("Cannot alter schema"));
}

#[cfg(unix)]
#[test]
fn test_stage_run_errored_exits_with_code_6() {
    let dir = TempDir::new().unwrap();
    let config = shell_tool_config(dir.path());
    fs::write(dir.path().join("scripts").join("step6.ps1"), "exit 0\n").unwrap();
    create_session(&config, &dir.path().join("artifacts"));

    // Nothing was exported, so the rewrite has no files to work on.
    with_config(&config)
        .args(["stage", "run", "--stage", "6", "--database", "Sales"])
        .assert()
        .code(6)
        .stdout(predicate::str::contains("errored"));
}

// =============================================================================
// Progress Tests
// =============================================================================

#[test]
fn test_progress_lifecycle() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let snapshot = dir.path().join("progress.json");
    fs::write(&snapshot, r#"{"last_stage": 7, "notes": "rerun step 7"}"#).unwrap();

    with_config(&config)
        .args([
            "progress",
            "save",
            "--database",
            "Sales",
            "--file",
            snapshot.to_str().unwrap(),
        ])
        .assert()
        .success();

    with_config(&config)
        .args(["--output-json", "progress", "recover", "--database", "Sales"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"last_stage\": 7"));

    with_config(&config)
        .args(["progress", "delete", "--database", "Sales"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Progress deleted"));

    with_config(&config)
        .args(["progress", "recover", "--database", "Sales"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No saved progress"));
}

#[test]
fn test_progress_save_rejects_invalid_json() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let snapshot = dir.path().join("progress.json");
    fs::write(&snapshot, "not json").unwrap();

    with_config(&config)
        .args([
            "progress",
            "save",
            "--database",
            "Sales",
            "--file",
            snapshot.to_str().unwrap(),
        ])
        .assert()
        .code(1);
}
