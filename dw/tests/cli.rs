//! CLI smoke tests for the `dw` binary

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(dir: &Path, tables_yaml: &str) -> std::path::PathBuf {
    let config = format!(
        "log-file: {root}/dw.log
warehouse:
  path: {root}/warehouse.db
audit:
  table: etl_log
stages:
  bronze:
    tables:
{tables_yaml}
  silver:
    script: {root}/silver.sql
  gold:
    script: {root}/gold.sql
schedule:
  lock-file: {root}/dw.lock
",
        root = dir.display(),
        tables_yaml = tables_yaml
    );
    let path = dir.join("dwetl.yml");
    fs::write(&path, config).unwrap();
    path
}

fn valid_setup(dir: &Path) -> std::path::PathBuf {
    let tables = format!(
        "      - target: crm_cust_info
        file: {}/cust_info.csv
        columns: [cst_id, cst_firstname]
        key: [cst_id]",
        dir.display()
    );
    fs::write(dir.join("cust_info.csv"), "cst_id,cst_firstname\r\n1,Jon\r\n").unwrap();
    fs::write(dir.join("silver.sql"), "CREATE TABLE IF NOT EXISTS silver_c AS SELECT * FROM crm_cust_info WHERE 0;").unwrap();
    fs::write(dir.join("gold.sql"), "DELETE FROM gold_c;\nINSERT INTO gold_c SELECT cst_id FROM crm_cust_info;").unwrap();

    let conn = rusqlite::Connection::open(dir.join("warehouse.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE crm_cust_info (cst_id INTEGER PRIMARY KEY, cst_firstname TEXT);
         CREATE TABLE gold_c (cst_id INTEGER);",
    )
    .unwrap();
    write_config(dir, &tables)
}

fn dw() -> Command {
    Command::cargo_bin("dw").unwrap()
}

#[test]
fn test_help_lists_commands() {
    dw().arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("history"));
}

#[test]
fn test_unknown_stage_is_usage_error() {
    dw().args(["stage", "platinum"]).assert().failure().code(2);
}

#[test]
fn test_missing_config_file_fails() {
    let temp = TempDir::new().unwrap();
    dw().arg("--config")
        .arg(temp.path().join("absent.yml"))
        .arg("check")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_check_reports_invalid_config() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "      []");

    dw().arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("stages.bronze.tables must list at least one table"));
}

#[test]
fn test_check_passes_for_valid_setup() {
    let temp = TempDir::new().unwrap();
    let config = valid_setup(temp.path());

    dw().arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("All checks passed"));
}

#[test]
fn test_run_then_history() {
    let temp = TempDir::new().unwrap();
    let config = valid_setup(temp.path());

    dw().arg("--config").arg(&config).arg("run").assert().success();

    let output = dw()
        .arg("--config")
        .arg(&config)
        .args(["history", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r["status"] == "Success"));
}

#[test]
fn test_verbose_run_prints_in_process_summaries() {
    let temp = TempDir::new().unwrap();
    let config = valid_setup(temp.path());

    dw().arg("--config")
        .arg(&config)
        .args(["-v", "run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("crm_cust_info: 1 row(s) staged"))
        .stdout(predicate::str::contains("statement(s) committed"));
}

#[test]
fn test_run_exits_nonzero_when_a_stage_fails() {
    let temp = TempDir::new().unwrap();
    let config = valid_setup(temp.path());
    fs::remove_file(temp.path().join("cust_info.csv")).unwrap();

    dw().arg("--config")
        .arg(&config)
        .arg("run")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("failed at stage bronze"));
}

#[test]
fn test_init_audit_creates_table() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "      []");

    dw().arg("--config")
        .arg(&config)
        .arg("init-audit")
        .assert()
        .success()
        .stdout(predicate::str::contains("etl_log"));

    let conn = rusqlite::Connection::open(temp.path().join("warehouse.db")).unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'etl_log'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}
