//! Pre-run checks for the `check` command
//!
//! Catches the mistakes that would otherwise fail a stage halfway through a
//! run: invalid configuration, missing source files or scripts, and source
//! headers whose column order differs from the declared column list.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::error::ConfigError;
use crate::loader::TableLoadSpec;
use crate::loader::csv::CsvReader;
use crate::warehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Failed,
}

/// One finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckItem {
    pub subject: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckItem {
    fn new(subject: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub items: Vec<CheckItem>,
}

impl PreflightReport {
    /// True when nothing failed (warnings allowed)
    pub fn is_ok(&self) -> bool {
        !self.items.iter().any(|i| i.status == CheckStatus::Failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckItem> {
        self.items.iter().filter(|i| i.status == CheckStatus::Failed)
    }
}

/// Check a configuration and the files it points at
pub fn run_checks(config: &Config) -> PreflightReport {
    debug!("run_checks: called");
    let mut report = PreflightReport::default();

    match config.validate() {
        Ok(()) => report.items.push(CheckItem::new("config", CheckStatus::Ok, "configuration is valid")),
        Err(ConfigError::Invalid(problems)) => {
            for problem in problems {
                report.items.push(CheckItem::new("config", CheckStatus::Failed, problem));
            }
        }
        Err(e) => report.items.push(CheckItem::new("config", CheckStatus::Failed, e.to_string())),
    }

    for table in &config.stages.bronze.tables {
        report.items.push(check_source(table));
    }
    report.items.extend(check_targets(config));

    for (name, script) in [("silver", &config.stages.silver.script), ("gold", &config.stages.gold.script)] {
        if script.as_os_str().is_empty() {
            continue;
        }
        let item = if script.is_file() {
            CheckItem::new(name, CheckStatus::Ok, format!("script {} found", script.display()))
        } else {
            CheckItem::new(name, CheckStatus::Failed, format!("script {} not found", script.display()))
        };
        report.items.push(item);
    }

    debug!(items = report.items.len(), ok = report.is_ok(), "run_checks: done");
    report
}

/// Source file presence and header order
pub fn check_source(table: &TableLoadSpec) -> CheckItem {
    let subject = table.target.clone();
    let header = match read_header_line(&table.file) {
        Ok(Some(line)) => line,
        Ok(None) => {
            return CheckItem::new(subject, CheckStatus::Failed, format!("{} is empty", table.file.display()));
        }
        Err(e) => {
            return CheckItem::new(subject, CheckStatus::Failed, format!("{}: {}", table.file.display(), e));
        }
    };

    let record = match CsvReader::new(&header).next_record() {
        Ok(Some(record)) => record,
        Ok(None) => {
            return CheckItem::new(subject, CheckStatus::Failed, format!("{} has no header", table.file.display()));
        }
        Err(e) => {
            return CheckItem::new(subject, CheckStatus::Failed, format!("{}: {}", table.file.display(), e));
        }
    };

    if table.header_matches(&record.fields) {
        CheckItem::new(
            subject,
            CheckStatus::Ok,
            format!("{} header matches {} column(s)", table.file.display(), table.columns.len()),
        )
    } else {
        let found: Vec<&str> = record.fields.iter().map(|f| f.as_deref().unwrap_or("")).collect();
        CheckItem::new(
            subject,
            CheckStatus::Failed,
            format!(
                "{} header [{}] does not match declared columns [{}]",
                table.file.display(),
                found.join(", "),
                table.columns.join(", ")
            ),
        )
    }
}

/// First physical line of a file, which the loader always treats as the header
fn read_header_line(path: &Path) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Target tables exist in an already created warehouse
fn check_targets(config: &Config) -> Vec<CheckItem> {
    if !config.warehouse.path.is_file() {
        return vec![CheckItem::new(
            "warehouse",
            CheckStatus::Warning,
            format!("{} does not exist yet", config.warehouse.path.display()),
        )];
    }

    let conn = match warehouse::open(&config.warehouse) {
        Ok(conn) => conn,
        Err(e) => return vec![CheckItem::new("warehouse", CheckStatus::Failed, e.to_string())],
    };

    config
        .stages
        .bronze
        .tables
        .iter()
        .filter(|t| warehouse::is_valid_table_name(&t.target))
        .map(|t| match warehouse::table_exists(&conn, &t.target) {
            Ok(true) => CheckItem::new(&t.target, CheckStatus::Ok, "target table exists"),
            Ok(false) => CheckItem::new(&t.target, CheckStatus::Failed, "target table does not exist"),
            Err(e) => CheckItem::new(&t.target, CheckStatus::Failed, e.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn spec(file: &Path) -> TableLoadSpec {
        TableLoadSpec::new("crm_cust_info", file, &["cst_id", "cst_key"], &["cst_id"])
    }

    #[test]
    fn test_check_source_header_matches() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("cust.csv");
        fs::write(&file, "CST_ID, cst_key\r\n1,AW1\r\n").unwrap();

        assert_eq!(check_source(&spec(&file)).status, CheckStatus::Ok);
    }

    #[test]
    fn test_check_source_header_out_of_order() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("cust.csv");
        fs::write(&file, "cst_key,cst_id\n").unwrap();

        let item = check_source(&spec(&file));
        assert_eq!(item.status, CheckStatus::Failed);
        assert!(item.detail.contains("[cst_key, cst_id]"));
    }

    #[test]
    fn test_check_source_missing_and_empty() {
        let temp = tempdir().unwrap();
        assert_eq!(check_source(&spec(&temp.path().join("nope.csv"))).status, CheckStatus::Failed);

        let empty = temp.path().join("empty.csv");
        fs::write(&empty, "").unwrap();
        assert!(check_source(&spec(&empty)).detail.contains("is empty"));

        let blank_header = temp.path().join("blank.csv");
        fs::write(&blank_header, "\ncst_id,cst_key\n").unwrap();
        let item = check_source(&spec(&blank_header));
        assert_eq!(item.status, CheckStatus::Failed);
        assert!(item.detail.contains("has no header"));
    }

    #[test]
    fn test_run_checks_reports_invalid_config() {
        let report = run_checks(&Config::default());
        assert!(!report.is_ok());
        assert!(report.failures().any(|i| i.detail.contains("stages.bronze.tables")));
    }

    #[test]
    fn test_run_checks_target_tables() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("cust.csv");
        fs::write(&file, "cst_id,cst_key\n").unwrap();
        let silver = temp.path().join("silver.sql");
        let gold = temp.path().join("gold.sql");
        fs::write(&silver, "SELECT 1;").unwrap();
        fs::write(&gold, "SELECT 1;").unwrap();

        let mut config = Config::default();
        config.warehouse.path = temp.path().join("warehouse.db");
        config.stages.bronze.tables = vec![spec(&file)];
        config.stages.silver.script = silver;
        config.stages.gold.script = gold;

        let report = run_checks(&config);
        assert!(report.items.iter().any(|i| i.subject == "warehouse" && i.status == CheckStatus::Warning));
        assert!(report.is_ok(), "{:?}", report);

        let conn = rusqlite::Connection::open(&config.warehouse.path).unwrap();
        conn.execute_batch("CREATE TABLE other (id INTEGER)").unwrap();
        drop(conn);

        let report = run_checks(&config);
        assert!(!report.is_ok());
        assert!(report.failures().any(|i| i.detail == "target table does not exist"));
    }
}
