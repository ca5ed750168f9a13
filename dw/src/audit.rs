//! Persistent audit trail of pipeline and stage runs
//!
//! Every unit of work is bracketed by [`AuditLog::begin`], which inserts an
//! `In Progress` row, and [`AuditLog::end`], which closes it with a terminal
//! status. Each call commits on its own, so a crash mid-run leaves an
//! inspectable row behind. Rows are never deleted.
//!
//! The audit log holds its own connection, separate from the warehouse
//! connections used by stages, so stage rollbacks never touch it.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::AuditError;
use crate::warehouse::{is_valid_table_name, quote_ident};

/// Audit table used when none is configured
pub const DEFAULT_AUDIT_TABLE: &str = "etl_log";

/// Timestamp format stored in the audit table (local time)
const AUDIT_TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Status of an audit row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    #[serde(rename = "In Progress")]
    InProgress,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "In Progress",
            Self::Success => "Success",
            Self::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In Progress" => Ok(Self::InProgress),
            "Success" => Ok(Self::Success),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown audit status '{}'", other)),
        }
    }
}

/// Handle for an open audit row
///
/// Returned by [`AuditLog::begin`] and consumed by [`AuditLog::end`], so a
/// row cannot be closed twice through the same handle.
#[derive(Debug)]
pub struct AuditRun {
    run_id: i64,
    process_name: String,
    started_at: DateTime<Local>,
}

impl AuditRun {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }
}

/// One row of the audit table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub run_id: i64,
    pub process_name: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub status: RunStatus,
    pub message: Option<String>,
}

/// Audit log backed by a SQLite table
pub struct AuditLog {
    conn: Mutex<Connection>,
    table: String,
}

impl AuditLog {
    /// Open the audit database at `path`, creating the table if missing
    pub fn open(path: &Path, table: &str, busy_timeout: Duration) -> Result<Self, AuditError> {
        debug!(?path, %table, "AuditLog::open: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn, table)
    }

    /// In-memory audit log for tests
    pub fn open_in_memory() -> Result<Self, AuditError> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_AUDIT_TABLE)
    }

    pub fn from_connection(conn: Connection, table: &str) -> Result<Self, AuditError> {
        if !is_valid_table_name(table) {
            return Err(AuditError::InvalidTable(table.to_string()));
        }
        let log = Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        };
        log.ensure_table()?;
        Ok(log)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the audit table if it does not exist
    pub fn ensure_table(&self) -> Result<(), AuditError> {
        let conn = self.lock_conn()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT,
                process_name TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_seconds REAL,
                status TEXT NOT NULL,
                message TEXT
            )",
            quote_ident(&self.table)
        ))?;
        Ok(())
    }

    /// Record the start of a unit of work
    pub fn begin(&self, process_name: &str) -> Result<AuditRun, AuditError> {
        debug!(%process_name, "AuditLog::begin: called");
        let started_at = Local::now();
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (process_name, start_time, status) VALUES (?1, ?2, ?3)",
                quote_ident(&self.table)
            ),
            params![
                process_name,
                started_at.format(AUDIT_TIME_FMT).to_string(),
                RunStatus::InProgress.as_str()
            ],
        )?;
        let run_id = conn.last_insert_rowid();
        info!(run_id, %process_name, "Audit record opened");

        Ok(AuditRun {
            run_id,
            process_name: process_name.to_string(),
            started_at,
        })
    }

    /// Close a unit of work with a terminal status
    ///
    /// Returns the recorded duration.
    pub fn end(&self, run: AuditRun, status: RunStatus, message: &str) -> Result<Duration, AuditError> {
        debug!(run_id = run.run_id, %status, "AuditLog::end: called");
        if !status.is_terminal() {
            return Err(AuditError::NonTerminalStatus { run_id: run.run_id });
        }

        let ended_at = Local::now();
        let duration = (ended_at - run.started_at).to_std().unwrap_or_default();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET end_time = ?1, duration_seconds = ?2, status = ?3, message = ?4 WHERE log_id = ?5",
                quote_ident(&self.table)
            ),
            params![
                ended_at.format(AUDIT_TIME_FMT).to_string(),
                duration.as_secs_f64(),
                status.as_str(),
                message,
                run.run_id
            ],
        )?;
        if updated == 0 {
            return Err(AuditError::UnknownRun(run.run_id));
        }

        info!(
            run_id = run.run_id,
            process_name = %run.process_name,
            %status,
            "Audit record closed after {:.2} seconds",
            duration.as_secs_f64()
        );
        Ok(duration)
    }

    /// Latest rows, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT log_id, process_name, start_time, end_time, duration_seconds, status, message \
             FROM {} ORDER BY log_id DESC LIMIT ?1",
            quote_ident(&self.table)
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map([limit], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get(&self, run_id: i64) -> Result<Option<AuditRecord>, AuditError> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT log_id, process_name, start_time, end_time, duration_seconds, status, message \
                     FROM {} WHERE log_id = ?1",
                    quote_ident(&self.table)
                ),
                [run_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Rows still `In Progress`
    pub fn in_progress(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT log_id, process_name, start_time, end_time, duration_seconds, status, message \
             FROM {} WHERE status = ?1 ORDER BY log_id",
            quote_ident(&self.table)
        ))?;
        let records = stmt
            .query_map([RunStatus::InProgress.as_str()], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn.lock().map_err(|_| AuditError::LockPoisoned)
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let status: String = row.get(5)?;
    let status = status
        .parse::<RunStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;
    Ok(AuditRecord {
        run_id: row.get(0)?,
        process_name: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        duration_seconds: row.get(4)?,
        status,
        message: row.get(6)?,
    })
}
