//! Incremental staging-then-merge loader
//!
//! Each table is loaded in its own transaction:
//!
//! ```text
//! source.csv ──read──► rebuild stg_t ──insert──► stg_t ──upsert──► t
//!                                                 └── cleared before commit
//! ```
//!
//! A failing table rolls back only itself; tables committed earlier in the
//! same run stay committed.

pub mod csv;
pub mod upsert;

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::LoadError;
use crate::warehouse::staging_table_name;
use self::csv::{CsvReader, Field};
use self::upsert::{
    build_clear_staging, build_create_staging, build_drop_staging, build_staging_insert, build_upsert_clause,
};

/// Contract between one source file and one warehouse table
///
/// `columns` must match both the file's column order and the target's column
/// names. `key` is the target's unique key and the upsert conflict target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLoadSpec {
    /// Target table, optionally schema-qualified
    pub target: String,

    /// Source file path
    pub file: PathBuf,

    /// Column names in file order
    pub columns: Vec<String>,

    /// Unique key columns
    pub key: Vec<String>,
}

impl TableLoadSpec {
    pub fn new(target: impl Into<String>, file: impl Into<PathBuf>, columns: &[&str], key: &[&str]) -> Self {
        Self {
            target: target.into(),
            file: file.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            key: key.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Staging table derived from the target name
    pub fn staging_table(&self) -> String {
        staging_table_name(&self.target)
    }

    /// Whether a file header names the declared columns in the declared order
    ///
    /// Comparison ignores case and surrounding whitespace.
    pub fn header_matches(&self, header: &[Field]) -> bool {
        header.len() == self.columns.len()
            && header.iter().zip(&self.columns).all(|(found, expected)| {
                found
                    .as_deref()
                    .is_some_and(|found| found.trim().eq_ignore_ascii_case(expected))
            })
    }
}

/// Result of loading one table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableLoadReport {
    pub table: String,
    /// Rows read from the file into staging
    pub rows_loaded: usize,
    /// Rows inserted or updated in the target (not distinguished)
    pub rows_affected: usize,
    pub duration: Duration,
}

/// Result of loading every table of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub tables: Vec<TableLoadReport>,
}

impl LoadSummary {
    pub fn rows_loaded(&self) -> usize {
        self.tables.iter().map(|t| t.rows_loaded).sum()
    }

    pub fn rows_affected(&self) -> usize {
        self.tables.iter().map(|t| t.rows_affected).sum()
    }
}

/// A run stopped at a failing table
#[derive(Debug, Error)]
#[error("Loading {table} failed after {} committed table(s): {source}", .committed.len())]
pub struct LoadRunError {
    /// Table that failed
    pub table: String,
    /// Tables committed before the failure
    pub committed: Vec<TableLoadReport>,
    #[source]
    pub source: LoadError,
}

/// Read and validate a source file
///
/// Skips one header record and checks every data record against the declared
/// column count. A record with an unenclosed empty key field (NULL) is
/// rejected, since it never matches an existing key on merge.
/// Nothing is written until the whole file has parsed.
pub fn read_source(spec: &TableLoadSpec) -> Result<Vec<Vec<Field>>, LoadError> {
    debug!(file = ?spec.file, "read_source: called");
    let bytes = fs::read(&spec.file).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            LoadError::FileNotFound {
                path: spec.file.clone(),
                source,
            }
        } else {
            LoadError::Io {
                path: spec.file.clone(),
                source,
            }
        }
    })?;

    let text = String::from_utf8(bytes).map_err(|e| {
        let valid = &e.as_bytes()[..e.utf8_error().valid_up_to()];
        LoadError::Format {
            path: spec.file.clone(),
            line: valid.iter().filter(|&&b| b == b'\n').count() + 1,
            message: "file is not valid UTF-8".to_string(),
        }
    })?;

    let records = CsvReader::new(&text)
        .records_after_header()
        .map_err(|e| LoadError::Format {
            path: spec.file.clone(),
            line: e.line(),
            message: e.to_string(),
        })?;

    let expected = spec.columns.len();
    let key_positions: Vec<(usize, &str)> = spec
        .columns
        .iter()
        .enumerate()
        .filter(|(_, column)| spec.key.contains(column))
        .map(|(i, column)| (i, column.as_str()))
        .collect();

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        if record.fields.len() != expected {
            debug!(line = record.line, found = record.fields.len(), expected, "read_source: column count mismatch");
            return Err(LoadError::ColumnMismatch {
                path: spec.file.clone(),
                line: record.line,
                expected,
                found: record.fields.len(),
            });
        }
        if let Some((_, column)) = key_positions.iter().find(|(i, _)| record.fields[*i].is_none()) {
            debug!(line = record.line, column, "read_source: empty key field");
            return Err(LoadError::Format {
                path: spec.file.clone(),
                line: record.line,
                message: format!("key column '{}' is empty", column),
            });
        }
        rows.push(record.fields);
    }

    debug!(rows = rows.len(), "read_source: parsed file");
    Ok(rows)
}

/// Loads source files into warehouse tables over one connection
pub struct IncrementalLoader<'c> {
    conn: &'c mut Connection,
}

impl<'c> IncrementalLoader<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        Self { conn }
    }

    /// Load one table: rebuild staging, fill it from the file, merge, commit
    ///
    /// Staging is recreated from the declared columns on every load.
    pub fn load_table(&mut self, spec: &TableLoadSpec) -> Result<TableLoadReport, LoadError> {
        debug!(table = %spec.target, "IncrementalLoader::load_table: called");
        let start = Instant::now();
        info!(table = %spec.target, file = %spec.file.display(), "Processing table");

        let rows = read_source(spec)?;
        let db = |source| LoadError::Database {
            table: spec.target.clone(),
            source,
        };

        let tx = self.conn.transaction().map_err(db)?;
        tx.execute(&build_drop_staging(spec), []).map_err(db)?;
        tx.execute(&build_create_staging(spec), []).map_err(db)?;

        {
            let mut insert = tx.prepare(&build_staging_insert(spec)).map_err(db)?;
            for row in &rows {
                insert.execute(rusqlite::params_from_iter(row.iter())).map_err(db)?;
            }
        }
        debug!(table = %spec.target, rows = rows.len(), "IncrementalLoader::load_table: staging filled");

        let rows_affected = tx.execute(&build_upsert_clause(spec), []).map_err(db)?;
        tx.execute(&build_clear_staging(spec), []).map_err(db)?;
        tx.commit().map_err(db)?;

        let report = TableLoadReport {
            table: spec.target.clone(),
            rows_loaded: rows.len(),
            rows_affected,
            duration: start.elapsed(),
        };
        info!(
            table = %report.table,
            rows_loaded = report.rows_loaded,
            rows_affected = report.rows_affected,
            "Loaded table in {:.2} seconds",
            report.duration.as_secs_f64()
        );
        Ok(report)
    }

    /// Load tables in order, stopping at the first failure
    pub fn load_all(&mut self, specs: &[TableLoadSpec]) -> Result<LoadSummary, LoadRunError> {
        debug!(count = specs.len(), "IncrementalLoader::load_all: called");
        let mut summary = LoadSummary::default();

        for spec in specs {
            match self.load_table(spec) {
                Ok(report) => summary.tables.push(report),
                Err(source) => {
                    error!(table = %spec.target, error = %source, "Table load failed");
                    return Err(LoadRunError {
                        table: spec.target.clone(),
                        committed: summary.tables,
                        source,
                    });
                }
            }
        }

        info!(
            tables = summary.tables.len(),
            rows_loaded = summary.rows_loaded(),
            rows_affected = summary.rows_affected(),
            "All tables loaded"
        );
        Ok(summary)
    }
}
