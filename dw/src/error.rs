//! Error types for the ETL engine
//!
//! Each component has its own error enum; [`EtlError`] aggregates them for
//! callers that drive more than one component.

use std::path::PathBuf;
use thiserror::Error;

use crate::stage::Stage;

/// Configuration problems found before any stage runs
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Invalid daily-at time '{value}', expected HH:MM")]
    InvalidTime { value: String },
}

/// Errors raised while loading one source file into one warehouse table
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Source file not found: {path}")]
    FileNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read source file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected {expected} columns, found {found}")]
    ColumnMismatch {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("{path}:{line}: {message}")]
    Format { path: PathBuf, line: usize, message: String },

    #[error("Database error while loading {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Errors raised by the transactional script executor
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("SQL script not found: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unterminated {what} starting on line {line}")]
    Unterminated { what: &'static str, line: usize },

    #[error("Statement {index} ({preview}) controls the transaction and cannot run inside a batch")]
    TransactionControl { index: usize, preview: String },

    #[error("Statement {index} failed ({preview}): {source}")]
    Statement {
        index: usize,
        preview: String,
        /// Statements already applied that a rollback does not undo
        applied_non_transactional: Vec<usize>,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Errors raised by the audit log
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to create audit directory {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid audit table name: {0}")]
    InvalidTable(String),

    #[error("No audit record with id {0}")]
    UnknownRun(i64),

    #[error("Cannot close audit record {run_id} with non-terminal status")]
    NonTerminalStatus { run_id: i64 },

    #[error("Audit log lock poisoned")]
    LockPoisoned,
}

/// Top-level error for orchestration entry points
#[derive(Debug, Error)]
pub enum EtlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Warehouse database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stage {0} is not configured")]
    StageNotConfigured(Stage),
}

/// Convenience alias used by orchestration entry points
pub type Result<T> = std::result::Result<T, EtlError>;
