//! dwetl - layered warehouse ETL
//!
//! Runs a fixed four-stage pipeline against a SQLite warehouse:
//!
//! ```text
//! generate ──► bronze ──► silver ──► gold
//!  (process)   (incremental   (script)   (script,
//!               load)                    full rebuild)
//! ```
//!
//! Stages run one at a time and the first failure stops the run. Every run
//! and every invoked stage leaves an audit row behind.
//!
//! # Modules
//!
//! - [`loader`] - staging-then-merge incremental loads of CSV files
//! - [`script`] - all-or-nothing execution of SQL scripts
//! - [`audit`] - persistent run history
//! - [`stage`] - stage units and the runner that executes them
//! - [`pipeline`] - ordered plan and fail-fast orchestrator
//! - [`scheduler`] - recurring runs under a cross-process lock
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface
//!
//! # Example
//!
//! ```ignore
//! use dwetl::{AuditLog, DefaultStageRunner, Orchestrator, PipelinePlan};
//!
//! let plan = PipelinePlan::from_config(&config)?;
//! let audit = AuditLog::open(config.audit_path(), &config.audit.table, timeout)?;
//! let orchestrator = Orchestrator::new(plan, DefaultStageRunner::new(config.warehouse.clone()), audit);
//! let report = orchestrator.run().await?;
//! ```

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod preflight;
pub mod scheduler;
pub mod script;
pub mod stage;
pub mod warehouse;

pub use audit::{AuditLog, AuditRecord, AuditRun, RunStatus};
pub use config::Config;
pub use error::{AuditError, ConfigError, EtlError, LoadError, Result, ScriptError};
pub use loader::{IncrementalLoader, LoadSummary, TableLoadReport, TableLoadSpec};
pub use pipeline::{Orchestrator, PipelinePlan, PipelineReport, PipelineState, StageDescriptor};
pub use scheduler::{RunLock, Schedule, Scheduler};
pub use script::{ScriptReport, TransactionalScriptExecutor};
pub use stage::{DefaultStageRunner, Outcome, Stage, StageRunner, StageUnit};
