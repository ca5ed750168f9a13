//! Pipeline stages and the units of work behind them
//!
//! A stage names a position in the fixed pipeline; a unit says what runs
//! there. The orchestrator only sees [`Outcome`]s, never unit kinds.

mod outcome;
mod runner;

pub use outcome::{Captured, ExitInfo, Outcome, truncate_output};
pub use runner::{DefaultStageRunner, StageRunner};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CommandConfig;
use crate::loader::TableLoadSpec;

/// Position in the fixed pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Bronze,
    Silver,
    Gold,
}

impl Stage {
    /// Every stage in execution order
    pub const ALL: [Stage; 4] = [Stage::Generate, Stage::Bronze, Stage::Silver, Stage::Gold];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
        }
    }

    /// Default audit process name
    pub fn process_name(&self) -> &'static str {
        match self {
            Self::Generate => "data_generation",
            Self::Bronze => "bronze_incremental_load",
            Self::Silver => "silver_transform",
            Self::Gold => "gold_rebuild",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generate" => Ok(Self::Generate),
            "bronze" => Ok(Self::Bronze),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            other => Err(format!(
                "unknown stage '{}', expected one of generate, bronze, silver, gold",
                other
            )),
        }
    }
}

/// External process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandUnit {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Added to the inherited environment
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl CommandUnit {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Builder method to set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&CommandConfig> for CommandUnit {
    fn from(config: &CommandConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// What runs in a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageUnit {
    /// External process; success is exit status 0
    Command(CommandUnit),
    /// In-process staging-then-merge load of each table, in order
    IncrementalLoad { tables: Vec<TableLoadSpec> },
    /// In-process transactional execution of a SQL script
    SqlScript { path: PathBuf },
}

impl StageUnit {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Self::Command(cmd) if cmd.args.is_empty() => format!("command `{}`", cmd.program),
            Self::Command(cmd) => format!("command `{} {}`", cmd.program, cmd.args.join(" ")),
            Self::IncrementalLoad { tables } => format!("incremental load of {} table(s)", tables.len()),
            Self::SqlScript { path } => format!("SQL script {}", path.display()),
        }
    }
}
