//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::stage::Stage;

/// dw - bronze/silver/gold warehouse ETL
#[derive(Parser)]
#[command(
    name = "dw",
    about = "Runs the bronze/silver/gold warehouse pipeline with incremental loads",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Print captured stage output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full pipeline once
    Run,

    /// Run a single stage (generate, bronze, silver, gold)
    Stage {
        #[arg(value_name = "STAGE")]
        stage: Stage,
    },

    /// Run the pipeline on the configured schedule until interrupted
    Schedule,

    /// Validate configuration, source files and scripts without running anything
    Check,

    /// Show recent audit records
    History {
        /// Number of records to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Create the audit table if it does not exist
    InitAudit,
}

/// Output format for history
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Default log file path
pub fn get_log_path() -> PathBuf {
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dwetl")
        .join("logs")
        .join("dwetl.log");
    debug!(?path, "get_log_path: returning path");
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stage_and_globals() {
        let cli = Cli::try_parse_from(["dw", "stage", "gold", "-v", "--log-level", "debug"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Stage { stage: Stage::Gold }));
    }

    #[test]
    fn test_parse_history() {
        let cli = Cli::try_parse_from(["dw", "history", "-n", "5", "--format", "json"]).unwrap();
        match cli.command {
            Command::History { limit, format } => {
                assert_eq!(limit, 5);
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_stage_rejected() {
        assert!(Cli::try_parse_from(["dw", "stage", "platinum"]).is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("table".parse::<OutputFormat>().is_err());
    }
}
