//! Stage runners

use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::outcome::{Captured, ExitInfo, MAX_CAPTURED_CHARS, Outcome, truncate_output};
use super::{CommandUnit, StageUnit};
use crate::config::WarehouseConfig;
use crate::error::{EtlError, ScriptError};
use crate::loader::{IncrementalLoader, TableLoadSpec};
use crate::script::TransactionalScriptExecutor;
use crate::warehouse;

/// Executes one stage unit and reports how it went
///
/// Implementations never return errors: every failure, including a unit
/// that cannot start, becomes [`Outcome::Failure`].
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, unit: &StageUnit) -> Outcome;
}

/// Runs commands as child processes and database units against the warehouse
#[derive(Debug, Clone)]
pub struct DefaultStageRunner {
    warehouse: WarehouseConfig,
    verbose: bool,
}

impl DefaultStageRunner {
    pub fn new(warehouse: WarehouseConfig) -> Self {
        Self {
            warehouse,
            verbose: false,
        }
    }

    /// Print captured process output after each command
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    async fn run_command(&self, unit: &CommandUnit) -> Outcome {
        debug!(program = %unit.program, args = ?unit.args, "DefaultStageRunner::run_command: called");
        let mut command = tokio::process::Command::new(&unit.program);
        command
            .args(&unit.args)
            .envs(&unit.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &unit.working_dir {
            command.current_dir(dir);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program = %unit.program, error = %e, "Failed to start command");
                return Outcome::Failure {
                    diagnostic: format!("failed to start `{}`: {}", unit.program, e),
                    captured: Captured {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit: ExitInfo::SpawnFailed,
                    },
                };
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(unit.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(program = %unit.program, error = %e, "Failed to collect command output");
                return Outcome::failure(format!("failed to collect output of `{}`: {}", unit.program, e));
            }
            Err(_) => {
                warn!(program = %unit.program, timeout = ?unit.timeout, "Command timed out and was killed");
                return Outcome::Failure {
                    diagnostic: format!("`{}` timed out after {}s", unit.program, unit.timeout.as_secs_f64()),
                    captured: Captured {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit: ExitInfo::TimedOut,
                    },
                };
            }
        };

        let exit = match output.status.code() {
            Some(code) => ExitInfo::Code { code },
            None => ExitInfo::Signal,
        };
        let captured = Captured::from_output(&output.stdout, &output.stderr, exit);
        self.echo(&captured);

        if output.status.success() {
            info!(program = %unit.program, "Command finished successfully");
            Outcome::Success {
                rows_affected: 0,
                captured,
            }
        } else {
            let mut diagnostic = format!("`{}` failed: {}", unit.program, captured.exit);
            let stderr = captured.stderr.trim();
            if !stderr.is_empty() {
                let last = stderr.lines().last().unwrap_or_default();
                diagnostic.push_str(&format!(" ({})", last));
            }
            error!(program = %unit.program, exit = %captured.exit, "Command failed");
            Outcome::Failure { diagnostic, captured }
        }
    }

    fn echo(&self, captured: &Captured) {
        if !self.verbose {
            debug!(stdout = %captured.stdout, stderr = %captured.stderr, "captured stage output");
            return;
        }
        if !captured.stdout.is_empty() {
            println!("{}", captured.stdout.trim_end());
        }
        if !captured.stderr.is_empty() {
            eprintln!("{}", captured.stderr.trim_end());
        }
    }

    async fn run_load(&self, tables: &[TableLoadSpec]) -> Outcome {
        debug!(tables = tables.len(), "DefaultStageRunner::run_load: called");
        let warehouse = self.warehouse.clone();
        let tables = tables.to_vec();
        let joined = tokio::task::spawn_blocking(move || -> Result<InProcessResult, EtlError> {
            let mut conn = warehouse::open(&warehouse)?;
            let mut loader = IncrementalLoader::new(&mut conn);
            Ok(match loader.load_all(&tables) {
                Ok(summary) => {
                    let lines: Vec<String> = summary
                        .tables
                        .iter()
                        .map(|t| {
                            format!(
                                "{}: {} row(s) staged, {} row(s) affected in {:.2}s",
                                t.table,
                                t.rows_loaded,
                                t.rows_affected,
                                t.duration.as_secs_f64()
                            )
                        })
                        .collect();
                    Ok((summary.rows_affected() as u64, lines.join("\n")))
                }
                Err(e) => {
                    let committed: Vec<&str> = e.committed.iter().map(|t| t.table.as_str()).collect();
                    let mut diagnostic = e.to_string();
                    if !committed.is_empty() {
                        diagnostic.push_str(&format!("; already committed: {}", committed.join(", ")));
                    }
                    Err(diagnostic)
                }
            })
        })
        .await;
        let outcome = in_process_outcome(joined);
        self.echo(outcome.captured());
        outcome
    }

    async fn run_script(&self, path: &std::path::Path) -> Outcome {
        debug!(?path, "DefaultStageRunner::run_script: called");
        let warehouse = self.warehouse.clone();
        let path = path.to_path_buf();
        let joined = tokio::task::spawn_blocking(move || -> Result<InProcessResult, EtlError> {
            let mut conn = warehouse::open(&warehouse)?;
            let mut executor = TransactionalScriptExecutor::new(&mut conn);
            Ok(match executor.execute_file(&path) {
                Ok(report) => {
                    let summary = format!(
                        "{}: {} statement(s) committed, {} row(s) affected in {:.2}s",
                        path.display(),
                        report.statements.len(),
                        report.rows_affected(),
                        report.duration.as_secs_f64()
                    );
                    Ok((report.rows_affected() as u64, summary))
                }
                Err(e) => Err(script_diagnostic(&e)),
            })
        })
        .await;
        let outcome = in_process_outcome(joined);
        self.echo(outcome.captured());
        outcome
    }
}

#[async_trait]
impl StageRunner for DefaultStageRunner {
    async fn run(&self, unit: &StageUnit) -> Outcome {
        info!(unit = %unit.describe(), "Running stage unit");
        match unit {
            StageUnit::Command(cmd) => self.run_command(cmd).await,
            StageUnit::IncrementalLoad { tables } => self.run_load(tables).await,
            StageUnit::SqlScript { path } => self.run_script(path).await,
        }
    }
}

/// Rows affected plus summary text, or a diagnostic
type InProcessResult = Result<(u64, String), String>;

fn in_process_outcome(joined: Result<Result<InProcessResult, EtlError>, tokio::task::JoinError>) -> Outcome {
    match joined {
        Ok(Ok(Ok((rows_affected, summary)))) => Outcome::Success {
            rows_affected,
            captured: Captured {
                stdout: truncate_output(&summary, MAX_CAPTURED_CHARS),
                stderr: String::new(),
                exit: ExitInfo::InProcess,
            },
        },
        Ok(Ok(Err(diagnostic))) => Outcome::failure(diagnostic),
        Ok(Err(e)) => Outcome::failure(format!("cannot open warehouse: {}", e)),
        Err(e) => Outcome::failure(format!("database task aborted: {}", e)),
    }
}

fn script_diagnostic(err: &ScriptError) -> String {
    match err {
        ScriptError::Statement {
            applied_non_transactional,
            ..
        } if !applied_non_transactional.is_empty() => {
            let indexes: Vec<String> = applied_non_transactional.iter().map(|i| i.to_string()).collect();
            format!(
                "{}; statement(s) {} took effect outside the transaction and were not rolled back",
                err,
                indexes.join(", ")
            )
        }
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sh(script: &str) -> StageUnit {
        StageUnit::Command(CommandUnit::new("sh", &["-c", script]).with_timeout(Duration::from_secs(30)))
    }

    fn runner_in(dir: &std::path::Path) -> DefaultStageRunner {
        DefaultStageRunner::new(WarehouseConfig {
            path: dir.join("warehouse.db"),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_command_success() {
        let temp = tempdir().unwrap();
        let outcome = runner_in(temp.path()).run(&sh("echo ok")).await;

        assert!(outcome.is_success());
        assert!(outcome.captured().stdout.contains("ok"));
        assert_eq!(outcome.captured().exit, ExitInfo::Code { code: 0 });
    }

    #[tokio::test]
    async fn test_command_failure_carries_exit_code_and_stderr() {
        let temp = tempdir().unwrap();
        let outcome = runner_in(temp.path()).run(&sh("echo broken >&2; exit 3")).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.captured().exit, ExitInfo::Code { code: 3 });
        let diagnostic = outcome.diagnostic().unwrap();
        assert!(diagnostic.contains("exit code 3"));
        assert!(diagnostic.contains("broken"));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let temp = tempdir().unwrap();
        let unit = StageUnit::Command(CommandUnit::new("sh", &["-c", "sleep 10"]).with_timeout(Duration::from_millis(100)));
        let outcome = runner_in(temp.path()).run(&unit).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.captured().exit, ExitInfo::TimedOut);
    }

    #[tokio::test]
    async fn test_command_spawn_failure_is_an_outcome() {
        let temp = tempdir().unwrap();
        let unit = StageUnit::Command(CommandUnit::new("definitely-not-a-real-program-dwetl", &[]));
        let outcome = runner_in(temp.path()).run(&unit).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.captured().exit, ExitInfo::SpawnFailed);
    }

    #[tokio::test]
    async fn test_command_env_and_working_dir() {
        let temp = tempdir().unwrap();
        let mut cmd = CommandUnit::new("sh", &["-c", "echo $DW_TEST_VAR > marker.txt"]);
        cmd.working_dir = Some(temp.path().to_path_buf());
        cmd.env.insert("DW_TEST_VAR".to_string(), "hello".to_string());
        let outcome = runner_in(temp.path()).run(&StageUnit::Command(cmd)).await;

        assert!(outcome.is_success());
        let marker = fs::read_to_string(temp.path().join("marker.txt")).unwrap();
        assert_eq!(marker.trim(), "hello");
    }

    #[tokio::test]
    async fn test_script_unit_commits_and_counts_rows() {
        let temp = tempdir().unwrap();
        let script = temp.path().join("gold.sql");
        fs::write(
            &script,
            "CREATE TABLE dim (id INTEGER);\nINSERT INTO dim VALUES (1), (2);\n",
        )
        .unwrap();

        let outcome = runner_in(temp.path()).run(&StageUnit::SqlScript { path: script }).await;
        assert!(outcome.is_success(), "{:?}", outcome);
        assert!(matches!(outcome, Outcome::Success { rows_affected: 2, .. }));
        assert_eq!(outcome.captured().exit, ExitInfo::InProcess);
    }

    #[tokio::test]
    async fn test_script_unit_failure_names_statement() {
        let temp = tempdir().unwrap();
        let script = temp.path().join("gold.sql");
        fs::write(&script, "CREATE TABLE dim (id INTEGER);\nINSERT INTO missing VALUES (1);\n").unwrap();

        let outcome = runner_in(temp.path()).run(&StageUnit::SqlScript { path: script }).await;
        assert!(!outcome.is_success());
        assert!(outcome.diagnostic().unwrap().contains("Statement 2"));
    }

    #[tokio::test]
    async fn test_script_unit_missing_file() {
        let temp = tempdir().unwrap();
        let unit = StageUnit::SqlScript {
            path: temp.path().join("nope.sql"),
        };
        let outcome = runner_in(temp.path()).run(&unit).await;
        assert!(outcome.diagnostic().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_load_unit_reports_missing_source() {
        let temp = tempdir().unwrap();
        let unit = StageUnit::IncrementalLoad {
            tables: vec![TableLoadSpec::new(
                "crm_cust_info",
                temp.path().join("missing.csv"),
                &["cst_id"],
                &["cst_id"],
            )],
        };
        let outcome = runner_in(temp.path()).run(&unit).await;
        assert!(!outcome.is_success());
        assert!(outcome.diagnostic().unwrap().contains("crm_cust_info"));
    }

    #[test]
    fn test_script_diagnostic_mentions_non_transactional_statements() {
        let err = ScriptError::Statement {
            index: 3,
            preview: "INSERT INTO x".to_string(),
            applied_non_transactional: vec![1],
            source: rusqlite::Error::InvalidQuery,
        };
        let diagnostic = script_diagnostic(&err);
        assert!(diagnostic.contains("statement(s) 1 took effect outside the transaction"));
    }
}
