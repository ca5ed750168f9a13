//! dw - layered warehouse ETL
//!
//! CLI entry point for running, scheduling and inspecting the pipeline.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail, eyre};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use dwetl::cli::{Cli, Command, OutputFormat, get_log_path};
use dwetl::config::Config;
use dwetl::preflight::{self, CheckStatus};
use dwetl::{
    AuditLog, DefaultStageRunner, Orchestrator, PipelinePlan, PipelineReport, RunLock, RunStatus, Schedule, Scheduler,
    Stage,
};

fn setup_logging(cli_log_level: Option<&str>, config: &Config) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = config.log_file.clone().unwrap_or_else(get_log_path);
    if let Some(parent) = log_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config.log_level.as_deref()) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr.and(Arc::new(log_file)))
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!(log_file = %log_path.display(), "Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), &config).context("Failed to setup logging")?;
    if let Some(source) = &config.source {
        info!(config = %source.display(), "Configuration loaded");
    }
    let verbose = cli.verbose || config.verbose;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run => cmd_run(&config, verbose).await,
        Command::Stage { stage } => cmd_stage(&config, stage, verbose).await,
        Command::Schedule => cmd_schedule(&config, verbose).await,
        Command::Check => cmd_check(&config),
        Command::History { limit, format } => cmd_history(&config, limit, format),
        Command::InitAudit => cmd_init_audit(&config),
    }
}

fn open_audit(config: &Config) -> Result<AuditLog> {
    let path = config.audit_path();
    AuditLog::open(
        path,
        &config.audit.table,
        Duration::from_millis(config.warehouse.busy_timeout_ms),
    )
    .context(format!("Failed to open audit log at {}", path.display()))
}

fn build_orchestrator(config: &Config, verbose: bool) -> Result<Orchestrator<DefaultStageRunner>> {
    config.validate().context("Configuration check failed")?;
    let plan = PipelinePlan::from_config(config).context("Failed to build pipeline plan")?;
    let runner = DefaultStageRunner::new(config.warehouse.clone()).with_verbose(verbose);
    Ok(Orchestrator::new(plan, runner, open_audit(config)?))
}

fn acquire_lock(path: &Path) -> Result<RunLock> {
    RunLock::try_acquire(path)
        .context(format!("Failed to open run lock {}", path.display()))?
        .ok_or_else(|| eyre!("Another pipeline run holds {}", path.display()))
}

async fn cmd_run(config: &Config, verbose: bool) -> Result<()> {
    debug!("cmd_run: called");
    let orchestrator = build_orchestrator(config, verbose)?;
    let _lock = acquire_lock(&config.schedule.lock_file)?;

    let report = orchestrator.run().await.context("Pipeline run aborted")?;
    print_report(&report);
    finish(&report)
}

async fn cmd_stage(config: &Config, stage: Stage, verbose: bool) -> Result<()> {
    debug!(%stage, "cmd_stage: called");
    let orchestrator = build_orchestrator(config, verbose)?;
    let _lock = acquire_lock(&config.schedule.lock_file)?;

    let report = orchestrator.run_single(stage).await.context(format!("Stage {} aborted", stage))?;
    print_report(&report);
    finish(&report)
}

async fn cmd_schedule(config: &Config, verbose: bool) -> Result<()> {
    debug!("cmd_schedule: called");
    let schedule = Schedule::from_config(&config.schedule)?
        .ok_or_else(|| eyre!("No schedule configured: set schedule.interval-secs or schedule.daily-at"))?;
    let orchestrator = build_orchestrator(config, verbose)?;

    println!("{} Scheduler running {} (Ctrl-C to stop)", "▶".cyan(), schedule.to_string().cyan());
    let scheduler = Scheduler::new(orchestrator, schedule, config.schedule.lock_file.clone())
        .with_run_on_start(config.schedule.run_on_start);
    let ticks = scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C, stopping scheduler");
            }
        })
        .await;

    println!("Scheduler stopped after {} run(s)", ticks);
    Ok(())
}

fn cmd_check(config: &Config) -> Result<()> {
    debug!("cmd_check: called");
    let report = preflight::run_checks(config);
    for item in &report.items {
        let icon = match item.status {
            CheckStatus::Ok => "✓".green(),
            CheckStatus::Warning => "!".yellow(),
            CheckStatus::Failed => "✗".red(),
        };
        println!("{} {:<28} {}", icon, item.subject, item.detail);
    }

    if report.is_ok() {
        println!("{}", "All checks passed".green());
        Ok(())
    } else {
        bail!("{} check(s) failed", report.failures().count())
    }
}

fn cmd_history(config: &Config, limit: usize, format: OutputFormat) -> Result<()> {
    debug!(limit, %format, "cmd_history: called");
    let records = open_audit(config)?.recent(limit)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No audit records found");
            }
            for record in records {
                let status = match record.status {
                    RunStatus::Success => record.status.as_str().green(),
                    RunStatus::Error => record.status.as_str().red(),
                    RunStatus::InProgress => record.status.as_str().yellow(),
                };
                let duration = record
                    .duration_seconds
                    .map(|d| format!("{:.2}s", d))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>6} {:<26} {} {:>10} {}",
                    record.run_id.to_string().dimmed(),
                    record.process_name,
                    record.started_at,
                    duration,
                    status
                );
                if let Some(message) = record.message.filter(|m| !m.is_empty()) {
                    println!("       {}", message.dimmed());
                }
            }
        }
    }
    Ok(())
}

fn cmd_init_audit(config: &Config) -> Result<()> {
    debug!("cmd_init_audit: called");
    let audit = open_audit(config)?;
    println!(
        "{} Audit table {} ready in {}",
        "✓".green(),
        audit.table().cyan(),
        config.audit_path().display()
    );
    Ok(())
}

fn print_report(report: &PipelineReport) {
    for stage in &report.stages {
        let icon = if stage.outcome.is_success() {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "{} {:<10} {:>8.2}s  {}",
            icon,
            stage.stage.to_string(),
            stage.duration.as_secs_f64(),
            stage.outcome.summary()
        );
    }
}

fn finish(report: &PipelineReport) -> Result<()> {
    if report.is_success() {
        println!(
            "{} Run {} completed in {:.2}s",
            "✓".green(),
            report.run_id.to_string().cyan(),
            report.duration.as_secs_f64()
        );
        Ok(())
    } else {
        Err(eyre!("Run {} {}", report.run_id, report.state))
    }
}
