//! Fail-fast stage sequencing with audit bookkeeping

use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{PipelinePlan, PipelineReport, PipelineState, StageDescriptor, StageReport};
use crate::audit::{AuditLog, RunStatus};
use crate::error::{EtlError, Result};
use crate::stage::{Outcome, Stage, StageRunner};

/// Audit process name of a full pipeline run
pub const PIPELINE_PROCESS_NAME: &str = "etl_pipeline";

/// Runs a plan stage by stage, stopping at the first failure
///
/// Each run writes one audit row for the pipeline and one per invoked stage.
/// Every row opened by a run is closed before the run returns, unless the
/// audit database itself fails.
pub struct Orchestrator<R: StageRunner> {
    plan: PipelinePlan,
    runner: R,
    audit: AuditLog,
}

impl<R: StageRunner> Orchestrator<R> {
    pub fn new(plan: PipelinePlan, runner: R, audit: AuditLog) -> Self {
        Self { plan, runner, audit }
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Run every stage of the plan in order
    ///
    /// Returns `Err` only when the pipeline audit row cannot be opened or
    /// closed; stage failures are reported through [`PipelineReport::state`].
    pub async fn run(&self) -> Result<PipelineReport> {
        debug!(stages = self.plan.len(), "Orchestrator::run: called");
        let start = Instant::now();
        let pipeline_run = self.audit.begin(PIPELINE_PROCESS_NAME)?;
        let run_id = pipeline_run.run_id();
        info!(run_id, "ETL pipeline started");

        let mut state = PipelineState::NotStarted;
        let mut reports = Vec::with_capacity(self.plan.len());
        let mut failure: Option<String> = None;

        for descriptor in self.plan.stages() {
            state = PipelineState::Running(descriptor.stage);
            let report = self.run_stage(descriptor).await;
            let diagnostic = report.outcome.diagnostic().map(str::to_string);
            reports.push(report);

            if let Some(diagnostic) = diagnostic {
                error!(run_id, stage = %descriptor.stage, %diagnostic, "Stage failed, skipping remaining stages");
                state = PipelineState::Failed(descriptor.stage);
                failure = Some(format!("failed at stage {}: {}", descriptor.stage, diagnostic));
                break;
            }
        }
        if !matches!(state, PipelineState::Failed(_)) {
            state = PipelineState::Succeeded;
        }

        let (status, message) = match &failure {
            Some(message) => (RunStatus::Error, message.clone()),
            None => (
                RunStatus::Success,
                format!("completed {} stage(s)", reports.len()),
            ),
        };
        if let Err(e) = self.audit.end(pipeline_run, status, &message) {
            error!(run_id, error = %e, "Failed to close pipeline audit record");
            return Err(EtlError::Audit(e));
        }

        let report = PipelineReport {
            run_id,
            state,
            stages: reports,
            duration: start.elapsed(),
        };
        match &failure {
            None => info!(
                run_id,
                rows_affected = report.rows_affected(),
                "ETL pipeline completed in {:.2} seconds",
                report.duration.as_secs_f64()
            ),
            Some(message) => error!(run_id, %message, "ETL pipeline failed"),
        }
        Ok(report)
    }

    /// Run one stage on its own, with its own audit row
    pub async fn run_single(&self, stage: Stage) -> Result<PipelineReport> {
        debug!(%stage, "Orchestrator::run_single: called");
        let descriptor = self.plan.get(stage).ok_or(EtlError::StageNotConfigured(stage))?;
        let start = Instant::now();

        let stage_run = self.audit.begin(&descriptor.process_name)?;
        let run_id = stage_run.run_id();
        info!(run_id, %stage, "Single stage started");
        let outcome = self.runner.run(&descriptor.unit).await;

        let status = if outcome.is_success() {
            RunStatus::Success
        } else {
            RunStatus::Error
        };
        self.audit.end(stage_run, status, &outcome.summary())?;

        let state = if outcome.is_success() {
            PipelineState::Succeeded
        } else {
            PipelineState::Failed(stage)
        };
        let duration = start.elapsed();
        Ok(PipelineReport {
            run_id,
            state,
            stages: vec![StageReport {
                stage,
                process_name: descriptor.process_name.clone(),
                audit_id: Some(run_id),
                outcome,
                duration,
            }],
            duration,
        })
    }

    /// Run one stage of a pipeline, bracketing it with an audit row
    ///
    /// Audit failures become stage failures so the pipeline stops.
    async fn run_stage(&self, descriptor: &StageDescriptor) -> StageReport {
        let start = Instant::now();
        info!(stage = %descriptor.stage, process = %descriptor.process_name, "Stage started");

        let stage_run = match self.audit.begin(&descriptor.process_name) {
            Ok(run) => run,
            Err(e) => {
                error!(stage = %descriptor.stage, error = %e, "Failed to open stage audit record");
                return StageReport {
                    stage: descriptor.stage,
                    process_name: descriptor.process_name.clone(),
                    audit_id: None,
                    outcome: Outcome::failure(format!("cannot record stage start: {}", e)),
                    duration: start.elapsed(),
                };
            }
        };
        let audit_id = stage_run.run_id();

        let mut outcome = self.runner.run(&descriptor.unit).await;
        let status = if outcome.is_success() {
            RunStatus::Success
        } else {
            RunStatus::Error
        };
        if let Err(e) = self.audit.end(stage_run, status, &outcome.summary()) {
            warn!(stage = %descriptor.stage, error = %e, "Failed to close stage audit record");
            outcome = Outcome::Failure {
                diagnostic: format!("cannot record stage end: {}", e),
                captured: outcome.captured().clone(),
            };
        }

        let duration = start.elapsed();
        info!(
            stage = %descriptor.stage,
            success = outcome.is_success(),
            "Stage finished in {:.2} seconds",
            duration.as_secs_f64()
        );
        StageReport {
            stage: descriptor.stage,
            process_name: descriptor.process_name.clone(),
            audit_id: Some(audit_id),
            outcome,
            duration,
        }
    }
}
