//! Pipeline sequencing
//!
//! The stage order is data: a [`PipelinePlan`] lists stage descriptors in
//! canonical order and the [`Orchestrator`] walks it in a single loop,
//! stopping at the first failed stage.

mod orchestrator;
mod plan;

pub use orchestrator::{Orchestrator, PIPELINE_PROCESS_NAME};
pub use plan::{PipelinePlan, StageDescriptor};

use std::time::Duration;

use crate::stage::{Outcome, Stage};

/// Where a pipeline run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Running(Stage),
    Succeeded,
    Failed(Stage),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running(stage) => write!(f, "running {}", stage),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(stage) => write!(f, "failed at stage {}", stage),
        }
    }
}

/// One executed stage
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub process_name: String,
    /// Audit row of this stage
    pub audit_id: Option<i64>,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// Result of a pipeline or single-stage run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Audit row of the run
    pub run_id: i64,
    pub state: PipelineState,
    /// Executed stages in order; stages after a failure are absent
    pub stages: Vec<StageReport>,
    pub duration: Duration,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    /// Report of the stage that failed, if any
    pub fn failed_stage(&self) -> Option<&StageReport> {
        match self.state {
            PipelineState::Failed(stage) => self.stages.iter().find(|s| s.stage == stage),
            _ => None,
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| match &s.outcome {
                Outcome::Success { rows_affected, .. } => *rows_affected,
                Outcome::Failure { .. } => 0,
            })
            .sum()
    }
}
