//! Recurring pipeline runs
//!
//! The scheduler wakes on a fixed interval or at a daily wall-clock time,
//! takes the run lock, and runs the whole pipeline. A run that finds the lock
//! held is skipped; a failed run is logged and the loop carries on.

mod lock;

pub use lock::RunLock;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeDelta, TimeZone};
use tracing::{debug, error, info, warn};

use crate::config::{ScheduleConfig, parse_daily_at};
use crate::error::ConfigError;
use crate::pipeline::{Orchestrator, PipelineReport};
use crate::stage::StageRunner;

/// When runs happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed delay between runs
    Interval(Duration),
    /// Once a day at a local wall-clock time
    DailyAt(NaiveTime),
}

impl Schedule {
    /// Schedule described by the configuration, if any
    pub fn from_config(config: &ScheduleConfig) -> Result<Option<Self>, ConfigError> {
        match (config.interval_secs, &config.daily_at) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(vec![
                "schedule: set either interval-secs or daily-at, not both".to_string(),
            ])),
            (Some(0), None) => Err(ConfigError::Invalid(vec![
                "schedule.interval-secs must be greater than zero".to_string(),
            ])),
            (Some(secs), None) => Ok(Some(Self::Interval(Duration::from_secs(secs)))),
            (None, Some(value)) => Ok(Some(Self::DailyAt(parse_daily_at(value)?))),
            (None, None) => Ok(None),
        }
    }

    /// First run time strictly after `now`
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        match self {
            Self::Interval(interval) => {
                let delta = TimeDelta::from_std(*interval).unwrap_or_else(|_| TimeDelta::days(36_500));
                now.clone().checked_add_signed(delta).unwrap_or_else(|| now.clone())
            }
            Self::DailyAt(time) => {
                let tz = now.timezone();
                let mut date = now.date_naive();
                // Two days covers today and tomorrow; the third absorbs a DST gap
                for _ in 0..3 {
                    if let Some(candidate) = date.and_time(*time).and_local_timezone(tz.clone()).earliest()
                        && candidate > *now
                    {
                        return candidate;
                    }
                    date = date.succ_opt().unwrap_or(date);
                }
                now.clone() + TimeDelta::days(1)
            }
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(interval) => write!(f, "every {}s", interval.as_secs()),
            Self::DailyAt(time) => write!(f, "daily at {}", time.format("%H:%M")),
        }
    }
}

/// Result of one scheduled wake-up
#[derive(Debug)]
pub enum TickResult {
    /// Pipeline ran (successfully or not)
    Ran(PipelineReport),
    /// Another run held the lock
    Skipped,
    /// The run could not be started or its audit trail could not be written
    Errored(String),
}

/// Drives an orchestrator on a schedule
pub struct Scheduler<R: StageRunner> {
    orchestrator: Orchestrator<R>,
    schedule: Schedule,
    lock_path: PathBuf,
    run_on_start: bool,
}

impl<R: StageRunner> Scheduler<R> {
    pub fn new(orchestrator: Orchestrator<R>, schedule: Schedule, lock_path: PathBuf) -> Self {
        Self {
            orchestrator,
            schedule,
            lock_path,
            run_on_start: false,
        }
    }

    /// Builder method to run once as soon as the loop starts
    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Run the pipeline once under the run lock
    pub async fn tick(&self) -> TickResult {
        debug!(lock = ?self.lock_path, "Scheduler::tick: called");
        let lock = match RunLock::try_acquire(&self.lock_path) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                warn!(lock = %self.lock_path.display(), "Previous run still in progress, skipping this run");
                return TickResult::Skipped;
            }
            Err(e) => {
                error!(lock = %self.lock_path.display(), error = %e, "Cannot open run lock");
                return TickResult::Errored(format!("cannot open run lock {}: {}", self.lock_path.display(), e));
            }
        };

        let result = match self.orchestrator.run().await {
            Ok(report) => {
                if report.is_success() {
                    info!(run_id = report.run_id, "Scheduled run succeeded");
                } else {
                    error!(run_id = report.run_id, state = %report.state, "Scheduled run failed");
                }
                TickResult::Ran(report)
            }
            Err(e) => {
                error!(error = %e, "Scheduled run aborted");
                TickResult::Errored(e.to_string())
            }
        };
        drop(lock);
        result
    }

    /// Loop until `shutdown` resolves, returning how many wake-ups ran
    ///
    /// Shutdown is observed between runs; a run in progress completes first.
    pub async fn run_until<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        info!(schedule = %self.schedule, "Scheduler started");
        tokio::pin!(shutdown);
        let mut ticks = 0;

        if self.run_on_start {
            self.tick().await;
            ticks += 1;
        }

        loop {
            let now = Local::now();
            let next = self.schedule.next_run_after(&now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next = %next.format("%Y-%m-%d %H:%M:%S"), "Next run scheduled");

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    self.tick().await;
                    ticks += 1;
                }
            }
        }
        ticks
    }
}
