//! Batches lessons and checks the job's cancellation flags between batches.
//!
//! Lessons run one at a time, in order. Batching only creates checkpoints:
//! a pause or stop request is honoured at the next batch boundary, never
//! in the middle of a lesson.

use std::sync::Arc;
use std::time::Duration;

use super::controller::{Controller, ItemOutcome, JobContext};
use super::gateway::Gateway;
use super::sleeper::{Sleeper, Wait};
use crate::state_machine::{Boundary, JobStatus, WorkItem};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub inter_item_delay: Duration,
    pub inter_batch_delay: Duration,
    /// Extra passes over the lessons that failed in the previous pass.
    pub extra_passes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnd {
    #[default]
    Completed,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunReport {
    pub batches: usize,
    pub passes: u32,
    /// Lesson attempts made, skipped lessons excluded.
    pub attempts: usize,
    pub end: RunEnd,
}

/// Splits `items` into consecutive chunks of at most `size` (min 1).
pub fn partition<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

pub struct Scheduler {
    controller: Controller,
    gateway: Arc<Gateway>,
    sleeper: Arc<dyn Sleeper>,
    settings: BatchSettings,
}

impl Scheduler {
    pub fn new(
        controller: Controller,
        gateway: Arc<Gateway>,
        sleeper: Arc<dyn Sleeper>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            controller,
            gateway,
            sleeper,
            settings,
        }
    }

    pub async fn run(&self, ctx: &mut JobContext, items: Vec<WorkItem>) -> RunReport {
        let mut report = RunReport::default();
        if let Some(end) = self.checkpoint(&ctx.job_id).await {
            report.end = end;
            return report;
        }

        let mut pending = items;
        let mut pass = 0u32;
        while !pending.is_empty() {
            if pass > 0 {
                tracing::info!(job_id = %ctx.job_id, pass, lessons = pending.len(), "retrying failed lessons");
                self.sleeper
                    .sleep(Wait::InterBatch, self.settings.inter_batch_delay)
                    .await;
                if let Some(end) = self.checkpoint(&ctx.job_id).await {
                    report.end = end;
                    return report;
                }
            }
            report.passes += 1;

            let mut failed = Vec::new();
            let batches = partition(&pending, self.settings.batch_size);
            let total = batches.len();
            for (index, batch) in batches.into_iter().enumerate() {
                if index > 0 {
                    self.sleeper
                        .sleep(Wait::InterBatch, self.settings.inter_batch_delay)
                        .await;
                    if let Some(end) = self.checkpoint(&ctx.job_id).await {
                        report.end = end;
                        return report;
                    }
                }
                report.batches += 1;
                tracing::info!(
                    job_id = %ctx.job_id,
                    batch = index + 1,
                    of = total,
                    lessons = batch.len(),
                    "batch started"
                );

                let last = batch.len().saturating_sub(1);
                for (position, mut item) in batch.into_iter().enumerate() {
                    let outcome = self.controller.process(ctx, &mut item).await;
                    if outcome != ItemOutcome::Skipped {
                        report.attempts += 1;
                    }
                    if matches!(outcome, ItemOutcome::NeedsFix { .. }) && item.is_retryable() {
                        failed.push(item);
                    }
                    if position < last {
                        self.sleeper
                            .sleep(Wait::InterItem, self.settings.inter_item_delay)
                            .await;
                    }
                }
            }

            pass += 1;
            if pass > self.settings.extra_passes {
                break;
            }
            pending = failed;
        }

        report
    }

    /// Reads the job's flags. `Some` means the run must end here.
    async fn checkpoint(&self, job_id: &str) -> Option<RunEnd> {
        let job = match self.gateway.read_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id, error = %e, "could not read cancellation flags");
                return None;
            }
        };
        let (end, settled) = match job.status.boundary() {
            Boundary::Continue => return None,
            Boundary::Pause => (RunEnd::Paused, JobStatus::Paused),
            Boundary::Stop => (RunEnd::Stopped, JobStatus::Stopped),
        };
        if job.status != settled
            && let Err(e) = self.gateway.transition_job(job_id, settled).await
        {
            tracing::error!(job_id, error = %e, "could not settle cancellation");
        }
        tracing::info!(job_id, requested = %job.status, "run ended at batch boundary");
        Some(end)
    }
}
