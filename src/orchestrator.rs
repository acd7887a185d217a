use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::LecternConfig;
use crate::course::{CoursePlan, Deliverable, PipelineKind, Validity};
use crate::engine::{
    BatchSettings, Controller, ControllerSettings, Gateway, JobContext, JobWrite,
    MaterialsGeneration, ModelSequence, Pipeline, RunEnd, RunReport, Scheduler, Sleeper,
    SourceCuration, TokioSleeper,
};
use crate::error::LecternError;
use crate::genai::ContentGenerator;
use crate::state_machine::{
    Boundary, Job, JobMachine, JobStatus, LessonMachine, LessonStatus, TransitionError, WorkItem,
};
use crate::store::{JobStore, StoreError};
use crate::validator::ResourceCheck;

/// What a caller supplies to start a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub artifact_id: String,
    pub job_id: String,
    pub custom_prompt: Option<String>,
}

/// Summary written at the end of every run.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub artifact_id: String,
    pub pipeline: PipelineKind,
    pub status: JobStatus,
    pub end: RunEnd,
    pub passes: u32,
    pub batches: usize,
    pub attempts: usize,
    pub lessons: usize,
    pub approvable: usize,
    pub needs_fix: usize,
    pub blocked: usize,
    pub pending: usize,
    pub results: usize,
    pub active_model: String,
    pub model_switches: u32,
    pub persistence_failures: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    pub fn from_run(
        job: &Job,
        items: &[WorkItem],
        results: usize,
        report: &RunReport,
        ctx: &JobContext,
        started_at: DateTime<Utc>,
        persistence_failures: usize,
    ) -> Self {
        let now = Utc::now();
        let count = |status: LessonStatus| items.iter().filter(|i| i.status == status).count();
        Self {
            job_id: job.id.clone(),
            artifact_id: job.artifact_id.clone(),
            pipeline: job.pipeline,
            status: job.status,
            end: report.end,
            passes: report.passes,
            batches: report.batches,
            attempts: report.attempts,
            lessons: items.len(),
            approvable: count(LessonStatus::Approvable),
            needs_fix: count(LessonStatus::NeedsFix),
            blocked: count(LessonStatus::Blocked),
            pending: count(LessonStatus::Pending),
            results,
            active_model: job.active_model.clone(),
            model_switches: ctx.model_switches,
            persistence_failures,
            started_at,
            completed_at: now,
            duration_ms: (now - started_at).num_milliseconds(),
        }
    }
}

/// The polled view of a job: its row, every lesson with status, DoD and
/// errors, and the stored results.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job: Job,
    pub items: Vec<WorkItem>,
    pub results: Vec<Deliverable>,
}

/// Entry points for jobs. The only writer of job and lesson state.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    generator: Arc<dyn ContentGenerator>,
    checker: Arc<dyn ResourceCheck>,
    sleeper: Arc<dyn Sleeper>,
    config: LecternConfig,
}

fn job_error(job_id: &str) -> impl FnOnce(StoreError) -> LecternError + '_ {
    move |e| match e {
        StoreError::NotFound { .. } => LecternError::JobNotFound(job_id.to_string()),
        other => LecternError::Store(other),
    }
}

fn refused(job: &Job, to: JobStatus) -> LecternError {
    LecternError::Transition(TransitionError::Job {
        id: job.id.clone(),
        from: job.status,
        to,
    })
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        generator: Arc<dyn ContentGenerator>,
        checker: Arc<dyn ResourceCheck>,
        config: LecternConfig,
    ) -> Self {
        Self {
            store,
            generator,
            checker,
            sleeper: Arc::new(TokioSleeper),
            config,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &LecternConfig {
        &self.config
    }

    fn gateway(&self) -> Arc<Gateway> {
        Arc::new(Gateway::new(
            self.store.clone(),
            self.config.max_results_per_item,
        ))
    }

    fn pipeline(&self, kind: PipelineKind) -> Arc<dyn Pipeline> {
        match kind {
            PipelineKind::Sources => Arc::new(SourceCuration::new(
                self.checker.clone(),
                self.config.max_results_per_item,
            )),
            PipelineKind::Materials => Arc::new(MaterialsGeneration),
        }
    }

    pub async fn import_plan(&self, plan: &CoursePlan) -> Result<(), LecternError> {
        self.store.put_plan(plan).await?;
        tracing::info!(
            artifact_id = %plan.artifact_id,
            lessons = plan.lesson_count(),
            "course plan imported"
        );
        Ok(())
    }

    async fn read_job(&self, job_id: &str) -> Result<Job, LecternError> {
        self.store
            .job(job_id)
            .await?
            .ok_or_else(|| LecternError::JobNotFound(job_id.to_string()))
    }

    /// Writes a fresh job and its lessons from the course plan, clearing
    /// anything a previous run under the same id left behind.
    pub async fn prepare(
        &self,
        pipeline: PipelineKind,
        request: TriggerRequest,
    ) -> Result<Job, LecternError> {
        let plan = self
            .store
            .plan(&request.artifact_id)
            .await?
            .ok_or_else(|| LecternError::MissingPlan(request.artifact_id.clone()))?;

        if let Some(existing) = self.store.job(&request.job_id).await?
            && existing.status.is_running()
        {
            return Err(refused(&existing, JobStatus::Generating));
        }

        let job = Job::new(
            request.job_id,
            request.artifact_id,
            pipeline,
            self.config.active_model.clone(),
            self.config.fallback_model.clone(),
            request.custom_prompt,
        );
        let items: Vec<WorkItem> = plan
            .lessons()
            .map(|(module, lesson)| {
                WorkItem::new(&job.id, &module.id, lesson, self.config.iteration_cap)
            })
            .collect();
        self.gateway().reset_job(&job, &items).await?;
        Ok(job)
    }

    /// Prepares the job and starts it in the background.
    pub async fn trigger(
        self: &Arc<Self>,
        pipeline: PipelineKind,
        request: TriggerRequest,
    ) -> Result<Job, LecternError> {
        self.config.require_api_key()?;
        let job = self.prepare(pipeline, request).await?;
        self.spawn(job.id.clone());
        Ok(job)
    }

    /// Re-runs the most recent job for a course from scratch. Results of the
    /// previous run are cleared before anything new is written.
    pub async fn retrigger(
        self: &Arc<Self>,
        artifact_id: &str,
        pipeline: PipelineKind,
    ) -> Result<Job, LecternError> {
        self.config.require_api_key()?;
        let job = self.prepare_retrigger(artifact_id, pipeline).await?;
        self.spawn(job.id.clone());
        Ok(job)
    }

    pub async fn prepare_retrigger(
        &self,
        artifact_id: &str,
        pipeline: PipelineKind,
    ) -> Result<Job, LecternError> {
        let latest = self
            .store
            .latest_job(artifact_id, pipeline)
            .await?
            .ok_or_else(|| LecternError::ArtifactNotFound(artifact_id.to_string()))?;
        tracing::info!(job_id = %latest.id, artifact_id, "re-triggering job");
        let mut job = self
            .prepare(
                pipeline,
                TriggerRequest {
                    artifact_id: artifact_id.to_string(),
                    job_id: latest.id.clone(),
                    custom_prompt: latest.custom_prompt.clone(),
                },
            )
            .await?;
        // Keep the original creation time so the row stays the latest.
        job.created_at = latest.created_at;
        self.store.upsert_job(&job).await?;
        Ok(job)
    }

    /// Continues a paused job with its pending lessons and the failed ones
    /// still under their iteration cap.
    pub async fn resume(self: &Arc<Self>, job_id: &str) -> Result<Job, LecternError> {
        self.config.require_api_key()?;
        let job = self.read_job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(refused(&job, JobStatus::Generating));
        }
        self.spawn(job.id.clone());
        Ok(job)
    }

    pub fn spawn(self: &Arc<Self>, job_id: String) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run(&job_id).await {
                Ok(record) => tracing::info!(
                    job_id,
                    status = %record.status,
                    results = record.results,
                    duration_ms = record.duration_ms,
                    "run finished"
                ),
                Err(e) => tracing::error!(job_id, error = %e, "run failed"),
            }
        })
    }

    /// Runs a job to its next resting point and returns the audit record.
    pub async fn run(&self, job_id: &str) -> Result<AuditRecord, LecternError> {
        let started_at = Utc::now();
        let job = self.read_job(job_id).await?;
        if job.status.is_running() {
            return Err(refused(&job, JobStatus::Generating));
        }

        // Only the caller whose write moved the job into GENERATING owns the run.
        let gateway = self.gateway();
        match gateway
            .transition_job(job_id, JobStatus::Generating)
            .await
            .map_err(job_error(job_id))?
        {
            JobWrite::Applied => {}
            JobWrite::Unchanged | JobWrite::Ignored { .. } => {
                return Err(refused(&job, JobStatus::Generating));
            }
        }

        let models = ModelSequence::new(
            &job.active_model,
            &job.fallback_model,
            self.config.stable_model(),
        );
        let controller = Controller::new(
            self.generator.clone(),
            self.pipeline(job.pipeline),
            gateway.clone(),
            self.sleeper.clone(),
            models,
            ControllerSettings {
                max_passes: self.config.max_retry_passes,
                model_switch_delay: self.config.model_switch_delay(),
                backoff: self.config.backoff_policy(),
            },
        );
        let scheduler = Scheduler::new(
            controller,
            gateway.clone(),
            self.sleeper.clone(),
            BatchSettings {
                batch_size: self.config.batch_size,
                inter_item_delay: self.config.inter_item_delay(),
                inter_batch_delay: self.config.inter_batch_delay(),
                extra_passes: self.config.extra_failed_passes,
            },
        );

        let items: Vec<WorkItem> = self
            .store
            .work_items(job_id)
            .await?
            .into_iter()
            .filter(WorkItem::is_retryable)
            .collect();
        tracing::info!(
            job_id,
            pipeline = %job.pipeline,
            lessons = items.len(),
            model = %job.active_model,
            "run started"
        );

        let mut ctx = JobContext::from_job(&job);
        let report = scheduler.run(&mut ctx, items).await;
        if report.end == RunEnd::Completed {
            self.finalize(&gateway, job_id).await?;
        }

        let job = self.read_job(job_id).await?;
        let items = self.store.work_items(job_id).await?;
        let results = self.store.results(job_id).await?.len();
        Ok(AuditRecord::from_run(
            &job,
            &items,
            results,
            &report,
            &ctx,
            started_at,
            gateway.failures(),
        ))
    }

    /// Projects the lessons onto the job once every batch has run. A stop
    /// that arrived during the last batch still wins.
    async fn finalize(&self, gateway: &Gateway, job_id: &str) -> Result<(), LecternError> {
        let job = gateway.read_job(job_id).await?;
        if job.status.boundary() == Boundary::Stop {
            gateway.transition_job(job_id, JobStatus::Stopped).await?;
            return Ok(());
        }
        gateway.transition_job(job_id, JobStatus::Validating).await?;
        let mut items = self.store.work_items(job_id).await?;
        // A lost lesson write leaves the lesson in progress. Settle it as a
        // failure so it is retried and the job does not stay VALIDATING.
        for item in items.iter_mut().filter(|i| i.status.is_in_progress()) {
            tracing::warn!(job_id, item_id = %item.id, status = %item.status, "lesson left in progress");
            if LessonMachine::fail(item, "attempt interrupted before its outcome was stored".into())
                .is_ok()
            {
                gateway.record_item(item).await;
            }
        }
        let target = match JobMachine::project(&items) {
            JobStatus::Generating => JobStatus::NeedsFix,
            projected => projected,
        };
        gateway.transition_job(job_id, target).await?;
        Ok(())
    }

    /// Asks a running job to pause at its next batch boundary.
    pub async fn request_pause(&self, job_id: &str) -> Result<JobStatus, LecternError> {
        self.request(job_id, JobStatus::PausedRequested).await
    }

    /// Asks a running job to stop at its next batch boundary. A paused job
    /// has nobody to observe the flag, so it stops right away.
    pub async fn request_stop(&self, job_id: &str) -> Result<JobStatus, LecternError> {
        let job = self.read_job(job_id).await?;
        let target = if job.status == JobStatus::Paused {
            JobStatus::Stopped
        } else {
            JobStatus::StoppedRequested
        };
        self.request(job_id, target).await
    }

    /// Operator override: the job goes to STOPPED now. A run still in flight
    /// sees it at its next boundary and exits.
    pub async fn force_stop(&self, job_id: &str) -> Result<JobStatus, LecternError> {
        self.request(job_id, JobStatus::Stopped).await
    }

    /// QA decision on a finished job.
    pub async fn review(&self, job_id: &str, approve: bool) -> Result<JobStatus, LecternError> {
        let target = if approve {
            JobStatus::Approved
        } else {
            JobStatus::Rejected
        };
        self.request(job_id, target).await
    }

    async fn request(&self, job_id: &str, to: JobStatus) -> Result<JobStatus, LecternError> {
        let job = self.read_job(job_id).await?;
        match self
            .gateway()
            .transition_job(job_id, to)
            .await
            .map_err(job_error(job_id))?
        {
            write if write.holds() => Ok(to),
            _ => Err(refused(&job, to)),
        }
    }

    /// Human override of a result's validity flag.
    pub async fn override_validity(
        &self,
        result_id: &str,
        validity: Validity,
    ) -> Result<(), LecternError> {
        self.store
            .set_result_validity(result_id, validity)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => LecternError::ResultNotFound(result_id.to_string()),
                other => LecternError::Store(other),
            })?;
        tracing::info!(result_id, ?validity, "result validity overridden");
        Ok(())
    }

    pub async fn snapshot(&self, job_id: &str) -> Result<JobSnapshot, LecternError> {
        let job = self.read_job(job_id).await?;
        let items = self.store.work_items(job_id).await?;
        let results = self.store.results(job_id).await?;
        Ok(JobSnapshot {
            job,
            items,
            results,
        })
    }
}
