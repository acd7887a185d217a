//! Write path between the engine and the store.
//!
//! Results are replaced per lesson (clear, then insert) so replaying a write
//! never grows the result set. Failures inside a run are logged and counted,
//! never raised: the loop keeps going with the next lesson.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::course::Deliverable;
use crate::state_machine::{Job, JobStatus, WorkItem};
use crate::store::{JobStore, StoreError};

/// Outcome of a job status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWrite {
    Applied,
    /// The job already had the requested status; nothing was written.
    Unchanged,
    /// Transition not allowed from the stored status. Not an error: a
    /// late write after a forced stop lands here.
    Ignored { current: JobStatus },
}

impl JobWrite {
    /// Whether the job now holds the requested status.
    pub fn holds(self) -> bool {
        matches!(self, JobWrite::Applied | JobWrite::Unchanged)
    }
}

pub struct Gateway {
    store: Arc<dyn JobStore>,
    fan_out_limit: usize,
    failures: AtomicUsize,
}

impl Gateway {
    pub fn new(store: Arc<dyn JobStore>, fan_out_limit: usize) -> Self {
        Self {
            store,
            fan_out_limit: fan_out_limit.max(1),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn fan_out_limit(&self) -> usize {
        self.fan_out_limit
    }

    /// Persistence failures swallowed since this gateway was built.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    fn note_failure(&self, op: &str, id: &str, error: &StoreError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(op, id, error = %error, "persistence failure");
    }

    /// Fresh start for a job: prior results and lessons go, then the job row
    /// and its new lessons are written.
    pub async fn reset_job(&self, job: &Job, items: &[WorkItem]) -> Result<(), StoreError> {
        self.store.delete_results(&job.id).await?;
        self.store.delete_work_items(&job.id).await?;
        self.store.upsert_job(job).await?;
        self.store.insert_work_items(items).await?;
        tracing::info!(job_id = %job.id, items = items.len(), "job reset");
        Ok(())
    }

    pub async fn read_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.store
            .job(job_id)
            .await?
            .ok_or_else(|| StoreError::not_found("job", job_id))
    }

    pub async fn transition_job(&self, job_id: &str, to: JobStatus) -> Result<JobWrite, StoreError> {
        let job = self.read_job(job_id).await?;
        if job.status == to {
            return Ok(JobWrite::Unchanged);
        }
        if !job.status.can_transition_to(to) {
            tracing::debug!(job_id, from = %job.status, %to, "job transition ignored");
            return Ok(JobWrite::Ignored {
                current: job.status,
            });
        }
        if !self.store.swap_job_status(job_id, job.status, to).await? {
            let current = self.read_job(job_id).await?.status;
            tracing::debug!(job_id, from = %job.status, %current, %to, "job moved underneath a transition");
            return Ok(JobWrite::Ignored { current });
        }
        tracing::info!(job_id, from = %job.status, %to, "job status");
        Ok(JobWrite::Applied)
    }

    pub async fn record_item(&self, item: &WorkItem) {
        if let Err(e) = self.store.update_work_item(item).await {
            self.note_failure("update_work_item", &item.id, &e);
        }
    }

    pub async fn record_model_switch(&self, job_id: &str, active: &str, fallback: &str) {
        match self.store.update_job_models(job_id, active, fallback).await {
            Ok(()) => tracing::info!(job_id, active, fallback, "active model switched"),
            Err(e) => self.note_failure("update_job_models", job_id, &e),
        }
    }

    /// Replaces a lesson's results with `results`, deduplicated and cut to
    /// the fan-out limit. Returns how many were stored.
    pub async fn replace_item_results(&self, item: &WorkItem, results: Vec<Deliverable>) -> usize {
        let mut seen = HashSet::new();
        let kept: Vec<Deliverable> = results
            .into_iter()
            .filter(|r| seen.insert(r.content.dedup_key()))
            .take(self.fan_out_limit)
            .collect();

        if let Err(e) = self.store.delete_item_results(&item.job_id, &item.id).await {
            self.note_failure("delete_item_results", &item.id, &e);
            return 0;
        }
        if let Err(e) = self.store.insert_results(&kept).await {
            self.note_failure("insert_results", &item.id, &e);
            return 0;
        }
        kept.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::{DeliverableContent, LessonPlan, PipelineKind, Provenance};
    use crate::store::MemoryStore;

    fn job() -> Job {
        Job::new(
            "job-1".into(),
            "course-1".into(),
            PipelineKind::Sources,
            "pro".into(),
            "flash".into(),
            None,
        )
    }

    fn item(id: &str) -> WorkItem {
        let lesson = LessonPlan {
            id: id.into(),
            title: id.into(),
            deliverables: Vec::new(),
        };
        WorkItem::new("job-1", "m1", &lesson, 3)
    }

    fn source(item: &str, url: &str) -> Deliverable {
        Deliverable::new(
            "job-1",
            item,
            DeliverableContent::Source {
                url: url.into(),
                title: "t".into(),
            },
            Provenance::Primary,
            String::new(),
        )
    }

    async fn gateway(limit: usize) -> (Arc<MemoryStore>, Gateway) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::new(store.clone(), limit);
        gateway.reset_job(&job(), &[item("l1"), item("l2")]).await.unwrap();
        (store, gateway)
    }

    #[tokio::test]
    async fn replace_dedups_and_caps() {
        let (store, gateway) = gateway(2).await;
        let stored = gateway
            .replace_item_results(
                &item("l1"),
                vec![
                    source("l1", "https://a.org/x"),
                    source("l1", "https://A.org/x/"),
                    source("l1", "https://b.org"),
                    source("l1", "https://c.org"),
                ],
            )
            .await;
        assert_eq!(stored, 2);
        assert_eq!(store.results("job-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replace_is_idempotent_per_item() {
        let (store, gateway) = gateway(5).await;
        gateway
            .replace_item_results(&item("l2"), vec![source("l2", "https://z.org")])
            .await;
        for _ in 0..3 {
            gateway
                .replace_item_results(&item("l1"), vec![source("l1", "https://a.org")])
                .await;
        }
        let results = store.results("job-1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.work_item_id == "l1").count(), 1);
    }

    #[tokio::test]
    async fn reset_clears_results_and_items() {
        let (store, gateway) = gateway(5).await;
        gateway
            .replace_item_results(&item("l1"), vec![source("l1", "https://a.org")])
            .await;

        gateway.reset_job(&job(), &[item("l3")]).await.unwrap();
        assert!(store.results("job-1").await.unwrap().is_empty());
        let items = store.work_items("job-1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "l3");
    }

    #[tokio::test]
    async fn illegal_transition_is_ignored() {
        let (store, gateway) = gateway(5).await;
        store.update_job_status("job-1", JobStatus::Stopped).await.unwrap();

        let write = gateway
            .transition_job("job-1", JobStatus::Validating)
            .await
            .unwrap();
        assert_eq!(
            write,
            JobWrite::Ignored {
                current: JobStatus::Stopped
            }
        );
        assert_eq!(gateway.read_job("job-1").await.unwrap().status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn transition_applies_once_then_reports_unchanged() {
        let (_, gateway) = gateway(5).await;
        assert_eq!(
            gateway.transition_job("job-1", JobStatus::Generating).await.unwrap(),
            JobWrite::Applied
        );
        let again = gateway.transition_job("job-1", JobStatus::Generating).await.unwrap();
        assert_eq!(again, JobWrite::Unchanged);
        assert!(again.holds());
    }

    #[tokio::test]
    async fn concurrent_claims_apply_exactly_once() {
        let (_, gateway) = gateway(5).await;
        let (a, b) = tokio::join!(
            gateway.transition_job("job-1", JobStatus::Generating),
            gateway.transition_job("job-1", JobStatus::Generating),
        );
        let writes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            writes.iter().filter(|w| **w == JobWrite::Applied).count(),
            1
        );
    }

    #[tokio::test]
    async fn stale_read_loses_the_swap() {
        let (store, gateway) = gateway(5).await;
        store.update_job_status("job-1", JobStatus::Generating).await.unwrap();

        // A writer that still believes the job is a draft.
        assert!(
            !store
                .swap_job_status("job-1", JobStatus::Draft, JobStatus::Generating)
                .await
                .unwrap()
        );
        assert_eq!(
            gateway.read_job("job-1").await.unwrap().status,
            JobStatus::Generating
        );
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let gateway = Gateway::new(Arc::new(MemoryStore::new()), 5);
        let err = gateway.read_job("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let gateway = Gateway::new(Arc::new(MemoryStore::new()), 5);
        gateway.record_item(&item("ghost")).await;
        assert_eq!(gateway.failures(), 1);
    }
}
