//! Persistence contract consumed by the engine.
//!
//! Every operation is keyed by identifier and idempotent when replayed with
//! the same payload. [`MemoryStore`] backs tests and the server's default
//! mode; [`FileStore`] keeps the same state in a JSON file shared by every
//! process using it, so a crashed or paused run can be resumed and a CLI
//! pause or stop reaches a runner in another process.

mod file;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::course::{CoursePlan, Deliverable, PipelineKind, Validity};
use crate::state_machine::{Job, JobStatus, WorkItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store is locked by another process: {0}")]
    Locked(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put_plan(&self, plan: &CoursePlan) -> Result<(), StoreError>;
    async fn plan(&self, artifact_id: &str) -> Result<Option<CoursePlan>, StoreError>;

    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;
    /// Most recently created job for a course and pipeline.
    async fn latest_job(
        &self,
        artifact_id: &str,
        pipeline: PipelineKind,
    ) -> Result<Option<Job>, StoreError>;
    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError>;
    /// Writes `to` only while the stored status is still `from`, as one
    /// atomic step. Returns whether the write happened.
    async fn swap_job_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError>;
    async fn update_job_models(
        &self,
        job_id: &str,
        active_model: &str,
        fallback_model: &str,
    ) -> Result<(), StoreError>;

    /// Upsert by `(job_id, id)`; order of first insertion is preserved.
    async fn insert_work_items(&self, items: &[WorkItem]) -> Result<(), StoreError>;
    async fn work_items(&self, job_id: &str) -> Result<Vec<WorkItem>, StoreError>;
    /// Overwrites status, iteration and DoD.
    async fn update_work_item(&self, item: &WorkItem) -> Result<(), StoreError>;
    async fn delete_work_items(&self, job_id: &str) -> Result<(), StoreError>;

    async fn insert_results(&self, results: &[Deliverable]) -> Result<(), StoreError>;
    async fn results(&self, job_id: &str) -> Result<Vec<Deliverable>, StoreError>;
    async fn delete_results(&self, job_id: &str) -> Result<(), StoreError>;
    async fn delete_item_results(&self, job_id: &str, item_id: &str) -> Result<(), StoreError>;
    async fn set_result_validity(
        &self,
        result_id: &str,
        validity: Validity,
    ) -> Result<(), StoreError>;
}
