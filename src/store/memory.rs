use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{JobStore, StoreError};
use crate::course::{CoursePlan, Deliverable, PipelineKind, Validity};
use crate::state_machine::{Job, JobStatus, WorkItem};

/// Everything the store holds. Serializable so [`super::FileStore`] can
/// persist it; both stores apply their operations through these methods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub plans: HashMap<String, CoursePlan>,
    pub jobs: HashMap<String, Job>,
    pub work_items: Vec<WorkItem>,
    pub results: Vec<Deliverable>,
}

impl StoreState {
    pub fn put_plan(&mut self, plan: &CoursePlan) {
        self.plans.insert(plan.artifact_id.clone(), plan.clone());
    }

    pub fn plan(&self, artifact_id: &str) -> Option<CoursePlan> {
        self.plans.get(artifact_id).cloned()
    }

    pub fn upsert_job(&mut self, job: &Job) {
        self.jobs.insert(job.id.clone(), job.clone());
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).cloned()
    }

    pub fn latest_job(&self, artifact_id: &str, pipeline: PipelineKind) -> Option<Job> {
        self.jobs
            .values()
            .filter(|j| j.artifact_id == artifact_id && j.pipeline == pipeline)
            .max_by_key(|j| j.created_at)
            .cloned()
    }

    fn job_mut(&mut self, job_id: &str) -> Result<&mut Job, StoreError> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))
    }

    pub fn update_job_status(&mut self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        let job = self.job_mut(job_id)?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    pub fn swap_job_status(
        &mut self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let job = self.job_mut(job_id)?;
        if job.status != from {
            return Ok(false);
        }
        job.status = to;
        job.updated_at = Utc::now();
        Ok(true)
    }

    pub fn update_job_models(
        &mut self,
        job_id: &str,
        active_model: &str,
        fallback_model: &str,
    ) -> Result<(), StoreError> {
        let job = self.job_mut(job_id)?;
        job.active_model = active_model.to_string();
        job.fallback_model = fallback_model.to_string();
        job.updated_at = Utc::now();
        Ok(())
    }

    pub fn insert_work_items(&mut self, items: &[WorkItem]) {
        for item in items {
            match self
                .work_items
                .iter()
                .position(|i| i.job_id == item.job_id && i.id == item.id)
            {
                Some(pos) => self.work_items[pos] = item.clone(),
                None => self.work_items.push(item.clone()),
            }
        }
    }

    pub fn work_items(&self, job_id: &str) -> Vec<WorkItem> {
        self.work_items
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn update_work_item(&mut self, item: &WorkItem) -> Result<(), StoreError> {
        let existing = self
            .work_items
            .iter_mut()
            .find(|i| i.job_id == item.job_id && i.id == item.id)
            .ok_or_else(|| StoreError::not_found("work item", &item.id))?;
        existing.status = item.status;
        existing.iteration = item.iteration;
        existing.dod = item.dod.clone();
        existing.updated_at = Utc::now();
        Ok(())
    }

    pub fn delete_work_items(&mut self, job_id: &str) {
        self.work_items.retain(|i| i.job_id != job_id);
    }

    pub fn insert_results(&mut self, results: &[Deliverable]) {
        for result in results {
            match self.results.iter().position(|r| r.id == result.id) {
                Some(pos) => self.results[pos] = result.clone(),
                None => self.results.push(result.clone()),
            }
        }
    }

    pub fn results(&self, job_id: &str) -> Vec<Deliverable> {
        self.results
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn delete_results(&mut self, job_id: &str) {
        self.results.retain(|r| r.job_id != job_id);
    }

    pub fn delete_item_results(&mut self, job_id: &str, item_id: &str) {
        self.results
            .retain(|r| !(r.job_id == job_id && r.work_item_id == item_id));
    }

    pub fn set_result_validity(
        &mut self,
        result_id: &str,
        validity: Validity,
    ) -> Result<(), StoreError> {
        let result = self
            .results
            .iter_mut()
            .find(|r| r.id == result_id)
            .ok_or_else(|| StoreError::not_found("result", result_id))?;
        result.validity = validity;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put_plan(&self, plan: &CoursePlan) -> Result<(), StoreError> {
        self.state.write().await.put_plan(plan);
        Ok(())
    }

    async fn plan(&self, artifact_id: &str) -> Result<Option<CoursePlan>, StoreError> {
        Ok(self.state.read().await.plan(artifact_id))
    }

    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.state.write().await.upsert_job(job);
        Ok(())
    }

    async fn job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().await.job(job_id))
    }

    async fn latest_job(
        &self,
        artifact_id: &str,
        pipeline: PipelineKind,
    ) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().await.latest_job(artifact_id, pipeline))
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        self.state.write().await.update_job_status(job_id, status)
    }

    async fn swap_job_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        self.state.write().await.swap_job_status(job_id, from, to)
    }

    async fn update_job_models(
        &self,
        job_id: &str,
        active_model: &str,
        fallback_model: &str,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .update_job_models(job_id, active_model, fallback_model)
    }

    async fn insert_work_items(&self, items: &[WorkItem]) -> Result<(), StoreError> {
        self.state.write().await.insert_work_items(items);
        Ok(())
    }

    async fn work_items(&self, job_id: &str) -> Result<Vec<WorkItem>, StoreError> {
        Ok(self.state.read().await.work_items(job_id))
    }

    async fn update_work_item(&self, item: &WorkItem) -> Result<(), StoreError> {
        self.state.write().await.update_work_item(item)
    }

    async fn delete_work_items(&self, job_id: &str) -> Result<(), StoreError> {
        self.state.write().await.delete_work_items(job_id);
        Ok(())
    }

    async fn insert_results(&self, results: &[Deliverable]) -> Result<(), StoreError> {
        self.state.write().await.insert_results(results);
        Ok(())
    }

    async fn results(&self, job_id: &str) -> Result<Vec<Deliverable>, StoreError> {
        Ok(self.state.read().await.results(job_id))
    }

    async fn delete_results(&self, job_id: &str) -> Result<(), StoreError> {
        self.state.write().await.delete_results(job_id);
        Ok(())
    }

    async fn delete_item_results(&self, job_id: &str, item_id: &str) -> Result<(), StoreError> {
        self.state.write().await.delete_item_results(job_id, item_id);
        Ok(())
    }

    async fn set_result_validity(
        &self,
        result_id: &str,
        validity: Validity,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .set_result_validity(result_id, validity)
    }
}
