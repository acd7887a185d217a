use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::memory::StoreState;
use super::{JobStore, StoreError};
use crate::course::{CoursePlan, Deliverable, PipelineKind, Validity};
use crate::state_machine::{Job, JobStatus, WorkItem};

const LOCK_RETRY: Duration = Duration::from_millis(20);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// A lock file older than this is left over from a crashed process.
const LOCK_STALE: Duration = Duration::from_secs(30);

/// JSON-file store shared by every process pointed at the same path.
///
/// The file is the only copy of the state: reads load it, writes reload it,
/// apply the change and write it back while holding `<path>.lock`. A pause or
/// stop issued from another process is therefore seen at the next read and
/// never overwritten by a runner. Writes go to a sibling temp file renamed
/// over the target, so readers never observe a half-written file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

/// Held while a process rewrites the file. Removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        let started = SystemTime::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path).await {
                        tracing::warn!(path = %path.display(), "removing stale store lock");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    if started.elapsed().unwrap_or_default() >= LOCK_TIMEOUT {
                        return Err(StoreError::Locked(path.display().to_string()));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn is_stale(path: &Path) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified.elapsed().unwrap_or_default() > LOCK_STALE,
        Err(_) => false,
    }
}

impl FileStore {
    /// Opens the store at `path`. A missing or empty file is an empty store;
    /// an unreadable one is an error.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        };
        store.load().await?;
        Ok(store)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    async fn load(&self) -> Result<StoreState, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if !contents.trim().is_empty() => Ok(serde_json::from_str(&contents)?),
            Ok(_) => Ok(StoreState::default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn view<T>(&self, read: impl FnOnce(&StoreState) -> T) -> Result<T, StoreError> {
        Ok(read(&self.load().await?))
    }

    async fn update<T>(
        &self,
        change: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _local = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _file = LockFile::acquire(self.sibling(".lock")).await?;

        let mut state = self.load().await?;
        let out = change(&mut state)?;

        let json = serde_json::to_vec_pretty(&state)?;
        let tmp = self.sibling(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(out)
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn put_plan(&self, plan: &CoursePlan) -> Result<(), StoreError> {
        self.update(|s| {
            s.put_plan(plan);
            Ok(())
        })
        .await
    }

    async fn plan(&self, artifact_id: &str) -> Result<Option<CoursePlan>, StoreError> {
        self.view(|s| s.plan(artifact_id)).await
    }

    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.update(|s| {
            s.upsert_job(job);
            Ok(())
        })
        .await
    }

    async fn job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.view(|s| s.job(job_id)).await
    }

    async fn latest_job(
        &self,
        artifact_id: &str,
        pipeline: PipelineKind,
    ) -> Result<Option<Job>, StoreError> {
        self.view(|s| s.latest_job(artifact_id, pipeline)).await
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        self.update(|s| s.update_job_status(job_id, status)).await
    }

    async fn swap_job_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        self.update(|s| s.swap_job_status(job_id, from, to)).await
    }

    async fn update_job_models(
        &self,
        job_id: &str,
        active_model: &str,
        fallback_model: &str,
    ) -> Result<(), StoreError> {
        self.update(|s| s.update_job_models(job_id, active_model, fallback_model))
            .await
    }

    async fn insert_work_items(&self, items: &[WorkItem]) -> Result<(), StoreError> {
        self.update(|s| {
            s.insert_work_items(items);
            Ok(())
        })
        .await
    }

    async fn work_items(&self, job_id: &str) -> Result<Vec<WorkItem>, StoreError> {
        self.view(|s| s.work_items(job_id)).await
    }

    async fn update_work_item(&self, item: &WorkItem) -> Result<(), StoreError> {
        self.update(|s| s.update_work_item(item)).await
    }

    async fn delete_work_items(&self, job_id: &str) -> Result<(), StoreError> {
        self.update(|s| {
            s.delete_work_items(job_id);
            Ok(())
        })
        .await
    }

    async fn insert_results(&self, results: &[Deliverable]) -> Result<(), StoreError> {
        self.update(|s| {
            s.insert_results(results);
            Ok(())
        })
        .await
    }

    async fn results(&self, job_id: &str) -> Result<Vec<Deliverable>, StoreError> {
        self.view(|s| s.results(job_id)).await
    }

    async fn delete_results(&self, job_id: &str) -> Result<(), StoreError> {
        self.update(|s| {
            s.delete_results(job_id);
            Ok(())
        })
        .await
    }

    async fn delete_item_results(&self, job_id: &str, item_id: &str) -> Result<(), StoreError> {
        self.update(|s| {
            s.delete_item_results(job_id, item_id);
            Ok(())
        })
        .await
    }

    async fn set_result_validity(
        &self,
        result_id: &str,
        validity: Validity,
    ) -> Result<(), StoreError> {
        self.update(|s| s.set_result_validity(result_id, validity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "job-1".into(),
            "course-1".into(),
            PipelineKind::Materials,
            "primary".into(),
            "fallback".into(),
            Some("keep it short".into()),
        )
    }

    #[tokio::test]
    async fn open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.json")).await.unwrap();
        assert!(store.job("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.upsert_job(&job()).await.unwrap();
            store
                .update_job_status("job-1", JobStatus::PausedRequested)
                .await
                .unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        let stored = reopened.job("job-1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::PausedRequested);
        assert_eq!(stored.custom_prompt.as_deref(), Some("keep it short"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn stop_from_another_process_reaches_the_runner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let runner = FileStore::open(&path).await.unwrap();
        let operator = FileStore::open(&path).await.unwrap();

        runner.upsert_job(&job()).await.unwrap();
        let lesson = crate::course::LessonPlan {
            id: "l1".into(),
            title: "Lesson 1".into(),
            deliverables: vec!["reading".into()],
        };
        let mut item = WorkItem::new("job-1", "m1", &lesson, 3);
        runner.insert_work_items(&[item.clone()]).await.unwrap();
        runner
            .update_job_status("job-1", JobStatus::Generating)
            .await
            .unwrap();

        operator
            .update_job_status("job-1", JobStatus::StoppedRequested)
            .await
            .unwrap();

        // The runner's next boundary read sees the request.
        let seen = runner.job("job-1").await.unwrap().unwrap();
        assert_eq!(seen.status, JobStatus::StoppedRequested);

        // A runner write afterwards keeps the operator's status.
        item.iteration = 1;
        runner.update_work_item(&item).await.unwrap();
        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.job("job-1").await.unwrap().unwrap().status,
            JobStatus::StoppedRequested
        );
        assert_eq!(reopened.work_items("job-1").await.unwrap()[0].iteration, 1);
    }

    #[tokio::test]
    async fn swap_fails_when_another_store_moved_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let a = FileStore::open(&path).await.unwrap();
        let b = FileStore::open(&path).await.unwrap();
        a.upsert_job(&job()).await.unwrap();

        assert!(
            b.swap_job_status("job-1", JobStatus::Draft, JobStatus::Generating)
                .await
                .unwrap()
        );
        assert!(
            !a.swap_job_status("job-1", JobStatus::Draft, JobStatus::Generating)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_writers_keep_every_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let a = FileStore::open(&path).await.unwrap();
        let b = FileStore::open(&path).await.unwrap();
        a.upsert_job(&job()).await.unwrap();

        let plan = |id: &str| CoursePlan {
            artifact_id: id.into(),
            title: id.into(),
            modules: Vec::new(),
        };
        let (ra, rb) = tokio::join!(
            async {
                for i in 0..5 {
                    a.put_plan(&plan(&format!("a{i}"))).await?;
                }
                Ok::<_, StoreError>(())
            },
            async {
                for i in 0..5 {
                    b.put_plan(&plan(&format!("b{i}"))).await?;
                }
                Ok::<_, StoreError>(())
            }
        );
        ra.unwrap();
        rb.unwrap();

        for id in ["a0", "a4", "b0", "b4"] {
            assert!(a.plan(id).await.unwrap().is_some(), "{id} lost");
        }
        assert!(!path.with_extension("json.lock").exists());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let lock = path.with_extension("json.lock");
        let file = std::fs::File::create(&lock).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        drop(file);

        let store = FileStore::open(&path).await.unwrap();
        store.upsert_job(&job()).await.unwrap();
        assert!(store.job("job-1").await.unwrap().is_some());
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialize(_)));
    }
}
