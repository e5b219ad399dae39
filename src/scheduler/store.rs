//! Durable record of job state.
//!
//! [`JobStore`] is the single source of truth for status queries. Every
//! status change goes through [`JobStore::update_status`], which applies a
//! [`Transition`] only when the job is still at the version the caller read.
//! A late report from a worker that lost its lease therefore cannot
//! overwrite a job another attempt already finished.
//!
//! Two implementations are provided:
//! - [`MemoryJobStore`]: process-local, used by tests and single-node setups
//! - [`FileJobStore`]: the same table persisted as JSON after every mutation

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Result, RouteError};
use crate::scheduler::job::{Job, JobId, Transition, TransitionOutcome};
use crate::scheduler::request::Fingerprint;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails if the id already exists or the store is full.
    async fn create(&self, job: Job) -> Result<Job>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Conditionally apply `transition`. Unknown ids are an error; version
    /// or state mismatches are reported as [`TransitionOutcome::Rejected`].
    async fn update_status(
        &self,
        id: &JobId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<TransitionOutcome>;

    /// Jobs sharing a fingerprint, oldest first.
    async fn list_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Vec<Job>>;

    /// Jobs computed (or to be computed) against a mesh, oldest first.
    async fn list_by_mesh(&self, mesh_id: &str) -> Result<Vec<Job>>;

    /// Jobs created at or after `since`, oldest first.
    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Jobs still PENDING or RUNNING, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<Job>>;

    /// Remove terminal jobs completed before `before`. Returns the number removed.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Indexed job table shared by the store implementations.
#[derive(Debug, Clone)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    by_fingerprint: HashMap<Fingerprint, Vec<JobId>>,
    max_jobs: usize,
}

impl JobTable {
    fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            by_fingerprint: HashMap::new(),
            max_jobs,
        }
    }

    fn from_jobs(jobs: Vec<Job>, max_jobs: usize) -> Self {
        let mut table = Self::with_capacity(max_jobs);
        for job in jobs {
            table.index(&job);
            table.jobs.insert(job.id, job);
        }
        table
    }

    fn index(&mut self, job: &Job) {
        self.by_fingerprint
            .entry(job.fingerprint.clone())
            .or_default()
            .push(job.id);
    }

    fn insert(&mut self, job: Job) -> Result<Job> {
        if self.jobs.contains_key(&job.id) {
            return Err(RouteError::Internal(format!("job {} already exists", job.id)));
        }
        if self.jobs.len() >= self.max_jobs {
            return Err(RouteError::StorageFailure("job store is at capacity".to_string()));
        }
        self.index(&job);
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn update(&mut self, id: &JobId, expected_version: u64, transition: Transition) -> Result<TransitionOutcome> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RouteError::JobNotFound(id.to_string()))?;

        let target = transition.target();
        if job.apply(expected_version, transition, Utc::now()) {
            tracing::debug!(job_id = %id, status = %target, version = job.version, "Job transition applied");
            Ok(TransitionOutcome::Applied(job.clone()))
        } else {
            tracing::debug!(
                job_id = %id,
                current = %job.status,
                requested = %target,
                expected_version,
                actual_version = job.version,
                "Job transition rejected"
            );
            Ok(TransitionOutcome::Rejected {
                current: job.clone(),
            })
        }
    }

    fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    fn by_fingerprint(&self, fingerprint: &Fingerprint) -> Vec<Job> {
        let jobs = self
            .by_fingerprint
            .get(fingerprint)
            .map(|ids| ids.iter().filter_map(|id| self.jobs.get(id)).cloned().collect())
            .unwrap_or_default();
        Self::sorted(jobs)
    }

    fn by_mesh(&self, mesh_id: &str) -> Vec<Job> {
        Self::sorted(
            self.jobs
                .values()
                .filter(|j| j.mesh_id == mesh_id)
                .cloned()
                .collect(),
        )
    }

    fn since(&self, since: DateTime<Utc>) -> Vec<Job> {
        Self::sorted(
            self.jobs
                .values()
                .filter(|j| j.created_at >= since)
                .cloned()
                .collect(),
        )
    }

    fn unfinished(&self) -> Vec<Job> {
        Self::sorted(self.jobs.values().filter(|j| !j.is_terminal()).cloned().collect())
    }

    fn purge(&mut self, before: DateTime<Utc>) -> usize {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.completed_at.is_some_and(|t| t < before))
            .map(|j| j.id)
            .collect();

        for id in &expired {
            if let Some(job) = self.jobs.remove(id) {
                if let Some(ids) = self.by_fingerprint.get_mut(&job.fingerprint) {
                    ids.retain(|other| other != id);
                    if ids.is_empty() {
                        self.by_fingerprint.remove(&job.fingerprint);
                    }
                }
            }
        }
        expired.len()
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// In-process job store.
#[derive(Debug)]
pub struct MemoryJobStore {
    table: RwLock<JobTable>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    /// An unbounded store.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            table: RwLock::new(JobTable::with_capacity(max_jobs)),
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job> {
        self.table.write().await.insert(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.table.read().await.jobs.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &JobId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<TransitionOutcome> {
        self.table.write().await.update(id, expected_version, transition)
    }

    async fn list_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Vec<Job>> {
        Ok(self.table.read().await.by_fingerprint(fingerprint))
    }

    async fn list_by_mesh(&self, mesh_id: &str) -> Result<Vec<Job>> {
        Ok(self.table.read().await.by_mesh(mesh_id))
    }

    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self.table.read().await.since(since))
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        Ok(self.table.read().await.unfinished())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.table.write().await.purge(before))
    }
}

/// Job store persisted to a JSON file.
///
/// The whole table is rewritten after every mutation (temp file + rename),
/// so a crash leaves either the previous or the new snapshot on disk.
/// A mutation is only reported as successful once the snapshot is written.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    table: Mutex<JobTable>,
}

impl FileJobStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacity(path, usize::MAX).await
    }

    pub async fn open_with_capacity(path: impl AsRef<Path>, max_jobs: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let jobs: Vec<Job> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(path = %path.display(), jobs = jobs.len(), "Opened job store");

        Ok(Self {
            path,
            table: Mutex::new(JobTable::from_jobs(jobs, max_jobs)),
        })
    }

    async fn persist(&self, table: &JobTable) -> Result<()> {
        let jobs: Vec<&Job> = table.jobs.values().collect();
        let bytes = serde_json::to_vec(&jobs)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: Job) -> Result<Job> {
        let mut table = self.table.lock().await;
        let id = job.id;
        let created = table.insert(job)?;
        if let Err(e) = self.persist(&table).await {
            // Keep memory consistent with disk.
            table.jobs.remove(&id);
            if let Some(ids) = table.by_fingerprint.get_mut(&created.fingerprint) {
                ids.retain(|other| *other != id);
            }
            return Err(e);
        }
        Ok(created)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.table.lock().await.jobs.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &JobId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<TransitionOutcome> {
        let mut table = self.table.lock().await;
        let previous = table.jobs.get(id).cloned();
        let outcome = table.update(id, expected_version, transition)?;
        if outcome.is_applied() {
            if let Err(e) = self.persist(&table).await {
                if let Some(previous) = previous {
                    table.jobs.insert(*id, previous);
                }
                return Err(e);
            }
        }
        Ok(outcome)
    }

    async fn list_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Vec<Job>> {
        Ok(self.table.lock().await.by_fingerprint(fingerprint))
    }

    async fn list_by_mesh(&self, mesh_id: &str) -> Result<Vec<Job>> {
        Ok(self.table.lock().await.by_mesh(mesh_id))
    }

    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self.table.lock().await.since(since))
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        Ok(self.table.lock().await.unfinished())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut table = self.table.lock().await;
        let mut purged = table.clone();
        let removed = purged.purge(before);
        if removed > 0 {
            self.persist(&purged).await?;
            *table = purged;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::scheduler::job::{FailureReason, JobError, JobStatus};
    use crate::scheduler::request::RouteRequest;
    use chrono::TimeDelta;

    fn job() -> Job {
        Job::new(
            RouteRequest::new(Coordinate::new(-75.059, -25.84), Coordinate::new(-67.764, -68.02)),
            "weddell",
        )
    }

    fn start() -> Transition {
        Transition::Start {
            worker: "w".to_string(),
            lease_expires_at: Utc::now() + TimeDelta::seconds(60),
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = MemoryJobStore::new();
        let job = store.create(job()).await.unwrap();
        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Pending);
        assert!(store.get(&JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let store = MemoryJobStore::new();
        let job = store.create(job()).await.unwrap();
        assert!(store.create(job).await.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let store = MemoryJobStore::with_capacity(1);
        store.create(job()).await.unwrap();
        let err = store.create(job()).await.unwrap_err();
        assert!(matches!(err, RouteError::StorageFailure(_)));
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store.update_status(&JobId::new(), 0, start()).await.unwrap_err();
        assert!(matches!(err, RouteError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn conditional_update() {
        let store = MemoryJobStore::new();
        let job = store.create(job()).await.unwrap();

        let outcome = store.update_status(&job.id, 0, start()).await.unwrap();
        assert!(outcome.is_applied());

        // Second claim at the stale version is rejected.
        let outcome = store.update_status(&job.id, 0, start()).await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(outcome.job().attempts, 1);
    }

    #[tokio::test]
    async fn list_by_fingerprint_and_mesh() {
        let store = MemoryJobStore::new();
        let a = store.create(job()).await.unwrap();
        let b = store.create(job()).await.unwrap();
        let other = store
            .create(Job::new(
                RouteRequest::new(Coordinate::new(78.9, 11.9), Coordinate::new(80.0, 20.0)),
                "arctic",
            ))
            .await
            .unwrap();

        let same = store.list_by_fingerprint(&a.fingerprint).await.unwrap();
        assert_eq!(same.len(), 2);
        assert!(same.iter().any(|j| j.id == b.id));

        assert_eq!(store.list_by_mesh("arctic").await.unwrap()[0].id, other.id);
        assert_eq!(store.list_by_mesh("weddell").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let done = store.create(job()).await.unwrap();
        let pending = store.create(job()).await.unwrap();

        store.update_status(&done.id, 0, start()).await.unwrap();
        store
            .update_status(
                &done.id,
                1,
                Transition::Fail {
                    error: JobError::new(FailureReason::NoFeasibleRoute, "ice"),
                },
            )
            .await
            .unwrap();

        assert_eq!(store.purge_finished(Utc::now() - TimeDelta::hours(1)).await.unwrap(), 0);
        assert_eq!(store.purge_finished(Utc::now() + TimeDelta::seconds(1)).await.unwrap(), 1);

        assert!(store.get(&done.id).await.unwrap().is_none());
        assert!(store.get(&pending.id).await.unwrap().is_some());
        assert_eq!(store.list_by_fingerprint(&pending.fingerprint).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let id = {
            let store = FileJobStore::open(&path).await.unwrap();
            let job = store.create(job()).await.unwrap();
            store.update_status(&job.id, 0, start()).await.unwrap();
            job.id
        };

        let reopened = FileJobStore::open(&path).await.unwrap();
        let job = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.version, 1);
        assert_eq!(reopened.list_by_fingerprint(&job.fingerprint).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_unfinished_skips_terminal_jobs() {
        let store = MemoryJobStore::new();
        let pending = store.create(job()).await.unwrap();
        let running = store.create(job()).await.unwrap();
        let failed = store.create(job()).await.unwrap();

        store.update_status(&running.id, 0, start()).await.unwrap();
        store.update_status(&failed.id, 0, start()).await.unwrap();
        let fail = Transition::Fail {
            error: JobError::new(FailureReason::NoFeasibleRoute, "ice"),
        };
        store.update_status(&failed.id, 1, fail).await.unwrap();

        let ids: Vec<JobId> = store.list_unfinished().await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&pending.id));
        assert!(ids.contains(&running.id));
    }

    #[tokio::test]
    async fn failed_purge_write_keeps_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = FileJobStore::open(&path).await.unwrap();
        let job = store.create(job()).await.unwrap();
        store.update_status(&job.id, 0, start()).await.unwrap();
        let fail = Transition::Fail {
            error: JobError::new(FailureReason::NoFeasibleRoute, "ice"),
        };
        store.update_status(&job.id, 1, fail).await.unwrap();

        // A directory in place of the snapshot makes the rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();

        let cutoff = Utc::now() + TimeDelta::seconds(1);
        assert!(store.purge_finished(cutoff).await.is_err());
        assert!(store.get(&job.id).await.unwrap().is_some());
        assert_eq!(store.list_by_fingerprint(&job.fingerprint).await.unwrap().len(), 1);

        std::fs::remove_dir_all(&path).unwrap();
        assert_eq!(store.purge_finished(cutoff).await.unwrap(), 1);
        assert!(store.get(&job.id).await.unwrap().is_none());
    }
}
