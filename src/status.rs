//! Read-only view of job state for polling clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, RouteError};
use crate::scheduler::job::{FailureReason, Job, JobId, JobStatus};
use crate::scheduler::store::JobStore;
use crate::worker::planner::Route;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorView {
    /// `ComputationFailure`, `WorkerTimeout` or `WorkerError`.
    pub category: &'static str,
    pub reason: FailureReason,
    pub message: String,
}

/// What a client sees of a job. At most one of `result` and `error` is set,
/// and only once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub mesh_id: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        let terminal = job.is_terminal();
        Self {
            job_id: job.id,
            status: job.status,
            mesh_id: job.mesh_id,
            attempts: job.attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            start_name: job.request.start_name,
            end_name: job.request.end_name,
            result: job.result.filter(|_| terminal),
            error: job.error.filter(|_| terminal).map(|e| ErrorView {
                category: e.reason.category(),
                reason: e.reason,
                message: e.message,
            }),
        }
    }
}

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, id: &JobId) -> Result<JobStatusView> {
        self.store
            .get(id)
            .await?
            .map(JobStatusView::from)
            .ok_or_else(|| RouteError::JobNotFound(id.to_string()))
    }

    /// Jobs created at or after `since`, newest first.
    pub async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<JobStatusView>> {
        let mut jobs = self.store.list_recent(since).await?;
        jobs.reverse();
        Ok(jobs.into_iter().map(JobStatusView::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::scheduler::job::{JobError, Transition};
    use crate::scheduler::request::RouteRequest;
    use crate::scheduler::store::MemoryJobStore;
    use chrono::TimeDelta;

    fn job() -> Job {
        Job::new(
            RouteRequest::new(Coordinate::new(-60.7, -45.5), Coordinate::new(-54.2, -36.4))
                .with_names("Signy", "King Edward Point"),
            "southern",
        )
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let status = StatusService::new(Arc::new(MemoryJobStore::new()));
        let err = status.get_status(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, RouteError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn failed_job_exposes_error_category() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create(job()).await.unwrap();
        let error = JobError::new(FailureReason::Timeout, "too slow");
        store.update_status(&job.id, 0, Transition::Fail { error }).await.unwrap();

        let view = StatusService::new(store).get_status(&job.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.result.is_none());
        let error = view.error.unwrap();
        assert_eq!(error.category, "WorkerTimeout");
        assert_eq!(view.start_name.as_deref(), Some("Signy"));
    }

    #[tokio::test]
    async fn view_serializes_camel_case() {
        let view = JobStatusView::from(job());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("jobId").is_some());
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let store = Arc::new(MemoryJobStore::new());
        let first = store.create(job()).await.unwrap();
        let mut later = job();
        later.created_at = first.created_at + TimeDelta::seconds(1);
        let later = store.create(later).await.unwrap();

        let views = StatusService::new(store)
            .recent(first.created_at - TimeDelta::seconds(1))
            .await
            .unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].job_id, later.id);
    }
}
