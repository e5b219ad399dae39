//! Intake of route requests.
//!
//! [`Dispatcher::submit`] turns a request into a job id. Identical requests
//! collapse onto one job: a job still in progress is always shared, and a
//! finished one is reused within the reuse window unless the caller forces a
//! recalculation. Requests no mesh can serve are rejected before a job is
//! created, so they never occupy a worker.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::DedupeConfig;
use crate::error::{Result, RouteError};
use crate::mesh::{MeshError, MeshRegistry};
use crate::scheduler::job::{FailureReason, Job, JobError, JobId, JobStatus, Transition};
use crate::scheduler::queue::{WorkItem, WorkQueue};
use crate::scheduler::request::RouteRequest;
use crate::scheduler::store::JobStore;

/// How a submission was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new job was created and queued.
    Created,
    /// An identical request is already pending or running.
    InFlight,
    /// A finished route for an identical request was reused.
    Reused,
    /// A finished route with start and end within tolerance was reused.
    Nearby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    pub disposition: Disposition,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    registry: MeshRegistry,
    config: DedupeConfig,
    /// Serializes the check-then-create so two identical requests cannot
    /// both miss the lookup.
    intake: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        registry: MeshRegistry,
        config: DedupeConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            config,
            intake: Mutex::new(()),
        }
    }

    pub async fn submit(&self, request: RouteRequest) -> Result<JobId> {
        self.submit_with_disposition(request).await.map(|s| s.job_id)
    }

    pub async fn submit_with_disposition(&self, request: RouteRequest) -> Result<Submission> {
        request.validate()?;

        let now = Utc::now();
        let at = request.effective_time(now);
        let mesh = self
            .registry
            .select(&request.start, &request.end, at, &request.hints)
            .await
            .map_err(|e| match e {
                MeshError::NotFound(msg) => RouteError::InvalidRequest(msg),
                other => RouteError::from(other),
            })?;

        let fingerprint = request.fingerprint();
        let _guard = self.intake.lock().await;

        let existing = self.store.list_by_fingerprint(&fingerprint).await?;
        if let Some(job) = existing.iter().find(|j| !j.is_terminal()) {
            tracing::info!(job_id = %job.id, fingerprint = %fingerprint, "Joining in-flight job");
            return Ok(Submission {
                job_id: job.id,
                disposition: Disposition::InFlight,
            });
        }

        if !request.force_recalculate {
            let cutoff = now - self.reuse_window();
            let reusable = existing
                .iter()
                .filter(|j| j.status == JobStatus::Done && j.mesh_id == mesh.id)
                .filter(|j| j.completed_at.is_some_and(|t| t >= cutoff))
                .max_by_key(|j| j.completed_at);
            if let Some(job) = reusable {
                tracing::info!(job_id = %job.id, fingerprint = %fingerprint, "Reusing completed route");
                return Ok(Submission {
                    job_id: job.id,
                    disposition: Disposition::Reused,
                });
            }

            if let Some(job) = self.find_nearby(&request, &mesh.id, cutoff).await? {
                tracing::info!(job_id = %job.id, mesh_id = %mesh.id, "Reusing route within waypoint tolerance");
                return Ok(Submission {
                    job_id: job.id,
                    disposition: Disposition::Nearby,
                });
            }
        }

        let job = self.store.create(Job::new(request, mesh.id.clone())).await?;
        if let Err(e) = self.queue.enqueue(WorkItem::new(job.id)).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue job");
            let error = JobError::new(FailureReason::WorkerError, format!("could not enqueue: {e}"));
            if let Err(mark) = self.store.update_status(&job.id, job.version, Transition::Fail { error }).await {
                tracing::error!(job_id = %job.id, error = %mark, "Failed to mark unqueued job as failed");
            }
            return Err(e);
        }

        tracing::info!(
            job_id = %job.id,
            fingerprint = %fingerprint,
            mesh_id = %job.mesh_id,
            "Job created"
        );
        Ok(Submission {
            job_id: job.id,
            disposition: Disposition::Created,
        })
    }

    /// Closest finished route on `mesh_id` whose start and end both lie
    /// within the configured tolerance of the request's.
    async fn find_nearby(
        &self,
        request: &RouteRequest,
        mesh_id: &str,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let tolerance = self.config.waypoint_tolerance_nm;
        if tolerance <= 0.0 {
            return Ok(None);
        }

        let candidates = self.store.list_by_mesh(mesh_id).await?;
        let best = candidates
            .into_iter()
            .filter(|j| j.status == JobStatus::Done)
            .filter(|j| j.completed_at.is_some_and(|t| t >= cutoff))
            .filter_map(|j| {
                let d_start = j.request.start.distance_nm(&request.start);
                let d_end = j.request.end.distance_nm(&request.end);
                (d_start <= tolerance && d_end <= tolerance).then_some((d_start + d_end, j))
            })
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, j)| j);
        Ok(best)
    }

    fn reuse_window(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.reuse_window).unwrap_or(TimeDelta::days(365))
    }
}
