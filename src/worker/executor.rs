use std::sync::Arc;
use std::time::Duration;

use crate::mesh::MeshLease;
use crate::scheduler::job::{FailureReason, JobError, JobId};
use crate::scheduler::request::RouteRequest;
use crate::worker::planner::{ComputeError, Route, RouteComputer};

/// Result of one computation attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed(Route),
    /// Deterministic failure; retrying will not help.
    Failed(JobError),
    /// Timeout or worker fault; eligible for retry.
    Transient(JobError),
}

/// Runs a [`RouteComputer`] on the blocking pool under a time limit.
///
/// A computation that overruns is abandoned, not interrupted: the blocking
/// thread finishes in the background and its result is dropped.
#[derive(Clone)]
pub struct RouteExecutor {
    computer: Arc<dyn RouteComputer>,
    timeout: Duration,
}

impl std::fmt::Debug for RouteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteExecutor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RouteExecutor {
    pub fn new(computer: Arc<dyn RouteComputer>, timeout: Duration) -> Self {
        Self { computer, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Compute the route for `request` against the leased mesh.
    pub async fn execute(&self, job_id: JobId, mesh: &MeshLease, request: &RouteRequest) -> ExecutionOutcome {
        tracing::info!(job_id = %job_id, mesh_id = %mesh.id(), "Computing route");

        let computer = self.computer.clone();
        let data = mesh.shared();
        let request = request.clone();
        let task = tokio::task::spawn_blocking(move || computer.compute(&data, &request));

        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(route))) => Self::check_route(route),
            Ok(Ok(Err(ComputeError::NoFeasibleRoute(msg)))) => {
                ExecutionOutcome::Failed(JobError::new(FailureReason::NoFeasibleRoute, msg))
            }
            Ok(Ok(Err(ComputeError::MalformedMesh(msg)))) => {
                ExecutionOutcome::Failed(JobError::new(FailureReason::MalformedMesh, msg))
            }
            Ok(Err(join_err)) => ExecutionOutcome::Transient(JobError::new(
                FailureReason::WorkerError,
                format!("route computation crashed: {join_err}"),
            )),
            Err(_) => ExecutionOutcome::Transient(JobError::new(
                FailureReason::Timeout,
                format!("route computation exceeded {:?}", self.timeout),
            )),
        };

        match &outcome {
            ExecutionOutcome::Completed(route) => tracing::info!(
                job_id = %job_id,
                waypoints = route.waypoints.len(),
                distance_nm = route.distance_nm,
                "Route computed"
            ),
            ExecutionOutcome::Failed(e) | ExecutionOutcome::Transient(e) => {
                tracing::warn!(job_id = %job_id, reason = %e.reason, error = %e.message, "Route computation failed")
            }
        }
        outcome
    }

    fn check_route(route: Route) -> ExecutionOutcome {
        if route.waypoints.len() < 2 {
            return ExecutionOutcome::Failed(JobError::new(
                FailureReason::NoFeasibleRoute,
                format!("planner returned {} waypoints", route.waypoints.len()),
            ));
        }
        ExecutionOutcome::Completed(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{BoundingBox, Coordinate};
    use crate::mesh::{CacheLimits, MeshCatalog, MeshData, MeshError, MeshLoader, MeshMetadata, MeshRegistry};
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use std::path::PathBuf;

    struct StaticLoader;

    #[async_trait]
    impl MeshLoader for StaticLoader {
        async fn load(&self, metadata: &MeshMetadata) -> Result<MeshData, MeshError> {
            Ok(MeshData {
                metadata: metadata.clone(),
                content: serde_json::json!({}),
                size_bytes: 2,
            })
        }
    }

    async fn lease() -> MeshLease {
        let catalog = MeshCatalog::new(vec![MeshMetadata {
            id: "arctic".to_string(),
            file: PathBuf::from("arctic.json"),
            created: Utc::now(),
            valid_from: Utc::now() - TimeDelta::days(1),
            valid_until: Utc::now() + TimeDelta::days(1),
            bounds: BoundingBox::new(60.0, 90.0, -180.0, 180.0),
            sha256: None,
        }]);
        let registry = MeshRegistry::new(
            Arc::new(catalog),
            Arc::new(StaticLoader),
            CacheLimits {
                max_entries: 2,
                max_bytes: 1024,
            },
        );
        registry.acquire("arctic").await.unwrap()
    }

    fn request() -> RouteRequest {
        RouteRequest::new(Coordinate::new(70.0, 20.0), Coordinate::new(78.2, 15.6))
    }

    fn executor<F>(f: F, timeout: Duration) -> RouteExecutor
    where
        F: Fn(&MeshData, &RouteRequest) -> Result<Route, ComputeError> + Send + Sync + 'static,
    {
        RouteExecutor::new(Arc::new(f), timeout)
    }

    #[tokio::test]
    async fn completes_route() {
        let exec = executor(
            |mesh: &MeshData, req: &RouteRequest| {
                Ok(Route::from_waypoints(mesh.id(), vec![req.start, req.end], 12.0, 20.0))
            },
            Duration::from_secs(5),
        );
        let outcome = exec.execute(JobId::new(), &lease().await, &request()).await;
        assert!(matches!(outcome, ExecutionOutcome::Completed(r) if r.mesh_id == "arctic"));
    }

    #[tokio::test]
    async fn infeasible_route_is_deterministic_failure() {
        let exec = executor(
            |_: &MeshData, _: &RouteRequest| Err(ComputeError::NoFeasibleRoute("sea ice".into())),
            Duration::from_secs(5),
        );
        match exec.execute(JobId::new(), &lease().await, &request()).await {
            ExecutionOutcome::Failed(e) => assert_eq!(e.reason, FailureReason::NoFeasibleRoute),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overrun_is_transient_timeout() {
        let exec = executor(
            |mesh: &MeshData, req: &RouteRequest| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Route::from_waypoints(mesh.id(), vec![req.start, req.end], 12.0, 0.0))
            },
            Duration::from_millis(20),
        );
        match exec.execute(JobId::new(), &lease().await, &request()).await {
            ExecutionOutcome::Transient(e) => assert_eq!(e.reason, FailureReason::Timeout),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_is_transient_worker_error() {
        let exec = executor(
            |_: &MeshData, _: &RouteRequest| -> Result<Route, ComputeError> { panic!("planner bug") },
            Duration::from_secs(5),
        );
        match exec.execute(JobId::new(), &lease().await, &request()).await {
            ExecutionOutcome::Transient(e) => assert_eq!(e.reason, FailureReason::WorkerError),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_point_route_is_rejected() {
        let exec = executor(
            |mesh: &MeshData, req: &RouteRequest| Ok(Route::from_waypoints(mesh.id(), vec![req.start], 12.0, 0.0)),
            Duration::from_secs(5),
        );
        assert!(matches!(
            exec.execute(JobId::new(), &lease().await, &request()).await,
            ExecutionOutcome::Failed(_)
        ));
    }
}
