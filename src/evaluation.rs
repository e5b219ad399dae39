//! Evaluation of caller-supplied routes.
//!
//! Unlike a submission this runs inline: the newest mesh containing every
//! waypoint is pinned and the planner prices the polyline as given.

use chrono::{DateTime, Utc};

use crate::error::{Result, RouteError};
use crate::geo::Coordinate;
use crate::mesh::{MeshError, MeshRegistry};
use crate::worker::planner::{ComputeError, GreatCirclePlanner, Route};

#[derive(Debug, Clone)]
pub struct EvaluationService {
    registry: MeshRegistry,
    planner: GreatCirclePlanner,
}

impl EvaluationService {
    pub fn new(registry: MeshRegistry, planner: GreatCirclePlanner) -> Self {
        Self { registry, planner }
    }

    /// Travel time, distance and fuel along `waypoints`, planned for `at`
    /// (now when unset).
    pub async fn evaluate(&self, waypoints: Vec<Coordinate>, at: Option<DateTime<Utc>>) -> Result<Route> {
        if waypoints.len() < 2 {
            return Err(RouteError::InvalidRequest(
                "a route needs at least two waypoints".to_string(),
            ));
        }
        if let Some(bad) = waypoints.iter().find(|p| !p.is_valid()) {
            return Err(RouteError::InvalidRequest(format!("waypoint {bad} is out of range")));
        }

        let at = at.unwrap_or_else(Utc::now);
        let metadata = match self.registry.catalog().select_covering(&waypoints, at).await {
            Ok(m) => m,
            Err(MeshError::NotFound(msg)) => return Err(RouteError::InvalidRequest(msg)),
            Err(e) => return Err(e.into()),
        };
        let lease = self.registry.acquire(&metadata.id).await?;

        let mesh = lease.shared();
        let planner = self.planner.clone();
        let points = waypoints.len();
        let evaluated = tokio::task::spawn_blocking(move || planner.evaluate(&mesh, &waypoints))
            .await
            .map_err(|e| RouteError::WorkerError(format!("route evaluation task failed: {e}")))?;
        drop(lease);

        match evaluated {
            Ok(route) => {
                tracing::debug!(
                    mesh_id = %route.mesh_id,
                    points,
                    distance_nm = route.distance_nm,
                    "Route evaluated"
                );
                Ok(route)
            }
            Err(ComputeError::NoFeasibleRoute(msg)) => Err(RouteError::InvalidRequest(msg)),
            Err(e @ ComputeError::MalformedMesh(_)) => Err(RouteError::ComputationFailure(e.to_string())),
        }
    }
}
