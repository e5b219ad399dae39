//! Route computation contract.
//!
//! The orchestration core only knows [`RouteComputer`]: given a loaded mesh
//! and a request, return a [`Route`] or a [`ComputeError`]. Implementations
//! are synchronous and CPU-bound; the executor runs them on the blocking pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::Coordinate;
use crate::mesh::MeshData;
use crate::scheduler::request::RouteRequest;

/// One point of a computed route with cumulative metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub lat: f64,
    pub lon: f64,
    /// Hours since departure.
    pub elapsed_hours: f64,
    /// Nautical miles since departure.
    pub distance_nm: f64,
}

/// A computed route. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub mesh_id: String,
    pub waypoints: Vec<RoutePoint>,
    pub distance_nm: f64,
    pub travel_time_hours: f64,
    pub fuel_tonnes: f64,
    pub computed_at: DateTime<Utc>,
}

impl Route {
    /// Build a route from an ordered polyline, accumulating distance and time
    /// at constant `speed_knots` and fuel at `fuel_tonnes_per_day`.
    pub fn from_waypoints(
        mesh_id: impl Into<String>,
        points: Vec<Coordinate>,
        speed_knots: f64,
        fuel_tonnes_per_day: f64,
    ) -> Self {
        let mut waypoints = Vec::with_capacity(points.len());
        let mut distance = 0.0;
        let mut previous: Option<Coordinate> = None;

        for point in points {
            if let Some(prev) = previous {
                distance += prev.distance_nm(&point);
            }
            let elapsed_hours = if speed_knots > 0.0 { distance / speed_knots } else { 0.0 };
            waypoints.push(RoutePoint {
                lat: point.lat,
                lon: point.lon,
                elapsed_hours,
                distance_nm: distance,
            });
            previous = Some(point);
        }

        let travel_time_hours = waypoints.last().map(|p| p.elapsed_hours).unwrap_or(0.0);
        Self {
            mesh_id: mesh_id.into(),
            waypoints,
            distance_nm: distance,
            travel_time_hours,
            fuel_tonnes: (travel_time_hours / 24.0 * fuel_tonnes_per_day * 100.0).round() / 100.0,
            computed_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// Deterministic: the same mesh and request will fail again.
    #[error("no feasible route: {0}")]
    NoFeasibleRoute(String),

    #[error("mesh content is unusable: {0}")]
    MalformedMesh(String),
}

/// The route optimization algorithm, treated as an opaque function.
pub trait RouteComputer: Send + Sync + 'static {
    fn compute(&self, mesh: &MeshData, request: &RouteRequest) -> Result<Route, ComputeError>;
}

impl<F> RouteComputer for F
where
    F: Fn(&MeshData, &RouteRequest) -> Result<Route, ComputeError> + Send + Sync + 'static,
{
    fn compute(&self, mesh: &MeshData, request: &RouteRequest) -> Result<Route, ComputeError> {
        self(mesh, request)
    }
}

/// Reference planner: follows the great circle between the waypoints and
/// rejects routes that leave the mesh coverage.
///
/// Meshes may list impassable cells as `{"blocked": [{"lat_min": .., "lat_max": ..,
/// "lon_min": .., "lon_max": ..}]}`; a route crossing one is infeasible.
#[derive(Debug, Clone)]
pub struct GreatCirclePlanner {
    pub speed_knots: f64,
    pub fuel_tonnes_per_day: f64,
    /// Maximum spacing between emitted waypoints.
    pub segment_nm: f64,
}

impl Default for GreatCirclePlanner {
    fn default() -> Self {
        Self {
            speed_knots: 12.0,
            fuel_tonnes_per_day: 24.0,
            segment_nm: 60.0,
        }
    }
}

impl GreatCirclePlanner {
    fn blocked_cells(mesh: &MeshData) -> Result<Vec<crate::geo::BoundingBox>, ComputeError> {
        if !mesh.content.is_object() {
            return Err(ComputeError::MalformedMesh(
                "mesh payload is not a JSON object".to_string(),
            ));
        }
        match mesh.content.get("blocked") {
            None => Ok(Vec::new()),
            Some(cells) => serde_json::from_value(cells.clone())
                .map_err(|e| ComputeError::MalformedMesh(format!("invalid blocked cells: {e}"))),
        }
    }

    /// Points along the great circle `from` → `to`, at most `segment_nm` apart,
    /// both ends included. Fails if any of them is outside the mesh or blocked.
    fn trace_leg(
        &self,
        mesh: &MeshData,
        blocked: &[crate::geo::BoundingBox],
        from: &Coordinate,
        to: &Coordinate,
    ) -> Result<Vec<Coordinate>, ComputeError> {
        let total = from.distance_nm(to);
        let segments = ((total / self.segment_nm.max(1.0)).ceil() as usize).max(1);

        let mut points = Vec::with_capacity(segments + 1);
        for i in 0..=segments {
            let point = from.interpolate(to, i as f64 / segments as f64);
            if !mesh.metadata.bounds.contains(&point) {
                return Err(ComputeError::NoFeasibleRoute(format!(
                    "route leaves mesh coverage at {point}"
                )));
            }
            if blocked.iter().any(|cell| cell.contains(&point)) {
                return Err(ComputeError::NoFeasibleRoute(format!(
                    "route crosses impassable cell at {point}"
                )));
            }
            points.push(point);
        }
        Ok(points)
    }

    /// Travel time and fuel for a route supplied by the caller. Every leg is
    /// checked against the mesh the same way a computed route is.
    pub fn evaluate(&self, mesh: &MeshData, waypoints: &[Coordinate]) -> Result<Route, ComputeError> {
        if waypoints.len() < 2 {
            return Err(ComputeError::NoFeasibleRoute(
                "a route needs at least two waypoints".to_string(),
            ));
        }
        let blocked = Self::blocked_cells(mesh)?;
        for leg in waypoints.windows(2) {
            self.trace_leg(mesh, &blocked, &leg[0], &leg[1])?;
        }
        Ok(Route::from_waypoints(
            mesh.id(),
            waypoints.to_vec(),
            self.speed_knots,
            self.fuel_tonnes_per_day,
        ))
    }
}

impl RouteComputer for GreatCirclePlanner {
    fn compute(&self, mesh: &MeshData, request: &RouteRequest) -> Result<Route, ComputeError> {
        let blocked = Self::blocked_cells(mesh)?;
        let points = self.trace_leg(mesh, &blocked, &request.start, &request.end)?;
        Ok(Route::from_waypoints(
            mesh.id(),
            points,
            self.speed_knots,
            self.fuel_tonnes_per_day,
        ))
    }
}
