use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, RouteError};
use crate::geo::Coordinate;

/// Decimal places kept when normalizing coordinates (~11 m at the equator).
const COORDINATE_PRECISION: i32 = 4;

/// Optional constraints on which mesh may serve a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshHints {
    /// Use this mesh if it covers the request.
    #[serde(default)]
    pub mesh_id: Option<String>,
    /// Ignore meshes generated before this instant.
    #[serde(default)]
    pub generated_after: Option<DateTime<Utc>>,
}

/// Deterministic identity of a route request, used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request for a route between two points. Never mutated after intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub start: Coordinate,
    pub end: Coordinate,
    #[serde(default)]
    pub departure_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_name: Option<String>,
    #[serde(default)]
    pub end_name: Option<String>,
    #[serde(default)]
    pub hints: MeshHints,
    /// Skip reuse of already-completed routes.
    #[serde(default)]
    pub force_recalculate: bool,
}

impl RouteRequest {
    pub fn new(start: Coordinate, end: Coordinate) -> Self {
        Self {
            start,
            end,
            departure_time: None,
            start_name: None,
            end_name: None,
            hints: MeshHints::default(),
            force_recalculate: false,
        }
    }

    pub fn with_departure_time(mut self, departure_time: DateTime<Utc>) -> Self {
        self.departure_time = Some(departure_time);
        self
    }

    pub fn with_names(mut self, start_name: impl Into<String>, end_name: impl Into<String>) -> Self {
        self.start_name = Some(start_name.into());
        self.end_name = Some(end_name.into());
        self
    }

    pub fn with_hints(mut self, hints: MeshHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn force_recalculate(mut self) -> Self {
        self.force_recalculate = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.start.is_valid() {
            return Err(RouteError::InvalidRequest(format!(
                "start waypoint {} is out of range",
                self.start
            )));
        }
        if !self.end.is_valid() {
            return Err(RouteError::InvalidRequest(format!(
                "end waypoint {} is out of range",
                self.end
            )));
        }
        if self.start == self.end {
            return Err(RouteError::InvalidRequest(
                "start and end waypoints are identical".to_string(),
            ));
        }
        Ok(())
    }

    /// Instant the route is planned for; requests without a departure time mean "now".
    pub fn effective_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.departure_time.unwrap_or(now)
    }

    /// Hash of the normalized request. Display names and the recalculation
    /// flag do not change what gets computed and are left out.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(normalize(self.start.lat).to_le_bytes());
        hasher.update(normalize(self.start.lon).to_le_bytes());
        hasher.update(normalize(self.end.lat).to_le_bytes());
        hasher.update(normalize(self.end.lon).to_le_bytes());

        match self.departure_time {
            Some(t) => {
                let hour = t.duration_trunc(TimeDelta::hours(1)).unwrap_or(t);
                hasher.update(hour.timestamp().to_le_bytes());
            }
            None => hasher.update(b"none"),
        }

        hasher.update(b"|mesh_id=");
        if let Some(ref mesh_id) = self.hints.mesh_id {
            hasher.update(mesh_id.as_bytes());
        }
        hasher.update(b"|generated_after=");
        if let Some(after) = self.hints.generated_after {
            hasher.update(after.timestamp().to_le_bytes());
        }

        Fingerprint(hex::encode(hasher.finalize()))
    }
}

fn normalize(value: f64) -> i64 {
    let scale = 10f64.powi(COORDINATE_PRECISION);
    (value * scale).round() as i64
}
