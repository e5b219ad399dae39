//! Geographic primitives shared by mesh selection, deduplication and planning.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in nautical miles.
const EARTH_RADIUS_NM: f64 = 3440.065;

/// A point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance to `other` in nautical miles.
    pub fn distance_nm(&self, other: &Coordinate) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lon = (other.lon - self.lon).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().min(1.0).asin();

        EARTH_RADIUS_NM * c
    }

    /// Point at `fraction` (0.0..=1.0) along the great circle towards `other`.
    pub fn interpolate(&self, other: &Coordinate, fraction: f64) -> Coordinate {
        let lat1 = self.lat.to_radians();
        let lon1 = self.lon.to_radians();
        let lat2 = other.lat.to_radians();
        let lon2 = other.lon.to_radians();

        let d = self.distance_nm(other) / EARTH_RADIUS_NM;
        if d.abs() < f64::EPSILON {
            return *self;
        }

        let a = ((1.0 - fraction) * d).sin() / d.sin();
        let b = (fraction * d).sin() / d.sin();
        let x = a * lat1.cos() * lon1.cos() + b * lat2.cos() * lon2.cos();
        let y = a * lat1.cos() * lon1.sin() + b * lat2.cos() * lon2.sin();
        let z = a * lat1.sin() + b * lat2.sin();

        Coordinate {
            lat: z.atan2((x * x + y * y).sqrt()).to_degrees(),
            lon: y.atan2(x).to_degrees(),
        }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.4}, {:.4})", self.lat, self.lon)
    }
}

/// Geographic coverage of a mesh. Edges are inclusive.
///
/// A box with `lon_min > lon_max` wraps across the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> Self {
        Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
        }
    }

    pub fn wraps_antimeridian(&self) -> bool {
        self.lon_min > self.lon_max
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        if point.lat < self.lat_min || point.lat > self.lat_max {
            return false;
        }
        if self.wraps_antimeridian() {
            point.lon >= self.lon_min || point.lon <= self.lon_max
        } else {
            point.lon >= self.lon_min && point.lon <= self.lon_max
        }
    }

    /// Extent in square degrees, used to prefer tighter meshes.
    pub fn area(&self) -> f64 {
        let lon_span = if self.wraps_antimeridian() {
            360.0 - (self.lon_min - self.lon_max)
        } else {
            self.lon_max - self.lon_min
        };
        (self.lat_max - self.lat_min) * lon_span
    }
}
