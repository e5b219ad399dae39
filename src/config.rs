use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, RouteError};
use crate::mesh::CacheLimits;
use crate::worker::planner::GreatCirclePlanner;

/// Worker pool sizing and retry policy.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Attempts per job before a transient failure becomes terminal.
    pub max_attempts: u32,
    /// Upper bound on one route computation.
    pub compute_timeout: Duration,
    /// How long a claimed work item stays hidden from other workers.
    /// Must exceed `compute_timeout`.
    pub visibility_timeout: Duration,
    /// Idle wait between empty polls of the queue.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            compute_timeout: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(360),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeouts(mut self, compute: Duration, visibility: Duration) -> Self {
        self.compute_timeout = compute;
        self.visibility_timeout = visibility;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Where meshes live and how many stay resident.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub dir: PathBuf,
    pub max_cached: usize,
    pub max_cache_bytes: usize,
    /// Rescan interval for the mesh directory. `None` scans only at startup.
    pub refresh_interval: Option<Duration>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("meshes"),
            max_cached: 4,
            max_cache_bytes: 2 * 1024 * 1024 * 1024,
            refresh_interval: Some(Duration::from_secs(300)),
        }
    }
}

impl MeshConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.max_cached,
            max_bytes: self.max_cache_bytes,
        }
    }
}

/// Reuse of earlier results for equivalent requests.
#[derive(Debug, Clone)]
pub struct DedupeConfig {
    /// How long a DONE job stays reusable for an identical request.
    pub reuse_window: Duration,
    /// Start and end points within this distance of a finished route reuse it.
    /// `0.0` disables tolerance matching.
    pub waypoint_tolerance_nm: f64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            reuse_window: Duration::from_secs(6 * 3600),
            waypoint_tolerance_nm: 0.0,
        }
    }
}

impl DedupeConfig {
    pub fn with_tolerance(mut self, nm: f64) -> Self {
        self.waypoint_tolerance_nm = nm;
        self
    }
}

/// Optional expiry of finished jobs and idle meshes. Unset means keep forever.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub completed_job_ttl: Option<Duration>,
    pub mesh_idle_ttl: Option<Duration>,
    pub sweep_interval: Duration,
    /// Upper bound on stored jobs; submissions fail once it is reached.
    /// `None` leaves the store unbounded.
    pub max_jobs: Option<usize>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_job_ttl: None,
            mesh_idle_ttl: None,
            sweep_interval: Duration::from_secs(60),
            max_jobs: None,
        }
    }
}

impl RetentionConfig {
    pub fn job_capacity(&self) -> usize {
        self.max_jobs.unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub speed_knots: f64,
    pub fuel_tonnes_per_day: f64,
    pub segment_nm: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        let planner = GreatCirclePlanner::default();
        Self {
            speed_knots: planner.speed_knots,
            fuel_tonnes_per_day: planner.fuel_tonnes_per_day,
            segment_nm: planner.segment_nm,
        }
    }
}

impl PlannerConfig {
    pub fn planner(&self) -> GreatCirclePlanner {
        GreatCirclePlanner {
            speed_knots: self.speed_knots,
            fuel_tonnes_per_day: self.fuel_tonnes_per_day,
            segment_nm: self.segment_nm,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// JSON job store file. `None` keeps jobs in memory only.
    pub store_path: Option<PathBuf>,
    pub worker: WorkerConfig,
    pub mesh: MeshConfig,
    pub dedupe: DedupeConfig,
    pub retention: RetentionConfig,
    pub planner: PlannerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            store_path: None,
            worker: WorkerConfig::default(),
            mesh: MeshConfig::default(),
            dedupe: DedupeConfig::default(),
            retention: RetentionConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, mesh_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            mesh: MeshConfig::new(mesh_dir),
            ..Default::default()
        }
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_dedupe(mut self, dedupe: DedupeConfig) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.worker;
        if w.workers == 0 {
            return Err(RouteError::Config("at least one worker is required".into()));
        }
        if w.max_attempts == 0 {
            return Err(RouteError::Config("max_attempts must be at least 1".into()));
        }
        if w.compute_timeout.is_zero() {
            return Err(RouteError::Config("compute_timeout must be positive".into()));
        }
        if w.visibility_timeout <= w.compute_timeout {
            return Err(RouteError::Config(format!(
                "visibility_timeout ({:?}) must exceed compute_timeout ({:?})",
                w.visibility_timeout, w.compute_timeout
            )));
        }
        if self.mesh.max_cached == 0 || self.mesh.max_cache_bytes == 0 {
            return Err(RouteError::Config("mesh cache must hold at least one mesh".into()));
        }
        if self.retention.max_jobs == Some(0) {
            return Err(RouteError::Config("max_jobs must be at least 1".into()));
        }
        if !self.dedupe.waypoint_tolerance_nm.is_finite() || self.dedupe.waypoint_tolerance_nm < 0.0 {
            return Err(RouteError::Config(
                "waypoint_tolerance_nm must be a non-negative number".into(),
            ));
        }
        if self.planner.speed_knots <= 0.0 || self.planner.segment_nm <= 0.0 {
            return Err(RouteError::Config(
                "planner speed and segment length must be positive".into(),
            ));
        }
        Ok(())
    }
}
