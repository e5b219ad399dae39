use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::request::{Fingerprint, RouteRequest};
use crate::worker::planner::Route;

/// Stable identifier of a route job; unchanged across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a job failed or was put back on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The planner found no feasible route.
    NoFeasibleRoute,
    /// The mesh dataset could not be decoded.
    MalformedMesh,
    /// The mesh selected at submission is no longer in the catalog.
    MeshUnavailable,
    /// Computation exceeded the configured limit.
    Timeout,
    /// The worker crashed, panicked or lost its lease.
    WorkerError,
}

impl FailureReason {
    /// Deterministic failures are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::WorkerError)
    }

    /// Error category exposed to polling clients.
    pub fn category(&self) -> &'static str {
        match self {
            FailureReason::NoFeasibleRoute
            | FailureReason::MalformedMesh
            | FailureReason::MeshUnavailable => "ComputationFailure",
            FailureReason::Timeout => "WorkerTimeout",
            FailureReason::WorkerError => "WorkerError",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::NoFeasibleRoute => "no_feasible_route",
            FailureReason::MalformedMesh => "malformed_mesh",
            FailureReason::MeshUnavailable => "mesh_unavailable",
            FailureReason::Timeout => "timeout",
            FailureReason::WorkerError => "worker_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub reason: FailureReason,
    pub message: String,
}

impl JobError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// A requested state change. Applied only if the job is still at the
/// version the caller last observed.
#[derive(Debug, Clone)]
pub enum Transition {
    Start {
        worker: String,
        lease_expires_at: DateTime<Utc>,
    },
    Complete {
        route: Route,
    },
    Fail {
        error: JobError,
    },
    Requeue {
        reason: FailureReason,
    },
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start { .. } => JobStatus::Running,
            Transition::Complete { .. } => JobStatus::Done,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Requeue { .. } => JobStatus::Pending,
        }
    }

    fn allowed_from(&self, status: JobStatus) -> bool {
        match self {
            Transition::Start { .. } => status == JobStatus::Pending,
            Transition::Complete { .. } | Transition::Requeue { .. } => {
                status == JobStatus::Running
            }
            Transition::Fail { .. } => {
                status == JobStatus::Pending || status == JobStatus::Running
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(Job),
    /// The job moved on since the caller read it; nothing was written.
    Rejected { current: Job },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            TransitionOutcome::Applied(job) => job,
            TransitionOutcome::Rejected { current } => current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub fingerprint: Fingerprint,
    pub request: RouteRequest,
    pub mesh_id: String,
    pub status: JobStatus,
    pub version: u64,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<Route>,
    pub error: Option<JobError>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Job {
    pub fn new(request: RouteRequest, mesh_id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            fingerprint: request.fingerprint(),
            request,
            mesh_id: mesh_id.into(),
            status: JobStatus::Pending,
            version: 0,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            claimed_by: None,
            lease_expires_at: None,
            result: None,
            error: None,
            history: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A running job whose holder has not reported back before its lease ran out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.map_or(true, |t| t <= now)
    }

    /// Apply `transition` if the job is at `expected_version` and the state
    /// machine permits it. Returns false and leaves the job untouched otherwise.
    pub fn apply(&mut self, expected_version: u64, transition: Transition, now: DateTime<Utc>) -> bool {
        if self.version != expected_version || !transition.allowed_from(self.status) {
            return false;
        }

        let from = self.status;
        let mut reason = None;
        match transition {
            Transition::Start {
                worker,
                lease_expires_at,
            } => {
                self.attempts += 1;
                self.started_at = Some(now);
                self.claimed_by = Some(worker);
                self.lease_expires_at = Some(lease_expires_at);
                self.status = JobStatus::Running;
            }
            Transition::Complete { route } => {
                self.result = Some(route);
                self.error = None;
                self.finish(JobStatus::Done, now);
            }
            Transition::Fail { error } => {
                reason = Some(error.reason);
                self.error = Some(error);
                self.result = None;
                self.finish(JobStatus::Failed, now);
            }
            Transition::Requeue { reason: why } => {
                reason = Some(why);
                self.claimed_by = None;
                self.lease_expires_at = None;
                self.status = JobStatus::Pending;
            }
        }

        self.version += 1;
        self.history.push(TransitionRecord {
            from,
            to: self.status,
            at: now,
            attempt: self.attempts,
            reason,
        });
        true
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.claimed_by = None;
        self.lease_expires_at = None;
    }
}
