use thiserror::Error;

use crate::mesh::MeshError;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Mesh not found: {0}")]
    MeshNotFound(String),

    #[error("Computation failed: {0}")]
    ComputationFailure(String),

    #[error("Worker timed out: {0}")]
    WorkerTimeout(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouteError {
    /// Infrastructure errors a caller may retry without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouteError::StorageFailure(_) | RouteError::WorkerTimeout(_) | RouteError::WorkerError(_)
        )
    }
}

impl From<std::io::Error> for RouteError {
    fn from(e: std::io::Error) -> Self {
        RouteError::StorageFailure(e.to_string())
    }
}

impl From<serde_json::Error> for RouteError {
    fn from(e: serde_json::Error) -> Self {
        RouteError::StorageFailure(e.to_string())
    }
}

impl From<MeshError> for RouteError {
    fn from(e: MeshError) -> Self {
        match e {
            MeshError::NotFound(msg) => RouteError::MeshNotFound(msg),
            MeshError::Malformed { .. } => RouteError::ComputationFailure(e.to_string()),
            MeshError::Io { .. } => RouteError::WorkerError(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_categories() {
        assert!(RouteError::StorageFailure("disk".into()).is_retryable());
        assert!(RouteError::WorkerTimeout("slow".into()).is_retryable());
        assert!(RouteError::WorkerError("crash".into()).is_retryable());
        assert!(!RouteError::InvalidRequest("bad".into()).is_retryable());
        assert!(!RouteError::ComputationFailure("none".into()).is_retryable());
        assert!(!RouteError::JobNotFound("x".into()).is_retryable());
    }

    #[test]
    fn mesh_errors_map_to_taxonomy() {
        let not_found: RouteError = MeshError::NotFound("arctic".into()).into();
        assert!(matches!(not_found, RouteError::MeshNotFound(_)));

        let malformed: RouteError = MeshError::Malformed {
            mesh_id: "arctic".into(),
            reason: "truncated".into(),
        }
        .into();
        assert!(matches!(malformed, RouteError::ComputationFailure(_)));
    }
}
