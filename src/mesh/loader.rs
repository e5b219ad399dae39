use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::mesh::catalog::MeshMetadata;
use crate::mesh::MeshError;

/// A mesh held in memory. Opaque to the orchestration core; only the
/// route planner looks inside `content`.
#[derive(Debug)]
pub struct MeshData {
    pub metadata: MeshMetadata,
    pub content: serde_json::Value,
    /// Payload size, used for the cache memory budget.
    pub size_bytes: usize,
}

impl MeshData {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// Reads a mesh payload. Loading is expensive; callers go through
/// [`MeshRegistry`](crate::mesh::MeshRegistry) which deduplicates loads.
#[async_trait]
pub trait MeshLoader: Send + Sync {
    async fn load(&self, metadata: &MeshMetadata) -> Result<MeshData, MeshError>;
}

/// Loads JSON mesh payloads from the filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsMeshLoader;

impl FsMeshLoader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MeshLoader for FsMeshLoader {
    async fn load(&self, metadata: &MeshMetadata) -> Result<MeshData, MeshError> {
        tracing::info!(mesh_id = %metadata.id, path = %metadata.file.display(), "Loading mesh");

        let bytes = tokio::fs::read(&metadata.file).await.map_err(|e| MeshError::Io {
            mesh_id: metadata.id.clone(),
            reason: e.to_string(),
        })?;

        if let Some(ref expected) = metadata.sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(MeshError::Malformed {
                    mesh_id: metadata.id.clone(),
                    reason: format!("checksum mismatch: expected {expected}, got {actual}"),
                });
            }
        }

        let size_bytes = bytes.len();
        let content = tokio::task::spawn_blocking(move || serde_json::from_slice::<serde_json::Value>(&bytes))
            .await
            .map_err(|e| MeshError::Io {
                mesh_id: metadata.id.clone(),
                reason: format!("decode task failed: {e}"),
            })?
            .map_err(|e| MeshError::Malformed {
                mesh_id: metadata.id.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(mesh_id = %metadata.id, size_bytes, "Mesh loaded");

        Ok(MeshData {
            metadata: metadata.clone(),
            content,
            size_bytes,
        })
    }
}
