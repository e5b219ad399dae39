use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::geo::{BoundingBox, Coordinate};
use crate::mesh::MeshError;
use crate::scheduler::request::MeshHints;

/// Suffix of the metadata sidecar written next to every mesh payload.
pub const METADATA_SUFFIX: &str = ".meta.json";

/// Mesh description readable without loading the mesh itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMetadata {
    pub id: String,
    /// Payload path. Relative paths are resolved against the mesh directory.
    pub file: PathBuf,
    /// When the mesh was generated.
    pub created: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub bounds: BoundingBox,
    /// Hex SHA-256 of the payload, verified on load when present.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl MeshMetadata {
    pub fn covers(&self, start: &Coordinate, end: &Coordinate) -> bool {
        self.bounds.contains(start) && self.bounds.contains(end)
    }

    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at <= self.valid_until
    }
}

/// Set of meshes known to the service.
#[derive(Debug, Default)]
pub struct MeshCatalog {
    entries: RwLock<Vec<MeshMetadata>>,
}

impl MeshCatalog {
    pub fn new(entries: Vec<MeshMetadata>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Read every `*.meta.json` sidecar in `dir`. Unreadable sidecars are
    /// logged and skipped so one bad upload does not hide the others.
    pub async fn scan_dir(dir: &Path) -> Result<Vec<MeshMetadata>, MeshError> {
        let io_err = |e: std::io::Error| MeshError::Io {
            mesh_id: dir.display().to_string(),
            reason: e.to_string(),
        };

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(METADATA_SUFFIX));
            if !is_sidecar {
                continue;
            }

            match Self::read_sidecar(dir, &path).await {
                Ok(meta) => entries.push(meta),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable mesh metadata");
                }
            }
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn read_sidecar(dir: &Path, path: &Path) -> Result<MeshMetadata, MeshError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| MeshError::Io {
            mesh_id: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut meta: MeshMetadata =
            serde_json::from_slice(&bytes).map_err(|e| MeshError::Malformed {
                mesh_id: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if meta.valid_from > meta.valid_until {
            return Err(MeshError::Malformed {
                mesh_id: meta.id,
                reason: "validity window ends before it starts".to_string(),
            });
        }
        if meta.file.is_relative() {
            meta.file = dir.join(&meta.file);
        }
        Ok(meta)
    }

    /// Replace the catalog contents, returning ids that disappeared.
    pub async fn replace(&self, entries: Vec<MeshMetadata>) -> Vec<String> {
        let mut current = self.entries.write().await;
        let removed = current
            .iter()
            .filter(|old| !entries.iter().any(|new| new.id == old.id))
            .map(|old| old.id.clone())
            .collect();
        *current = entries;
        removed
    }

    pub async fn get(&self, mesh_id: &str) -> Option<MeshMetadata> {
        self.entries
            .read()
            .await
            .iter()
            .find(|m| m.id == mesh_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<MeshMetadata> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pick the mesh serving `start` → `end` at `at`.
    ///
    /// Candidates must cover both points and be valid at `at`. A hinted mesh
    /// wins if it is a candidate; otherwise the most recently generated mesh
    /// wins, then the one with the smallest coverage.
    pub async fn select(
        &self,
        start: &Coordinate,
        end: &Coordinate,
        at: DateTime<Utc>,
        hints: &MeshHints,
    ) -> Result<MeshMetadata, MeshError> {
        let entries = self.entries.read().await;
        let candidates: Vec<&MeshMetadata> = entries
            .iter()
            .filter(|m| m.covers(start, end) && m.valid_at(at))
            .filter(|m| hints.generated_after.map_or(true, |after| m.created >= after))
            .collect();

        if let Some(ref wanted) = hints.mesh_id {
            if let Some(hinted) = candidates.iter().find(|m| &m.id == wanted) {
                return Ok((*hinted).clone());
            }
            tracing::debug!(mesh_id = %wanted, "Hinted mesh does not cover request, ignoring hint");
        }

        newest(candidates).ok_or_else(|| {
            MeshError::NotFound(format!("no mesh covers {start} -> {end} at {at}"))
        })
    }

    /// Choose the newest mesh containing every point of a polyline.
    pub async fn select_covering(
        &self,
        points: &[Coordinate],
        at: DateTime<Utc>,
    ) -> Result<MeshMetadata, MeshError> {
        let entries = self.entries.read().await;
        let candidates = entries
            .iter()
            .filter(|m| m.valid_at(at) && points.iter().all(|p| m.bounds.contains(p)))
            .collect();

        newest(candidates).ok_or_else(|| {
            MeshError::NotFound(format!("no mesh covers all {} route points at {at}", points.len()))
        })
    }
}

/// Newest first, then the tighter coverage, then the smaller id.
fn newest(candidates: Vec<&MeshMetadata>) -> Option<MeshMetadata> {
    candidates
        .into_iter()
        .max_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| b.bounds.area().total_cmp(&a.bounds.area()))
                .then_with(|| b.id.cmp(&a.id))
        })
        .cloned()
}
