//! Navigation mesh datasets.
//!
//! - [`catalog`]: metadata of every mesh in the mesh directory, and selection
//!   of the mesh that serves a pair of waypoints at a given time
//! - [`loader`]: reading a mesh payload into memory
//! - [`registry`]: shared cache of loaded meshes with single-flight loading,
//!   pinning while in use and LRU eviction

pub mod catalog;
pub mod loader;
pub mod registry;

pub use catalog::{MeshCatalog, MeshMetadata};
pub use loader::{FsMeshLoader, MeshData, MeshLoader};
pub use registry::{CacheLimits, MeshLease, MeshRegistry, RegistryStats};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("no mesh available: {0}")]
    NotFound(String),

    #[error("mesh {mesh_id} is malformed: {reason}")]
    Malformed { mesh_id: String, reason: String },

    #[error("failed to read mesh {mesh_id}: {reason}")]
    Io { mesh_id: String, reason: String },
}
