//! Background housekeeping: retention of finished jobs, eviction of idle
//! meshes and rescanning of the mesh directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::mesh::{MeshCatalog, MeshRegistry};
use crate::scheduler::store::JobStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_jobs: usize,
    pub evicted_meshes: usize,
}

/// Apply the retention policy once.
pub async fn sweep_once(
    store: &dyn JobStore,
    registry: &MeshRegistry,
    retention: &RetentionConfig,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    // A ttl too large to subtract from now cannot match anything.
    let cutoff = retention
        .completed_job_ttl
        .and_then(|ttl| TimeDelta::from_std(ttl).ok())
        .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
    if let Some(cutoff) = cutoff {
        report.purged_jobs = store.purge_finished(cutoff).await?;
    }
    if let Some(idle) = retention.mesh_idle_ttl {
        report.evicted_meshes = registry.evict_idle(idle).await;
    }

    if report != SweepReport::default() {
        tracing::info!(
            purged_jobs = report.purged_jobs,
            evicted_meshes = report.evicted_meshes,
            "Retention sweep"
        );
    }
    Ok(report)
}

/// Run [`sweep_once`] every `sweep_interval` until cancelled. Returns
/// immediately when no retention is configured.
pub async fn retention_loop(
    store: Arc<dyn JobStore>,
    registry: MeshRegistry,
    retention: RetentionConfig,
    shutdown: CancellationToken,
) {
    if retention.completed_job_ttl.is_none() && retention.mesh_idle_ttl.is_none() {
        tracing::debug!("No retention policy configured");
        return;
    }

    let mut interval = tokio::time::interval(retention.sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = sweep_once(store.as_ref(), &registry, &retention).await {
                    tracing::warn!(error = %e, "Retention sweep failed");
                }
            }
        }
    }
}

/// Rescan `dir` and swap the result into the registry's catalog.
/// Returns the number of meshes now known.
pub async fn refresh_catalog(registry: &MeshRegistry, dir: &Path) -> Result<usize> {
    let entries = MeshCatalog::scan_dir(dir).await?;
    let count = entries.len();
    let dropped = registry.refresh(entries).await;
    tracing::debug!(meshes = count, dropped, dir = %dir.display(), "Mesh catalog refreshed");
    Ok(count)
}

pub async fn catalog_refresh_loop(
    registry: MeshRegistry,
    dir: PathBuf,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately and startup already scanned.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = refresh_catalog(&registry, &dir).await {
                    tracing::warn!(dir = %dir.display(), error = %e, "Mesh catalog refresh failed");
                }
            }
        }
    }
}
