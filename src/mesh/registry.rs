//! Shared cache of loaded meshes.
//!
//! # Single-flight loading
//!
//! ```text
//! worker A ─┐
//!           │                        spawned load
//! worker B ─┼──► MeshRegistry ─────► MeshLoader::load
//!           │        │                     │
//! worker C ─┘        │                     │
//!                    ▼                     ▼
//!             [A, B, C all receive the same Ok or Err]
//! ```
//!
//! The first caller for a mesh id registers a broadcast sender in
//! `in_flight` and spawns the load; later callers subscribe to it. The load
//! runs in its own task so a cancelled caller never strands the waiters.
//! A successful load is inserted into the cache *before* the in-flight entry
//! is removed, and callers re-check the cache while holding the in-flight
//! lock, so no caller can slip between the two and start a second load.
//!
//! # Pinning and eviction
//!
//! [`MeshLease`] pins an entry for as long as it is alive. Eviction (LRU,
//! bounded by entry count and payload bytes) only considers unpinned
//! entries, and the lease keeps the data alive through an `Arc` even if the
//! entry leaves the cache.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::geo::Coordinate;
use crate::mesh::catalog::{MeshCatalog, MeshMetadata};
use crate::mesh::loader::{MeshData, MeshLoader};
use crate::mesh::MeshError;
use crate::scheduler::request::MeshHints;

type LoadResult = Result<Arc<CachedMesh>, MeshError>;

/// Bounds on what the registry keeps resident.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

#[derive(Debug)]
struct CachedMesh {
    data: Arc<MeshData>,
    pins: AtomicUsize,
    last_used_tick: AtomicU64,
    last_used_ms: AtomicU64,
}

/// Pinned reference to a loaded mesh. The mesh cannot be evicted while any
/// lease on it is alive.
#[derive(Debug)]
pub struct MeshLease {
    entry: Arc<CachedMesh>,
}

impl MeshLease {
    fn new(entry: Arc<CachedMesh>) -> Self {
        entry.pins.fetch_add(1, Ordering::SeqCst);
        Self { entry }
    }

    /// Owned handle for moving the mesh into a blocking task. Does not
    /// extend the pin; keep the lease alive for the duration of use.
    pub fn shared(&self) -> Arc<MeshData> {
        self.entry.data.clone()
    }
}

impl Deref for MeshLease {
    type Target = MeshData;

    fn deref(&self) -> &MeshData {
        &self.entry.data
    }
}

impl Drop for MeshLease {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Completed loader invocations (successful or not).
    pub loads: u64,
    pub load_failures: u64,
    /// Acquisitions served from the cache.
    pub hits: u64,
    /// Acquisitions that joined an in-flight load.
    pub coalesced: u64,
    pub evictions: u64,
    pub cached_meshes: usize,
    pub cached_bytes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    load_failures: AtomicU64,
    hits: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

struct RegistryInner {
    catalog: Arc<MeshCatalog>,
    loader: Arc<dyn MeshLoader>,
    limits: CacheLimits,
    cache: RwLock<HashMap<String, Arc<CachedMesh>>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<LoadResult>>>,
    epoch: Instant,
    tick: AtomicU64,
    counters: Counters,
}

impl RegistryInner {
    fn touch(&self, entry: &CachedMesh) {
        entry
            .last_used_tick
            .store(self.tick.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        entry
            .last_used_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    fn cached_entry(&self, data: MeshData) -> Arc<CachedMesh> {
        let entry = Arc::new(CachedMesh {
            data: Arc::new(data),
            pins: AtomicUsize::new(0),
            last_used_tick: AtomicU64::new(0),
            last_used_ms: AtomicU64::new(0),
        });
        self.touch(&entry);
        entry
    }

    /// Evict least recently used unpinned entries until within limits.
    /// `protect` is never evicted (the entry just inserted).
    fn enforce_limits(&self, cache: &mut HashMap<String, Arc<CachedMesh>>, protect: &str) {
        loop {
            let bytes: usize = cache.values().map(|e| e.data.size_bytes).sum();
            if cache.len() <= self.limits.max_entries && bytes <= self.limits.max_bytes {
                return;
            }

            let victim = cache
                .iter()
                .filter(|(id, e)| id.as_str() != protect && e.pins.load(Ordering::SeqCst) == 0)
                .min_by_key(|(_, e)| e.last_used_tick.load(Ordering::SeqCst))
                .map(|(id, _)| id.clone());

            match victim {
                Some(id) => {
                    cache.remove(&id);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(mesh_id = %id, cached = cache.len(), "Evicted mesh from cache");
                }
                None => {
                    tracing::warn!(
                        cached = cache.len(),
                        bytes,
                        "Mesh cache over budget but every other entry is pinned"
                    );
                    return;
                }
            }
        }
    }
}

/// Resolves and caches mesh handles. Cheap to clone.
#[derive(Clone)]
pub struct MeshRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for MeshRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshRegistry")
            .field("limits", &self.inner.limits)
            .finish_non_exhaustive()
    }
}

impl MeshRegistry {
    pub fn new(catalog: Arc<MeshCatalog>, loader: Arc<dyn MeshLoader>, limits: CacheLimits) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                catalog,
                loader,
                limits,
                cache: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                epoch: Instant::now(),
                tick: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<MeshCatalog> {
        &self.inner.catalog
    }

    /// Choose the mesh for a request without loading it.
    pub async fn select(
        &self,
        start: &Coordinate,
        end: &Coordinate,
        at: DateTime<Utc>,
        hints: &MeshHints,
    ) -> Result<MeshMetadata, MeshError> {
        self.inner.catalog.select(start, end, at, hints).await
    }

    /// Choose and load the mesh for a request.
    pub async fn resolve(
        &self,
        start: &Coordinate,
        end: &Coordinate,
        at: DateTime<Utc>,
        hints: &MeshHints,
    ) -> Result<MeshLease, MeshError> {
        let metadata = self.select(start, end, at, hints).await?;
        self.acquire(&metadata.id).await
    }

    /// Pin the mesh `mesh_id`, loading it if necessary. Concurrent calls for
    /// the same id share one load and all observe its outcome.
    pub async fn acquire(&self, mesh_id: &str) -> Result<MeshLease, MeshError> {
        if let Some(lease) = self.lookup(mesh_id).await {
            return Ok(lease);
        }

        let mut rx = {
            let mut in_flight = self.inner.in_flight.lock().await;

            // A load may have finished between the lookup and taking the lock.
            if let Some(lease) = self.lookup(mesh_id).await {
                return Ok(lease);
            }

            match in_flight.get(mesh_id) {
                Some(tx) => {
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(mesh_id, "Joining in-flight mesh load");
                    tx.subscribe()
                }
                None => {
                    let metadata = self.inner.catalog.get(mesh_id).await.ok_or_else(|| {
                        MeshError::NotFound(format!("mesh {mesh_id} is not in the catalog"))
                    })?;
                    let (tx, rx) = broadcast::channel(1);
                    in_flight.insert(mesh_id.to_string(), tx);
                    tokio::spawn(Self::load_and_publish(self.inner.clone(), metadata));
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(Ok(entry)) => {
                self.inner.touch(&entry);
                Ok(MeshLease::new(entry))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MeshError::Io {
                mesh_id: mesh_id.to_string(),
                reason: "mesh load was abandoned".to_string(),
            }),
        }
    }

    async fn lookup(&self, mesh_id: &str) -> Option<MeshLease> {
        let cache = self.inner.cache.read().await;
        let entry = cache.get(mesh_id)?;
        self.inner.touch(entry);
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(MeshLease::new(entry.clone()))
    }

    async fn load_and_publish(inner: Arc<RegistryInner>, metadata: MeshMetadata) {
        let mesh_id = metadata.id.clone();
        let loader = inner.loader.clone();

        let loaded = tokio::spawn(async move { loader.load(&metadata).await }).await;
        let result: LoadResult = match loaded {
            Ok(Ok(data)) => Ok(inner.cached_entry(data)),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(MeshError::Io {
                mesh_id: mesh_id.clone(),
                reason: format!("loader task failed: {e}"),
            }),
        };

        inner.counters.loads.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(ref entry) => {
                let mut cache = inner.cache.write().await;
                cache.insert(mesh_id.clone(), entry.clone());
                inner.enforce_limits(&mut cache, &mesh_id);
            }
            Err(ref e) => {
                inner.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(mesh_id = %mesh_id, error = %e, "Mesh load failed");
            }
        }

        let tx = inner.in_flight.lock().await.remove(&mesh_id);
        if let Some(tx) = tx {
            let waiters = tx.receiver_count();
            let _ = tx.send(result);
            tracing::debug!(mesh_id = %mesh_id, waiters, "Mesh load outcome published");
        }
    }

    /// Replace the catalog and drop cached meshes that are no longer listed
    /// or whose metadata changed. Pinned meshes stay until their leases are
    /// released; the next refresh drops them.
    pub async fn refresh(&self, entries: Vec<MeshMetadata>) -> usize {
        let removed = self.inner.catalog.replace(entries.clone()).await;
        if !removed.is_empty() {
            tracing::info!(removed = ?removed, "Meshes removed from catalog");
        }

        let mut cache = self.inner.cache.write().await;
        let stale: Vec<String> = cache
            .iter()
            .filter(|(id, entry)| match entries.iter().find(|m| &m.id == *id) {
                Some(current) => *current != entry.data.metadata,
                None => true,
            })
            .filter(|(_, entry)| entry.pins.load(Ordering::SeqCst) == 0)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            cache.remove(id);
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(mesh_id = %id, "Dropped cached mesh after catalog refresh");
        }
        stale.len()
    }

    /// Evict unpinned meshes unused for at least `idle`.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        let idle_ms = idle.as_millis() as u64;

        let mut cache = self.inner.cache.write().await;
        let before = cache.len();
        cache.retain(|id, entry| {
            let unused_for = now_ms.saturating_sub(entry.last_used_ms.load(Ordering::SeqCst));
            let keep = entry.pins.load(Ordering::SeqCst) > 0 || unused_for < idle_ms;
            if !keep {
                tracing::info!(mesh_id = %id, unused_for_ms = unused_for, "Evicted idle mesh");
            }
            keep
        });
        let evicted = before - cache.len();
        self.inner
            .counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub async fn is_cached(&self, mesh_id: &str) -> bool {
        self.inner.cache.read().await.contains_key(mesh_id)
    }

    /// Number of live leases on a cached mesh.
    pub async fn pin_count(&self, mesh_id: &str) -> usize {
        self.inner
            .cache
            .read()
            .await
            .get(mesh_id)
            .map(|e| e.pins.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub async fn stats(&self) -> RegistryStats {
        let cache = self.inner.cache.read().await;
        let c = &self.inner.counters;
        RegistryStats {
            loads: c.loads.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            cached_meshes: cache.len(),
            cached_bytes: cache.values().map(|e| e.data.size_bytes).sum(),
        }
    }
}
