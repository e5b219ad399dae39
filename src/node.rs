use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServerConfig;
use crate::error::{Result, RouteError};
use crate::evaluation::EvaluationService;
use crate::maintenance::{catalog_refresh_loop, retention_loop};
use crate::mesh::{FsMeshLoader, MeshCatalog, MeshLoader, MeshRegistry};
use crate::scheduler::{Dispatcher, FileJobStore, JobStore, MemoryJobStore, MemoryWorkQueue, WorkQueue};
use crate::status::StatusService;
use crate::worker::{RouteComputer, RouteExecutor, WorkerPool};

/// A single routing service instance: every component wired together.
pub struct Node {
    pub config: ServerConfig,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub registry: MeshRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub status: StatusService,
    pub evaluator: EvaluationService,
    pub pool: Arc<WorkerPool>,
}

impl Node {
    /// Build a node from configuration: open the job store, scan the mesh
    /// directory and use the configured great-circle planner. Jobs the store
    /// still holds as unfinished are queued again.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let capacity = config.retention.job_capacity();
        if let (Some(max_jobs), None) = (config.retention.max_jobs, config.retention.completed_job_ttl) {
            tracing::warn!(
                max_jobs,
                "Job store is capped but finished jobs never expire; submissions will fail once it fills"
            );
        }
        let store: Arc<dyn JobStore> = match config.store_path {
            Some(ref path) => Arc::new(FileJobStore::open_with_capacity(path, capacity).await?),
            None => Arc::new(MemoryJobStore::with_capacity(capacity)),
        };

        let entries = MeshCatalog::scan_dir(&config.mesh.dir).await.map_err(|e| {
            RouteError::Config(format!(
                "cannot read mesh directory {}: {e}",
                config.mesh.dir.display()
            ))
        })?;
        tracing::info!(meshes = entries.len(), dir = %config.mesh.dir.display(), "Mesh catalog loaded");

        let queue = Arc::new(MemoryWorkQueue::new(config.worker.visibility_timeout));
        let computer = Arc::new(config.planner.planner());
        let node = Self::with_components(
            config,
            store,
            queue,
            Arc::new(MeshCatalog::new(entries)),
            Arc::new(FsMeshLoader::new()),
            computer,
        )?;
        node.pool.recover().await?;
        Ok(node)
    }

    /// Wire a node around caller-supplied collaborators.
    pub fn with_components(
        config: ServerConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        catalog: Arc<MeshCatalog>,
        loader: Arc<dyn MeshLoader>,
        computer: Arc<dyn RouteComputer>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = MeshRegistry::new(catalog, loader, config.mesh.cache_limits());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            config.dedupe.clone(),
        ));
        let status = StatusService::new(store.clone());
        let evaluator = EvaluationService::new(registry.clone(), config.planner.planner());
        let executor = RouteExecutor::new(computer, config.worker.compute_timeout);
        let pool = Arc::new(WorkerPool::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            executor,
            config.worker.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue,
            registry,
            dispatcher,
            status,
            evaluator,
            pool,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            dispatcher: self.dispatcher.clone(),
            status: self.status.clone(),
            evaluator: self.evaluator.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Start background tasks (workers, retention, catalog refresh) without
    /// the HTTP API. Returns a handle that resolves once the workers drained.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(retention_loop(
            self.store.clone(),
            self.registry.clone(),
            self.config.retention.clone(),
            shutdown.clone(),
        ));

        if let Some(every) = self.config.mesh.refresh_interval {
            tokio::spawn(catalog_refresh_loop(
                self.registry.clone(),
                self.config.mesh.dir.clone(),
                every,
                shutdown.clone(),
            ));
        }

        tokio::spawn(self.pool.clone().run(shutdown))
    }

    /// Run until `shutdown` is cancelled, then wait for in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let workers = self.spawn_background(shutdown.clone());

        let served = run_api(self.config.listen_addr, self.api_state(), shutdown.clone()).await;
        if served.is_err() {
            shutdown.cancel();
        }

        tracing::info!("Waiting for workers to finish in-flight jobs");
        if let Err(e) = workers.await {
            tracing::error!(error = %e, "Worker pool task failed");
        }
        served
    }
}
