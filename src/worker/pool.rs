use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::mesh::{MeshError, MeshRegistry};
use crate::scheduler::job::{FailureReason, Job, JobError, JobStatus, Transition, TransitionOutcome};
use crate::scheduler::queue::{Delivery, WorkItem, WorkQueue};
use crate::scheduler::store::JobStore;
use crate::worker::executor::{ExecutionOutcome, RouteExecutor};

/// Counters over everything the pool has processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub deliveries: u64,
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
    /// Deliveries skipped because the job was finished or held elsewhere.
    pub duplicates: u64,
    /// Final reports rejected because the job had moved on.
    pub stale_reports: u64,
}

#[derive(Debug, Default)]
struct Counters {
    deliveries: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    duplicates: AtomicU64,
    stale_reports: AtomicU64,
}

/// Fixed set of workers pulling from the work queue.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    registry: MeshRegistry,
    executor: RouteExecutor,
    config: WorkerConfig,
    counters: Counters,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        registry: MeshRegistry,
        executor: RouteExecutor,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            executor,
            config,
            counters: Counters::default(),
        }
    }

    /// Run `config.workers` workers until `shutdown` is cancelled. Each
    /// worker finishes the job it holds before exiting.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(workers = self.config.workers, "Starting worker pool");

        let handles: Vec<_> = (0..self.config.workers)
            .map(|i| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(format!("worker-{i}"), shutdown).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task terminated abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        tracing::debug!(worker = %worker_id, "Worker started");
        while !shutdown.is_cancelled() {
            match self.process_next(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %worker_id, error = %e, "Worker iteration failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        tracing::debug!(worker = %worker_id, "Worker stopped");
    }

    /// Claim and fully handle one delivery. Returns `false` when the queue
    /// had nothing visible.
    ///
    /// On error the delivery is left unacknowledged and becomes visible
    /// again after its deadline.
    pub async fn process_next(&self, worker_id: &str) -> Result<bool> {
        let Some(delivery) = self.queue.claim(worker_id).await? else {
            return Ok(false);
        };
        self.counters.deliveries.fetch_add(1, Ordering::Relaxed);

        self.handle(worker_id, &delivery).await?;

        if !self.queue.ack(&delivery.receipt).await? {
            tracing::warn!(
                job_id = %delivery.item.job_id,
                receipt = %delivery.receipt,
                "Delivery deadline passed before ack; item was redelivered"
            );
        }
        Ok(true)
    }

    async fn handle(&self, worker_id: &str, delivery: &Delivery) -> Result<()> {
        let job_id = delivery.item.job_id;
        let Some(mut job) = self.store.get(&job_id).await? else {
            tracing::warn!(job_id = %job_id, "Work item references an unknown job, dropping");
            return Ok(());
        };

        let now = Utc::now();
        if job.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Job already finished, skipping delivery");
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if job.status == JobStatus::Running {
            if !job.lease_expired(now) {
                tracing::debug!(
                    job_id = %job_id,
                    holder = ?job.claimed_by,
                    "Job is held by another worker, skipping delivery"
                );
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            tracing::warn!(
                job_id = %job_id,
                holder = ?job.claimed_by,
                attempt = job.attempts,
                "Job lease expired without a report, recovering"
            );
            match self.reclaim(&job).await? {
                Some(pending) => job = pending,
                None => return Ok(()),
            }
        }

        // The lease ends exactly when the queue would redeliver, so a
        // redelivered item always finds the lease expired.
        let start = Transition::Start {
            worker: worker_id.to_string(),
            lease_expires_at: delivery.deadline,
        };
        let job = match self.store.update_status(&job_id, job.version, start).await? {
            TransitionOutcome::Applied(j) => j,
            TransitionOutcome::Rejected { current } => {
                tracing::debug!(job_id = %job_id, status = %current.status, "Job claimed elsewhere, skipping");
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        tracing::info!(
            job_id = %job_id,
            worker = %worker_id,
            attempt = job.attempts,
            mesh_id = %job.mesh_id,
            "Job started"
        );

        let mesh = match self.registry.acquire(&job.mesh_id).await {
            Ok(lease) => lease,
            Err(e @ MeshError::NotFound(_)) => {
                let error = JobError::new(FailureReason::MeshUnavailable, e.to_string());
                return self.finish(&job, Transition::Fail { error }).await;
            }
            Err(e @ MeshError::Malformed { .. }) => {
                let error = JobError::new(FailureReason::MalformedMesh, e.to_string());
                return self.finish(&job, Transition::Fail { error }).await;
            }
            Err(e @ MeshError::Io { .. }) => {
                return self
                    .retry_or_fail(&job, JobError::new(FailureReason::WorkerError, e.to_string()))
                    .await;
            }
        };

        match self.executor.execute(job_id, &mesh, &job.request).await {
            ExecutionOutcome::Completed(route) => self.finish(&job, Transition::Complete { route }).await,
            ExecutionOutcome::Failed(error) => self.finish(&job, Transition::Fail { error }).await,
            ExecutionOutcome::Transient(error) => self.retry_or_fail(&job, error).await,
        }
    }

    /// Take back a RUNNING job whose worker is gone: back to PENDING while
    /// attempts remain, otherwise FAILED. Returns the job if it was requeued.
    async fn reclaim(&self, job: &Job) -> Result<Option<Job>> {
        if job.attempts >= self.config.max_attempts {
            let error = JobError::new(
                FailureReason::WorkerError,
                format!("worker lost after {} attempts", job.attempts),
            );
            self.finish(job, Transition::Fail { error }).await?;
            return Ok(None);
        }
        let requeue = Transition::Requeue {
            reason: FailureReason::WorkerError,
        };
        match self.store.update_status(&job.id, job.version, requeue).await? {
            TransitionOutcome::Applied(pending) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                Ok(Some(pending))
            }
            TransitionOutcome::Rejected { current } => {
                tracing::debug!(job_id = %job.id, status = %current.status, "Recovery raced with another worker");
                Ok(None)
            }
        }
    }

    /// Put every unfinished job from the store back on the queue. Jobs left
    /// RUNNING belonged to workers of a previous process and are reclaimed
    /// without waiting for their leases. Call before the workers start.
    pub async fn recover(&self) -> Result<usize> {
        let mut enqueued = 0;
        for job in self.store.list_unfinished().await? {
            let pending = if job.status == JobStatus::Running {
                tracing::warn!(
                    job_id = %job.id,
                    holder = ?job.claimed_by,
                    attempt = job.attempts,
                    "Job was running when the service stopped"
                );
                match self.reclaim(&job).await? {
                    Some(pending) => pending,
                    None => continue,
                }
            } else {
                job
            };
            self.queue.enqueue(WorkItem::new(pending.id)).await?;
            enqueued += 1;
        }
        if enqueued > 0 {
            tracing::info!(jobs = enqueued, "Requeued unfinished jobs");
        }
        Ok(enqueued)
    }

    /// Put the job back on the queue if it has attempts left, otherwise fail it.
    async fn retry_or_fail(&self, job: &Job, error: JobError) -> Result<()> {
        if job.attempts >= self.config.max_attempts {
            tracing::warn!(
                job_id = %job.id,
                attempts = job.attempts,
                reason = %error.reason,
                "Retries exhausted"
            );
            return self.finish(job, Transition::Fail { error }).await;
        }

        let requeue = Transition::Requeue { reason: error.reason };
        match self.store.update_status(&job.id, job.version, requeue).await? {
            TransitionOutcome::Applied(_) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                self.queue.enqueue(WorkItem::new(job.id)).await?;
                tracing::info!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = self.config.max_attempts,
                    reason = %error.reason,
                    "Job requeued"
                );
            }
            TransitionOutcome::Rejected { current } => self.stale(job, &current),
        }
        Ok(())
    }

    async fn finish(&self, job: &Job, transition: Transition) -> Result<()> {
        match self.store.update_status(&job.id, job.version, transition).await? {
            TransitionOutcome::Applied(done) => {
                let counter = if done.status == JobStatus::Done {
                    &self.counters.completed
                } else {
                    &self.counters.failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    job_id = %done.id,
                    status = %done.status,
                    attempts = done.attempts,
                    "Job finished"
                );
            }
            TransitionOutcome::Rejected { current } => self.stale(job, &current),
        }
        Ok(())
    }

    fn stale(&self, job: &Job, current: &Job) {
        self.counters.stale_reports.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            job_id = %job.id,
            reported_version = job.version,
            current_version = current.version,
            status = %current.status,
            "Stale worker report ignored"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            deliveries: c.deliveries.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            stale_reports: c.stale_reports.load(Ordering::Relaxed),
        }
    }
}
