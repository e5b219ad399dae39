//! Work queue between the dispatcher and the worker pool.
//!
//! Delivery is at-least-once. A claimed item is hidden from other consumers
//! until its visibility deadline; if it is not acknowledged by then, the
//! next [`WorkQueue::claim`] makes it visible again and hands it out under a
//! fresh receipt. Consumers must therefore treat every delivery as possibly
//! duplicated and rely on the job store's conditional transitions.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::JobId;

/// Unit of work: "compute this job".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// Handle for acknowledging one particular delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(Uuid);

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: Receipt,
    pub item: WorkItem,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    pub deadline: DateTime<Utc>,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> Result<()>;

    /// Atomically take the next visible item for `consumer`.
    async fn claim(&self, consumer: &str) -> Result<Option<Delivery>>;

    /// Remove a delivered item. Returns false if the receipt is no longer
    /// valid (deadline passed and the item was handed out again).
    async fn ack(&self, receipt: &Receipt) -> Result<bool>;

    /// Suspend until work may be available or `max_wait` elapses.
    async fn wait_for_work(&self, max_wait: Duration);
}

#[derive(Debug)]
struct InFlight {
    item: WorkItem,
    consumer: String,
    delivery_count: u32,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(WorkItem, u32)>,
    in_flight: HashMap<Receipt, InFlight>,
}

impl QueueState {
    /// Move every in-flight delivery whose deadline passed back to the front.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Receipt> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(r, _)| *r)
            .collect();

        for receipt in &expired {
            if let Some(flight) = self.in_flight.remove(receipt) {
                tracing::warn!(
                    job_id = %flight.item.job_id,
                    consumer = %flight.consumer,
                    deliveries = flight.delivery_count,
                    "Visibility deadline passed, item visible again"
                );
                self.ready.push_front((flight.item, flight.delivery_count));
            }
        }
        expired.len()
    }
}

/// In-process queue with visibility deadlines.
#[derive(Debug)]
pub struct MemoryWorkQueue {
    state: Mutex<QueueState>,
    visibility_timeout: TimeDelta,
    notify: Notify,
}

impl MemoryWorkQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout: TimeDelta::from_std(visibility_timeout).unwrap_or_else(|_| TimeDelta::days(365)),
            notify: Notify::new(),
        }
    }

    /// Items waiting to be claimed (excluding in-flight ones).
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            tracing::debug!(job_id = %item.job_id, depth = state.ready.len() + 1, "Work item enqueued");
            state.ready.push_back((item, 0));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn claim(&self, consumer: &str) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        let Some((item, previous_deliveries)) = state.ready.pop_front() else {
            return Ok(None);
        };

        let receipt = Receipt(Uuid::new_v4());
        let delivery_count = previous_deliveries + 1;
        let deadline = now + self.visibility_timeout;
        state.in_flight.insert(
            receipt,
            InFlight {
                item: item.clone(),
                consumer: consumer.to_string(),
                delivery_count,
                deadline,
            },
        );

        Ok(Some(Delivery {
            receipt,
            item,
            delivery_count,
            deadline,
        }))
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool> {
        Ok(self.state.lock().await.in_flight.remove(receipt).is_some())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
