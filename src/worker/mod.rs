//! Route computation workers.
//!
//! # Components
//!
//! - [`planner`]: the [`RouteComputer`] contract and the reference
//!   [`GreatCirclePlanner`]
//! - [`RouteExecutor`]: runs a computation on the blocking pool under a timeout
//! - [`WorkerPool`]: workers that claim queued jobs and drive them to a
//!   terminal state
//!
//! # Execution Flow
//!
//! 1. A worker claims a delivery from the [`WorkQueue`](crate::scheduler::WorkQueue)
//! 2. The job is moved to `RUNNING` with a lease matching the delivery deadline
//! 3. The job's mesh is pinned through the [`MeshRegistry`](crate::mesh::MeshRegistry)
//! 4. [`RouteExecutor::execute`] runs the planner and classifies the outcome
//! 5. The outcome is written back with a version-checked transition and the
//!    delivery is acknowledged

pub mod executor;
pub mod planner;
pub mod pool;

pub use executor::{ExecutionOutcome, RouteExecutor};
pub use planner::{ComputeError, GreatCirclePlanner, Route, RouteComputer, RoutePoint};
pub use pool::{PoolStats, WorkerPool};
