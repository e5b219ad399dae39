pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod request;
pub mod store;

pub use dispatcher::{Disposition, Dispatcher, Submission};
pub use job::{FailureReason, Job, JobError, JobId, JobStatus, Transition, TransitionOutcome};
pub use queue::{Delivery, MemoryWorkQueue, Receipt, WorkItem, WorkQueue};
pub use request::{Fingerprint, MeshHints, RouteRequest};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
