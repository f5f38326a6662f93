//! Per-owner job scheduling on bounded worker pools.
//!
//! ## Design
//!
//! - One `(WorkerPool, Scheduler)` pair per owning entity, registered in the `WorkerManager`
//! - Jobs carry typed parameters, a retry budget and one-time/recurring flags
//! - Failed executions are re-armed with capped backoff
//! - Outcomes are reported to a `JobEventSink`
//!
//! ## Components
//!
//! - `Job`: immutable description of one unit of deferred work
//! - `HandlerRegistry`: job type → `JobHandler`
//! - `WorkerPool`: bounded concurrent execution
//! - `Scheduler`: due-job evaluation and retry bookkeeping for one owner
//! - `WorkerManager`: process-wide registry and lifecycle

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod events;
pub mod handler;
pub mod job_set;
pub mod manager;
pub mod pool;
pub mod scheduler;
pub mod types;

pub use events::{
    InMemoryJobEventSink, JobEvent, JobEventSink, NotifyingJobEventSink, TracingJobEventSink,
};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobHandler};
pub use job_set::{JobSet, Outcome, ScheduledJob, Transition};
pub use manager::{ManagerConfig, ManagerError, WorkerManager};
pub use pool::{ExecutionError, PoolState, WorkerPool};
pub use scheduler::{Scheduler, SchedulerStats, SubmitError};
pub use types::{
    BackoffStrategy, DateBound, FARM_IMAGERY_JOB, ImageryParams, Job, JobId, JobParams,
    RetryPolicy,
};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this module leaves its state consistent before
/// any call that could panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
