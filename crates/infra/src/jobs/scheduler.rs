//! Per-owner scheduler: arms jobs, evaluates due ones on a timer and dispatches
//! them into the owner's worker pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cropwatch_core::{DomainError, OwnerId, PoolId};

use super::events::{JobEvent, JobEventSink};
use super::job_set::{Dispatch, JobSet, Outcome, ScheduledJob, Transition};
use super::lock;
use super::pool::{ExecutionError, WorkerPool};
use super::types::{Job, JobId, RetryPolicy};

/// Why a job was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("job {0} is already scheduled")]
    DuplicateJob(JobId),
    #[error("invalid job parameters: {0}")]
    InvalidParams(#[from] DomainError),
    #[error("no handler registered for job type {0:?}")]
    UnknownJobType(String),
    #[error("scheduler is stopped")]
    Stopped,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retired: u64,
    pub exhausted: u64,
    pub abandoned_occurrences: u64,
    /// Dispatches held back by the pool's daily quota
    pub deferred: u64,
}

/// Timing knobs of one scheduler.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerSettings {
    pub tick: Duration,
    pub period: Duration,
    pub backoff: RetryPolicy,
}

/// The job set of one owner and the loop that drives it.
pub struct Scheduler {
    owner_id: OwnerId,
    pool: Arc<WorkerPool>,
    settings: SchedulerSettings,
    jobs: Mutex<JobSet>,
    stats: Mutex<SchedulerStats>,
    sink: Arc<dyn JobEventSink>,
    wake: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(
        pool: Arc<WorkerPool>,
        settings: SchedulerSettings,
        sink: Arc<dyn JobEventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            owner_id: pool.owner_id(),
            pool,
            settings,
            jobs: Mutex::new(JobSet::new()),
            stats: Mutex::new(SchedulerStats::default()),
            sink,
            wake: Notify::new(),
            cancel,
            task: Mutex::new(None),
        }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool.id()
    }

    pub fn stats(&self) -> SchedulerStats {
        lock(&self.stats).clone()
    }

    pub fn job_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    /// Snapshot of one job's scheduling state.
    pub fn job(&self, id: &JobId) -> Option<ScheduledJob> {
        lock(&self.jobs).get(id).cloned()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Arm a job. Returns its first due time.
    pub fn submit(&self, job: Job) -> Result<DateTime<Utc>, SubmitError> {
        if self.cancel.is_cancelled() {
            return Err(SubmitError::Stopped);
        }
        job.params.validate(self.owner_id)?;
        if !self.pool.handles(job.type_name()) {
            return Err(SubmitError::UnknownJobType(job.type_name().to_string()));
        }

        let id = job.id.clone();
        let run_now = job.run_now;
        let job_type = job.type_name().to_string();
        let next_due_at = lock(&self.jobs)
            .insert(job, Utc::now(), self.settings.period)
            .ok_or_else(|| SubmitError::DuplicateJob(id.clone()))?;

        info!(
            owner = %self.owner_id,
            job_id = %id,
            job_type = %job_type,
            next_due_at = %next_due_at,
            "job submitted"
        );
        if run_now {
            self.wake.notify_one();
        }
        Ok(next_due_at)
    }

    /// Dispatch every due job into the pool. Returns how many were dispatched.
    pub fn tick(self: &Arc<Self>) -> usize {
        let due = lock(&self.jobs).take_due(Utc::now());
        if due.is_empty() {
            return 0;
        }
        debug!(owner = %self.owner_id, due = due.len(), "dispatching due jobs");

        let count = due.len();
        for dispatch in due {
            self.dispatch(dispatch);
        }
        count
    }

    fn dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        lock(&self.stats).dispatched += 1;
        self.sink.record(JobEvent::Dispatched {
            owner_id: self.owner_id,
            job_id: dispatch.job_id.clone(),
            job_type: dispatch.params.type_name().to_string(),
            attempt: dispatch.attempt,
        });

        let scheduler = Arc::clone(self);
        self.pool.spawn(async move {
            let result = scheduler.pool.execute(&dispatch.params).await;
            scheduler.complete(&dispatch.job_id, dispatch.params.type_name(), result);
        });
    }

    /// Apply an execution result to the job's scheduling state.
    pub(crate) fn complete(
        &self,
        job_id: &JobId,
        job_type: &str,
        result: Result<(), ExecutionError>,
    ) -> Transition {
        let (outcome, error) = match &result {
            Ok(()) => (Outcome::Success, None),
            Err(ExecutionError::UnknownJobType(_)) => (Outcome::Misconfigured, None),
            Err(ExecutionError::PoolStopped) => (Outcome::Released, None),
            Err(ExecutionError::QuotaExceeded { resets_at, .. }) => {
                (Outcome::Deferred { until: *resets_at }, None)
            }
            Err(e) => (Outcome::Failure, Some(e.to_string())),
        };

        let transition = lock(&self.jobs).complete(
            job_id,
            outcome,
            Utc::now(),
            self.settings.period,
            &self.settings.backoff,
        );

        {
            let mut stats = lock(&self.stats);
            match outcome {
                Outcome::Success => stats.succeeded += 1,
                Outcome::Failure => stats.failed += 1,
                Outcome::Deferred { .. } => stats.deferred += 1,
                Outcome::Misconfigured | Outcome::Released => {}
            }
            match transition {
                Transition::Retired => stats.retired += 1,
                Transition::Exhausted { .. } => stats.exhausted += 1,
                Transition::OccurrenceAbandoned { .. } => stats.abandoned_occurrences += 1,
                _ => {}
            }
        }

        self.report(job_id, job_type, &transition, error.unwrap_or_default());
        transition
    }

    fn report(&self, job_id: &JobId, job_type: &str, transition: &Transition, error: String) {
        let owner_id = self.owner_id;
        let job_id = job_id.clone();
        match *transition {
            Transition::Retired => {
                self.sink.record(JobEvent::Succeeded {
                    owner_id,
                    job_id: job_id.clone(),
                    next_due_at: None,
                });
                self.sink.record(JobEvent::Retired { owner_id, job_id });
            }
            Transition::Rearmed { next_due_at } => self.sink.record(JobEvent::Succeeded {
                owner_id,
                job_id,
                next_due_at: Some(next_due_at),
            }),
            Transition::RetryScheduled {
                attempt,
                next_due_at,
            } => self.sink.record(JobEvent::RetryScheduled {
                owner_id,
                job_id,
                attempt,
                next_due_at,
                error,
            }),
            Transition::Exhausted { attempts } => self.sink.record(JobEvent::Exhausted {
                owner_id,
                job_id,
                attempts,
                error,
            }),
            Transition::OccurrenceAbandoned {
                attempts,
                next_due_at,
            } => self.sink.record(JobEvent::OccurrenceAbandoned {
                owner_id,
                job_id,
                attempts,
                next_due_at,
                error,
            }),
            Transition::Misconfigured => self.sink.record(JobEvent::Misconfigured {
                owner_id,
                job_id,
                job_type: job_type.to_string(),
            }),
            Transition::Released => self.sink.record(JobEvent::Released { owner_id, job_id }),
            Transition::Deferred { next_due_at } => self.sink.record(JobEvent::Deferred {
                owner_id,
                job_id,
                next_due_at,
            }),
            Transition::Missing => {
                warn!(owner = %owner_id, job_id = %job_id, "completion for unknown job");
            }
        }
    }

    /// Spawn the due-job evaluation loop.
    pub(crate) fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(scheduler.run());
        *lock(&self.task) = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(owner = %self.owner_id, pool = %self.pool.id(), tick = ?self.settings.tick, "scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            self.tick();
        }
        info!(owner = %self.owner_id, pool = %self.pool.id(), "scheduler stopped");
    }

    /// Stop the loop and wait for it to exit. Submissions fail afterwards.
    ///
    /// In-flight executions are not awaited here; that is the pool's drain.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(owner = %self.owner_id, error = %e, "scheduler loop ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("owner_id", &self.owner_id)
            .field("pool_id", &self.pool.id())
            .field("jobs", &self.job_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
