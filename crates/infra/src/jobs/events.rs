//! Job outcome events and the sinks that consume them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cropwatch_core::OwnerId;

use super::lock;
use super::types::{JobId, RetryPolicy};
use crate::notify::{Notifier, RetryOutcome, spawn_bounded_retry};

/// Something that happened to a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Dispatched {
        owner_id: OwnerId,
        job_id: JobId,
        job_type: String,
        attempt: u32,
    },
    /// `next_due_at` is `None` when a one-time job was retired.
    Succeeded {
        owner_id: OwnerId,
        job_id: JobId,
        next_due_at: Option<DateTime<Utc>>,
    },
    RetryScheduled {
        owner_id: OwnerId,
        job_id: JobId,
        attempt: u32,
        next_due_at: DateTime<Utc>,
        error: String,
    },
    /// A one-time job finished successfully and left the scheduler.
    Retired {
        owner_id: OwnerId,
        job_id: JobId,
    },
    /// A one-time job failed `max_retries + 1` times and was dropped.
    Exhausted {
        owner_id: OwnerId,
        job_id: JobId,
        attempts: u32,
        error: String,
    },
    /// A recurring job gave up on this occurrence and was re-armed.
    OccurrenceAbandoned {
        owner_id: OwnerId,
        job_id: JobId,
        attempts: u32,
        next_due_at: DateTime<Utc>,
        error: String,
    },
    /// No handler is registered for the job's type; the job was dropped.
    Misconfigured {
        owner_id: OwnerId,
        job_id: JobId,
        job_type: String,
    },
    /// The pool stopped before the job ran; it stays armed.
    Released {
        owner_id: OwnerId,
        job_id: JobId,
    },
    /// The pool's daily quota was spent; the job waits for the reset.
    Deferred {
        owner_id: OwnerId,
        job_id: JobId,
        next_due_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn owner_id(&self) -> OwnerId {
        match self {
            JobEvent::Dispatched { owner_id, .. }
            | JobEvent::Succeeded { owner_id, .. }
            | JobEvent::RetryScheduled { owner_id, .. }
            | JobEvent::Retired { owner_id, .. }
            | JobEvent::Exhausted { owner_id, .. }
            | JobEvent::OccurrenceAbandoned { owner_id, .. }
            | JobEvent::Misconfigured { owner_id, .. }
            | JobEvent::Released { owner_id, .. }
            | JobEvent::Deferred { owner_id, .. } => *owner_id,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Dispatched { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Retired { job_id, .. }
            | JobEvent::Exhausted { job_id, .. }
            | JobEvent::OccurrenceAbandoned { job_id, .. }
            | JobEvent::Misconfigured { job_id, .. }
            | JobEvent::Released { job_id, .. }
            | JobEvent::Deferred { job_id, .. } => job_id,
        }
    }

    /// Failures that a human should hear about.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            JobEvent::Exhausted { .. }
                | JobEvent::OccurrenceAbandoned { .. }
                | JobEvent::Misconfigured { .. }
        )
    }
}

/// Consumer of job events. Called from scheduler tasks; must not block.
pub trait JobEventSink: Send + Sync + 'static {
    fn record(&self, event: JobEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobEventSink;

impl JobEventSink for TracingJobEventSink {
    fn record(&self, event: JobEvent) {
        match &event {
            JobEvent::Dispatched {
                owner_id,
                job_id,
                job_type,
                attempt,
            } => {
                debug!(owner = %owner_id, job_id = %job_id, job_type = %job_type, attempt, "job dispatched");
            }
            JobEvent::Succeeded {
                owner_id,
                job_id,
                next_due_at,
            } => {
                info!(owner = %owner_id, job_id = %job_id, next_due_at = ?next_due_at, "job succeeded");
            }
            JobEvent::RetryScheduled {
                owner_id,
                job_id,
                attempt,
                next_due_at,
                error,
            } => {
                warn!(
                    owner = %owner_id,
                    job_id = %job_id,
                    attempt,
                    next_due_at = %next_due_at,
                    error = %error,
                    "job failed, retry scheduled"
                );
            }
            JobEvent::Retired { owner_id, job_id } => {
                info!(owner = %owner_id, job_id = %job_id, "one-time job retired");
            }
            JobEvent::Exhausted {
                owner_id,
                job_id,
                attempts,
                error,
            } => {
                error!(
                    owner = %owner_id,
                    job_id = %job_id,
                    attempts,
                    error = %error,
                    "job exhausted its retry budget"
                );
            }
            JobEvent::OccurrenceAbandoned {
                owner_id,
                job_id,
                attempts,
                next_due_at,
                error,
            } => {
                error!(
                    owner = %owner_id,
                    job_id = %job_id,
                    attempts,
                    next_due_at = %next_due_at,
                    error = %error,
                    "recurring job abandoned this occurrence"
                );
            }
            JobEvent::Misconfigured {
                owner_id,
                job_id,
                job_type,
            } => {
                error!(owner = %owner_id, job_id = %job_id, job_type = %job_type, "job dropped: no handler");
            }
            JobEvent::Released { owner_id, job_id } => {
                debug!(owner = %owner_id, job_id = %job_id, "job released, pool stopping");
            }
            JobEvent::Deferred {
                owner_id,
                job_id,
                next_due_at,
            } => {
                warn!(owner = %owner_id, job_id = %job_id, next_due_at = %next_due_at, "job deferred by daily quota");
            }
        }
    }
}

/// Records events in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryJobEventSink {
    events: Mutex<Vec<JobEvent>>,
    changed: Notify,
}

impl InMemoryJobEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        lock(&self.events).clone()
    }

    pub fn events_for(&self, job_id: &JobId) -> Vec<JobEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.job_id() == job_id)
            .cloned()
            .collect()
    }

    /// Wait until `condition` holds over the recorded events, or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&[JobEvent]) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let done = {
                    let events = lock(&self.events);
                    condition(&events)
                };
                if done {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl JobEventSink for InMemoryJobEventSink {
    fn record(&self, event: JobEvent) {
        lock(&self.events).push(event);
        self.changed.notify_waiters();
    }
}

/// Forwards every event to an inner sink and notifies the owner of terminal failures.
///
/// Each notification runs as a bounded-retry background task; a messaging outage
/// ends in a logged give-up instead of a task that retries forever.
pub struct NotifyingJobEventSink {
    inner: Arc<dyn JobEventSink>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    pending: Mutex<Vec<JoinHandle<RetryOutcome>>>,
}

impl NotifyingJobEventSink {
    pub fn new(inner: Arc<dyn JobEventSink>, notifier: Arc<dyn Notifier>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            notifier,
            policy,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Await the notifications that were still running at their last check.
    pub async fn flush(&self) -> Vec<RetryOutcome> {
        let handles: Vec<_> = lock(&self.pending).drain(..).collect();
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "notification task did not complete"),
            }
        }
        outcomes
    }

    fn message(event: &JobEvent) -> Option<String> {
        match event {
            JobEvent::Exhausted {
                job_id,
                attempts,
                error,
                ..
            } => Some(format!("job {job_id} failed after {attempts} attempts: {error}")),
            JobEvent::OccurrenceAbandoned {
                job_id,
                attempts,
                next_due_at,
                error,
                ..
            } => Some(format!(
                "job {job_id} skipped this run after {attempts} attempts ({error}); next run at {next_due_at}"
            )),
            JobEvent::Misconfigured { job_id, job_type, .. } => {
                Some(format!("job {job_id} has no handler for type {job_type}"))
            }
            _ => None,
        }
    }
}

impl JobEventSink for NotifyingJobEventSink {
    fn record(&self, event: JobEvent) {
        let message = Self::message(&event);
        let owner_id = event.owner_id();
        self.inner.record(event);

        let Some(message) = message else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(owner = %owner_id, "no async runtime, dropping job notification");
            return;
        }

        let notifier = self.notifier.clone();
        let handle = spawn_bounded_retry(
            format!("job-notification:{owner_id}"),
            self.policy.clone(),
            move || {
                let notifier = notifier.clone();
                let message = message.clone();
                async move { notifier.notify(owner_id, &message).await }
            },
        );
        let mut pending = lock(&self.pending);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}

impl std::fmt::Debug for NotifyingJobEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyingJobEventSink")
            .field("policy", &self.policy)
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}
