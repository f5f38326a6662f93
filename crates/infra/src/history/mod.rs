//! Job execution history.
//!
//! One record per dispatched attempt. A record is opened as `running` when the
//! scheduler hands the job to its pool and closed once the outcome is known.
//! Scheduling state itself is never read back from here; recovery rebuilds it
//! from the farm list.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use cropwatch_core::OwnerId;

use crate::jobs::{JobEvent, JobEventSink, JobId, lock};
use crate::record_store::StoreError;

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryExecutionHistory;
#[cfg(feature = "postgres")]
pub use postgres::PostgresExecutionHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Did not run (pool stopping or quota spent); the job is queued again.
    Pending,
    Running,
    Completed,
    /// Failed with retries left.
    Retrying,
    /// Failed for good, or the occurrence was abandoned.
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Retrying => "retrying",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "retrying" => Some(ExecutionStatus::Retrying),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub job_type: String,
    pub status: ExecutionStatus,
    /// 1-based attempt within the job's current occurrence.
    pub attempt: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// How an open execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionClose {
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Storage for execution records.
#[async_trait]
pub trait ExecutionHistory: Send + Sync + 'static {
    async fn open(&self, execution: &JobExecution) -> Result<(), StoreError>;

    /// Close the latest `running` record of `job_id`. Returns `false` if none is open.
    async fn close(
        &self,
        owner_id: OwnerId,
        job_id: &JobId,
        close: &ExecutionClose,
    ) -> Result<bool, StoreError>;

    /// Most recent executions of an owner, newest first.
    async fn recent(&self, owner_id: OwnerId, limit: usize) -> Result<Vec<JobExecution>, StoreError>;
}

/// Writes every job event into an [`ExecutionHistory`] and forwards it to an inner sink.
///
/// Events are queued to a single writer task, so the record opened by a
/// dispatch is always written before the close that follows it.
pub struct HistoryJobEventSink {
    inner: Arc<dyn JobEventSink>,
    tx: Mutex<Option<mpsc::UnboundedSender<(JobEvent, DateTime<Utc>)>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryJobEventSink {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(inner: Arc<dyn JobEventSink>, history: Arc<dyn ExecutionHistory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_history(history, rx));
        Self {
            inner,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Stop accepting events and wait until every queued one is written.
    pub async fn close(&self) {
        drop(lock(&self.tx).take());
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "execution history writer ended abnormally");
            }
        }
    }
}

impl JobEventSink for HistoryJobEventSink {
    fn record(&self, event: JobEvent) {
        let at = Utc::now();
        match lock(&self.tx).as_ref() {
            Some(tx) => {
                if tx.send((event.clone(), at)).is_err() {
                    warn!(job_id = %event.job_id(), "execution history writer is gone, event not recorded");
                }
            }
            None => debug!(job_id = %event.job_id(), "execution history closed, event not recorded"),
        }
        self.inner.record(event);
    }
}

impl std::fmt::Debug for HistoryJobEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryJobEventSink")
            .field("open", &lock(&self.tx).is_some())
            .finish_non_exhaustive()
    }
}

async fn write_history(
    history: Arc<dyn ExecutionHistory>,
    mut rx: mpsc::UnboundedReceiver<(JobEvent, DateTime<Utc>)>,
) {
    while let Some((event, at)) = rx.recv().await {
        let job_id = event.job_id().clone();
        if let Err(e) = apply(history.as_ref(), event, at).await {
            warn!(job_id = %job_id, error = %e, "failed to record job execution");
        }
    }
}

async fn apply(history: &dyn ExecutionHistory, event: JobEvent, at: DateTime<Utc>) -> Result<(), StoreError> {
    let (owner_id, job_id, status, error) = match event {
        JobEvent::Dispatched {
            owner_id,
            job_id,
            job_type,
            attempt,
        } => {
            let execution = JobExecution {
                id: Uuid::now_v7(),
                owner_id,
                job_id,
                job_type,
                status: ExecutionStatus::Running,
                attempt,
                error: None,
                started_at: at,
                completed_at: None,
            };
            return history.open(&execution).await;
        }
        JobEvent::Retired { .. } => return Ok(()),
        JobEvent::Succeeded { owner_id, job_id, .. } => (owner_id, job_id, ExecutionStatus::Completed, None),
        JobEvent::RetryScheduled {
            owner_id,
            job_id,
            error,
            ..
        } => (owner_id, job_id, ExecutionStatus::Retrying, Some(error)),
        JobEvent::Exhausted {
            owner_id,
            job_id,
            error,
            ..
        }
        | JobEvent::OccurrenceAbandoned {
            owner_id,
            job_id,
            error,
            ..
        } => (owner_id, job_id, ExecutionStatus::Failed, Some(error)),
        JobEvent::Misconfigured {
            owner_id,
            job_id,
            job_type,
        } => (
            owner_id,
            job_id,
            ExecutionStatus::Failed,
            Some(format!("no handler registered for job type {job_type:?}")),
        ),
        JobEvent::Released { owner_id, job_id } => (owner_id, job_id, ExecutionStatus::Pending, None),
        JobEvent::Deferred {
            owner_id,
            job_id,
            next_due_at,
        } => (
            owner_id,
            job_id,
            ExecutionStatus::Pending,
            Some(format!("daily quota reached, next run at {next_due_at}")),
        ),
    };

    let close = ExecutionClose {
        status,
        error,
        completed_at: at,
    };
    if !history.close(owner_id, &job_id, &close).await? {
        debug!(owner = %owner_id, job_id = %job_id, status = %close.status, "no open execution to close");
    }
    Ok(())
}
