use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use cropwatch_core::OwnerId;

use super::{ExecutionClose, ExecutionHistory, ExecutionStatus, JobExecution};
use crate::jobs::{JobId, lock};
use crate::record_store::StoreError;

const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded in-memory history; the oldest records are dropped first.
#[derive(Debug)]
pub struct InMemoryExecutionHistory {
    rows: Mutex<VecDeque<JobExecution>>,
    capacity: usize,
}

impl Default for InMemoryExecutionHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionHistory for InMemoryExecutionHistory {
    async fn open(&self, execution: &JobExecution) -> Result<(), StoreError> {
        let mut rows = lock(&self.rows);
        if rows.len() == self.capacity {
            rows.pop_front();
        }
        rows.push_back(execution.clone());
        Ok(())
    }

    async fn close(
        &self,
        owner_id: OwnerId,
        job_id: &JobId,
        close: &ExecutionClose,
    ) -> Result<bool, StoreError> {
        let mut rows = lock(&self.rows);
        let open = rows.iter_mut().rev().find(|r| {
            r.owner_id == owner_id && &r.job_id == job_id && r.status == ExecutionStatus::Running
        });
        let Some(row) = open else {
            return Ok(false);
        };
        row.status = close.status;
        row.error = close.error.clone();
        row.completed_at = Some(close.completed_at);
        Ok(true)
    }

    async fn recent(&self, owner_id: OwnerId, limit: usize) -> Result<Vec<JobExecution>, StoreError> {
        Ok(lock(&self.rows)
            .iter()
            .rev()
            .filter(|r| r.owner_id == owner_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn running(owner_id: OwnerId, job_id: &str, attempt: u32) -> JobExecution {
        JobExecution {
            id: Uuid::now_v7(),
            owner_id,
            job_id: job_id.into(),
            job_type: "report".to_string(),
            status: ExecutionStatus::Running,
            attempt,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn closing(status: ExecutionStatus) -> ExecutionClose {
        ExecutionClose {
            status,
            error: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn close_updates_only_the_open_record() {
        let history = InMemoryExecutionHistory::new();
        let owner = OwnerId::new();
        history.open(&running(owner, "J1", 1)).await.unwrap();
        assert!(history.close(owner, &"J1".into(), &closing(ExecutionStatus::Retrying)).await.unwrap());
        history.open(&running(owner, "J1", 2)).await.unwrap();
        assert!(history.close(owner, &"J1".into(), &closing(ExecutionStatus::Completed)).await.unwrap());

        assert!(!history.close(owner, &"J1".into(), &closing(ExecutionStatus::Failed)).await.unwrap());
        assert!(!history.close(OwnerId::new(), &"J1".into(), &closing(ExecutionStatus::Failed)).await.unwrap());

        let rows = history.recent(owner, 10).await.unwrap();
        let statuses: Vec<_> = rows.iter().map(|r| (r.attempt, r.status)).collect();
        assert_eq!(
            statuses,
            vec![(2, ExecutionStatus::Completed), (1, ExecutionStatus::Retrying)]
        );
    }

    #[tokio::test]
    async fn recent_is_per_owner_and_limited() {
        let history = InMemoryExecutionHistory::new();
        let a = OwnerId::new();
        let b = OwnerId::new();
        for attempt in 1..=3 {
            history.open(&running(a, "J1", attempt)).await.unwrap();
        }
        history.open(&running(b, "J2", 1)).await.unwrap();

        let rows = history.recent(a, 2).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(history.recent(b, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oldest_records_are_evicted_at_capacity() {
        let history = InMemoryExecutionHistory::with_capacity(2);
        let owner = OwnerId::new();
        for attempt in 1..=3 {
            history.open(&running(owner, "J1", attempt)).await.unwrap();
        }

        assert_eq!(history.len(), 2);
        let rows = history.recent(owner, 10).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![3, 2]);
    }
}
