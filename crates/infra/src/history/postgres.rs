//! Postgres-backed execution history.
//!
//! Expects a `worker_job_execution` table:
//!
//! | column | type |
//! |--------|------|
//! | `id` | `uuid primary key` |
//! | `owner_id` | `uuid` |
//! | `job_id` | `text` |
//! | `job_type` | `text` |
//! | `status` | `text` (`pending`, `running`, `completed`, `retrying`, `failed`) |
//! | `attempt` | `integer` |
//! | `error_message` | `text null` |
//! | `started_at` | `timestamptz` |
//! | `completed_at` | `timestamptz null` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use cropwatch_core::OwnerId;

use super::{ExecutionClose, ExecutionHistory, ExecutionStatus, JobExecution};
use crate::jobs::JobId;
use crate::record_store::StoreError;
use crate::record_store::postgres::map_sqlx_error;

#[derive(Debug, Clone)]
pub struct PostgresExecutionHistory {
    pool: PgPool,
}

impl PostgresExecutionHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn execution_from_row(row: &PgRow) -> Result<JobExecution, StoreError> {
    let get = |e: sqlx::Error| map_sqlx_error("recent_executions", e);
    let status: String = row.try_get("status").map_err(get)?;
    let status = ExecutionStatus::parse(&status)
        .ok_or_else(|| StoreError::backend("recent_executions", format!("unknown status {status:?}")))?;
    let attempt: i32 = row.try_get("attempt").map_err(get)?;
    let job_id: String = row.try_get("job_id").map_err(get)?;

    Ok(JobExecution {
        id: row.try_get("id").map_err(get)?,
        owner_id: OwnerId::from_uuid(row.try_get::<Uuid, _>("owner_id").map_err(get)?),
        job_id: JobId::from(job_id),
        job_type: row.try_get("job_type").map_err(get)?,
        status,
        attempt: u32::try_from(attempt).unwrap_or_default(),
        error: row.try_get("error_message").map_err(get)?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at").map_err(get)?,
        completed_at: row.try_get("completed_at").map_err(get)?,
    })
}

#[async_trait]
impl ExecutionHistory for PostgresExecutionHistory {
    #[instrument(skip(self, execution), fields(job_id = %execution.job_id, attempt = execution.attempt), err)]
    async fn open(&self, execution: &JobExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO worker_job_execution
                (id, owner_id, job_id, job_type, status, attempt, error_message, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.id)
        .bind(execution.owner_id.as_uuid())
        .bind(execution.job_id.as_str())
        .bind(&execution.job_type)
        .bind(execution.status.as_str())
        .bind(i32::try_from(execution.attempt).unwrap_or(i32::MAX))
        .bind(execution.error.as_deref())
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_execution", e))?;
        Ok(())
    }

    #[instrument(skip(self, close), fields(owner = %owner_id, job_id = %job_id, status = %close.status), err)]
    async fn close(
        &self,
        owner_id: OwnerId,
        job_id: &JobId,
        close: &ExecutionClose,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE worker_job_execution
            SET status = $3, error_message = $4, completed_at = $5
            WHERE id = (
                SELECT id FROM worker_job_execution
                WHERE owner_id = $1 AND job_id = $2 AND status = 'running'
                ORDER BY started_at DESC
                LIMIT 1
            )
            "#,
        )
        .bind(owner_id.as_uuid())
        .bind(job_id.as_str())
        .bind(close.status.as_str())
        .bind(close.error.as_deref())
        .bind(close.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("close_execution", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(owner = %owner_id), err)]
    async fn recent(&self, owner_id: OwnerId, limit: usize) -> Result<Vec<JobExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, job_id, job_type, status, attempt, error_message, started_at, completed_at
            FROM worker_job_execution
            WHERE owner_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(owner_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_executions", e))?;

        rows.iter().map(execution_from_row).collect()
    }
}
