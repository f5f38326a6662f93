//! Startup recovery: rebuild in-memory scheduling state from the farm list.
//!
//! Schedulers are not persisted. After a restart every live farm gets its
//! infrastructure created and started again and its canonical jobs re-submitted.
//! Canonical jobs have owner-derived ids, so re-submission is a no-op when the
//! jobs are already armed.

use std::sync::Arc;

use chrono::{Months, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use cropwatch_core::{OwnerId, PoolId};

use crate::jobs::{
    FARM_IMAGERY_JOB, ImageryParams, Job, JobId, JobParams, ManagerError, SubmitError,
    WorkerManager,
};
use crate::record_store::{FarmStore, StoreError};

/// Retry ceiling of the canonical imagery jobs.
pub const CANONICAL_MAX_RETRIES: u32 = 100;

pub const BACKFILL_SLOT: &str = "backfill";
pub const DAILY_SLOT: &str = "daily";

/// The default job set of a farm:
///
/// - a one-time, immediate backfill of the year up to `today`
/// - a recurring daily fetch of the previous day's imagery
pub fn canonical_imagery_jobs(farm_id: OwnerId, today: NaiveDate) -> [Job; 2] {
    let year_ago = today.checked_sub_months(Months::new(12)).unwrap_or(today);

    let backfill = Job::one_time(JobParams::FarmImagery(ImageryParams::window(
        farm_id, year_ago, today,
    )))
    .with_id(JobId::canonical(farm_id, FARM_IMAGERY_JOB, BACKFILL_SLOT))
    .with_max_retries(CANONICAL_MAX_RETRIES)
    .run_now();

    let daily = Job::recurring(JobParams::FarmImagery(ImageryParams::since_last_run(farm_id)))
        .with_id(JobId::canonical(farm_id, FARM_IMAGERY_JOB, DAILY_SLOT))
        .with_max_retries(CANONICAL_MAX_RETRIES);

    [backfill, daily]
}

/// Result of bootstrapping one farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bootstrap {
    pub pool_id: PoolId,
    pub submitted: usize,
    /// Canonical jobs that were already armed.
    pub skipped: usize,
}

/// Create and start a farm's infrastructure, then submit its canonical jobs.
///
/// Used for newly created farms and by recovery. Safe to repeat: running
/// infrastructure is reused and armed canonical jobs are skipped. A stopped
/// pool and every other error are returned to the caller, which must retry or
/// flag the farm for repair.
pub fn bootstrap_farm(
    manager: &WorkerManager,
    farm_id: OwnerId,
    today: NaiveDate,
) -> Result<Bootstrap, ManagerError> {
    let pool_id = manager.create_infrastructure(farm_id)?;
    match manager.start_infrastructure(pool_id) {
        Ok(()) => {}
        Err(ManagerError::AlreadyStarted(_)) => {
            debug!(farm_id = %farm_id, pool = %pool_id, "farm infrastructure already running");
        }
        Err(e) => return Err(e),
    }

    let mut result = Bootstrap {
        pool_id,
        submitted: 0,
        skipped: 0,
    };
    for job in canonical_imagery_jobs(farm_id, today) {
        match manager.submit_job(farm_id, job) {
            Ok(_) => result.submitted += 1,
            Err(ManagerError::Submit(SubmitError::DuplicateJob(id))) => {
                info!(farm_id = %farm_id, job_id = %id, "canonical job already scheduled");
                result.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(result)
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("failed to list farms: {0}")]
    ListFarms(#[from] StoreError),
}

/// Aggregate outcome of one recovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<(OwnerId, String)>,
}

impl RecoveryReport {
    pub fn fail_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Restores scheduling for every live farm.
pub struct RecoveryDriver {
    manager: Arc<WorkerManager>,
    store: Arc<dyn FarmStore>,
}

impl RecoveryDriver {
    pub fn new(manager: Arc<WorkerManager>, store: Arc<dyn FarmStore>) -> Self {
        Self { manager, store }
    }

    pub async fn run(&self) -> Result<RecoveryReport, RecoveryError> {
        self.run_at(Utc::now().date_naive()).await
    }

    /// One pass with `today` as the backfill end. A failing farm never aborts the pass.
    pub async fn run_at(&self, today: NaiveDate) -> Result<RecoveryReport, RecoveryError> {
        let farms = self.store.list_farm_ids().await?;
        info!(farm_count = farms.len(), "starting farm job recovery");

        let mut report = RecoveryReport {
            total: farms.len(),
            ..RecoveryReport::default()
        };
        for farm_id in farms {
            match bootstrap_farm(&self.manager, farm_id, today) {
                Ok(b) => {
                    info!(
                        farm_id = %farm_id,
                        pool = %b.pool_id,
                        submitted = b.submitted,
                        skipped = b.skipped,
                        "farm recovered"
                    );
                    report.succeeded += 1;
                }
                Err(e) => {
                    error!(farm_id = %farm_id, error = %e, "farm recovery failed");
                    report.failed.push((farm_id, e.to_string()));
                }
            }
        }

        if report.is_clean() {
            info!(total = report.total, succeeded = report.succeeded, "farm job recovery complete");
        } else {
            warn!(
                total = report.total,
                succeeded = report.succeeded,
                fail_count = report.fail_count(),
                "farm job recovery completed with failures"
            );
        }
        Ok(report)
    }
}
