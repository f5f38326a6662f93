//! Core job types and policies.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cropwatch_core::{DomainError, DomainResult, OwnerId};

/// Type tag of the satellite imagery fetch job.
pub const FARM_IMAGERY_JOB: &str = "farm-imagery";

/// Retry ceiling used when a submitter does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique job identifier.
///
/// Opaque string so that canonical jobs can carry deterministic, owner-derived
/// ids while ad-hoc jobs get a UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Deterministic id for one of an owner's canonical jobs.
    ///
    /// Resubmitting a canonical job under the same id is detected as a
    /// duplicate, which makes repeated recovery passes a no-op.
    pub fn canonical(owner_id: OwnerId, job_type: &str, slot: &str) -> Self {
        Self(format!("{owner_id}:{job_type}:{slot}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Upper bound of an imagery date window.
///
/// Serialized either as a calendar date (`"2024-05-01"`) or as the literal
/// `"now"`, which resolves to today at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DateBound {
    Date(NaiveDate),
    Now,
}

impl DateBound {
    pub const NOW_TOKEN: &'static str = "now";

    /// Resolve against the execution day.
    pub fn resolve(&self, today: NaiveDate) -> NaiveDate {
        match self {
            DateBound::Date(d) => *d,
            DateBound::Now => today,
        }
    }
}

impl TryFrom<String> for DateBound {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case(Self::NOW_TOKEN) {
            return Ok(DateBound::Now);
        }
        NaiveDate::parse_from_str(&value, "%Y-%m-%d")
            .map(DateBound::Date)
            .map_err(|e| DomainError::validation(format!("invalid date {value:?}: {e}")))
    }
}

impl From<DateBound> for String {
    fn from(value: DateBound) -> Self {
        match value {
            DateBound::Date(d) => d.format("%Y-%m-%d").to_string(),
            DateBound::Now => DateBound::NOW_TOKEN.to_string(),
        }
    }
}

/// Parameters of a `farm-imagery` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageryParams {
    pub farm_id: OwnerId,
    /// Start of the window; `None` means "since the last daily run".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    pub end_date: DateBound,
}

impl ImageryParams {
    /// Fixed historical window, e.g. a one-year backfill.
    pub fn window(farm_id: OwnerId, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            farm_id,
            start_date: Some(start),
            end_date: DateBound::Date(end),
        }
    }

    /// Rolling window ending today.
    pub fn since_last_run(farm_id: OwnerId) -> Self {
        Self {
            farm_id,
            start_date: None,
            end_date: DateBound::Now,
        }
    }

    /// Concrete `(start, end)` for an execution happening on `today`.
    pub fn resolve(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let end = self.end_date.resolve(today);
        let start = self
            .start_date
            .unwrap_or_else(|| end.pred_opt().unwrap_or(end));
        (start, end)
    }
}

/// Typed job parameters, one variant per job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobParams {
    /// Fetch satellite imagery for a farm.
    FarmImagery(ImageryParams),
    /// Any other job type; `kind` is the handler tag.
    Custom {
        kind: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl JobParams {
    pub fn custom(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Custom {
            kind: kind.into(),
            payload,
        }
    }

    /// Tag used to select the handler.
    pub fn type_name(&self) -> &str {
        match self {
            JobParams::FarmImagery(_) => FARM_IMAGERY_JOB,
            JobParams::Custom { kind, .. } => kind,
        }
    }

    /// Structural checks run when a job is submitted for `owner_id`.
    pub fn validate(&self, owner_id: OwnerId) -> DomainResult<()> {
        match self {
            JobParams::FarmImagery(p) => {
                if p.farm_id != owner_id {
                    return Err(DomainError::validation(format!(
                        "farm_id {} does not match owner {}",
                        p.farm_id, owner_id
                    )));
                }
                if let (Some(start), DateBound::Date(end)) = (p.start_date, p.end_date) {
                    if start > end {
                        return Err(DomainError::validation(format!(
                            "start_date {start} is after end_date {end}"
                        )));
                    }
                }
                Ok(())
            }
            JobParams::Custom { kind, .. } => {
                if kind.trim().is_empty() {
                    return Err(DomainError::validation("job kind must not be empty"));
                }
                Ok(())
            }
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Attempt budget and backoff between attempts.
///
/// Drives both the re-arm delay of failed jobs and the retry loop of
/// background notification tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once)
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// No single delay exceeds this
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(30), Duration::from_secs(60 * 60))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, step: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: step,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `attempt` (1-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        delay.min(self.max_delay)
    }

    /// Whether another try is allowed after `attempt` failed retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// An immutable description of one unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub params: JobParams,
    /// Re-attempts allowed after a failure.
    pub max_retries: u32,
    /// Execute once and retire (`true`) or re-arm every period (`false`).
    pub one_time: bool,
    /// Eligible for dispatch immediately on submission.
    pub run_now: bool,
}

impl Job {
    /// A job that runs once and is retired.
    pub fn one_time(params: JobParams) -> Self {
        Self {
            id: JobId::new(),
            params,
            max_retries: DEFAULT_MAX_RETRIES,
            one_time: true,
            run_now: false,
        }
    }

    /// A job re-armed on every scheduler period.
    pub fn recurring(params: JobParams) -> Self {
        Self {
            one_time: false,
            ..Self::one_time(params)
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn run_now(mut self) -> Self {
        self.run_now = true;
        self
    }

    pub fn type_name(&self) -> &str {
        self.params.type_name()
    }
}
