//! Per-owner job set: due-job selection and retry bookkeeping.
//!
//! Everything here is a pure function of the `now` it is given, so the state
//! machine (`Armed -> InFlight -> Armed | Retired`) can be exercised without a
//! runtime. The scheduler wraps a `JobSet` in a mutex and feeds it wall-clock time.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{Job, JobId, JobParams, RetryPolicy};

/// A queued job plus its mutable scheduling state.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    job: Job,
    next_due_at: DateTime<Utc>,
    attempts: u32,
    in_flight: bool,
}

impl ScheduledJob {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn next_due_at(&self) -> DateTime<Utc> {
        self.next_due_at
    }

    /// Failed attempts in the current occurrence.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.in_flight && self.next_due_at <= now
    }
}

/// A job selected for execution.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: JobId,
    pub params: JobParams,
    /// 1-based attempt number within the current occurrence.
    pub attempt: u32,
}

/// How one execution ended, from the scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transient failure; counts against the retry budget.
    Failure,
    /// No handler for the job type; retired without retry.
    Misconfigured,
    /// Never ran (pool stopped); no attempt consumed.
    Released,
    /// Never ran (daily quota spent); held until `until`, no attempt consumed.
    Deferred { until: DateTime<Utc> },
}

/// Resulting state change after a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// One-time job succeeded and was removed.
    Retired,
    /// Recurring job succeeded and is armed for the next period.
    Rearmed { next_due_at: DateTime<Utc> },
    /// Failure within budget; armed again after backoff.
    RetryScheduled { attempt: u32, next_due_at: DateTime<Utc> },
    /// One-time job ran out of retries and was removed.
    Exhausted { attempts: u32 },
    /// Recurring job ran out of retries for this occurrence; armed for the next period.
    OccurrenceAbandoned { attempts: u32, next_due_at: DateTime<Utc> },
    /// Removed because its type has no handler.
    Misconfigured,
    /// In-flight mark cleared without consuming an attempt.
    Released,
    /// Held back without consuming an attempt.
    Deferred { next_due_at: DateTime<Utc> },
    /// The job was no longer in the set.
    Missing,
}

/// Adds a std duration to a timestamp, saturating far in the future.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(5200));
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The armed jobs of one owner, keyed by job id.
#[derive(Debug, Default)]
pub struct JobSet {
    jobs: HashMap<JobId, ScheduledJob>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &JobId) -> Option<&ScheduledJob> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledJob> {
        self.jobs.values()
    }

    /// Arm a new job. Returns its first due time, or `None` if the id is taken.
    ///
    /// `run_now` jobs are due immediately; all others one `period` from now.
    pub fn insert(&mut self, job: Job, now: DateTime<Utc>, period: Duration) -> Option<DateTime<Utc>> {
        if self.jobs.contains_key(&job.id) {
            return None;
        }
        let next_due_at = if job.run_now { now } else { after(now, period) };
        self.jobs.insert(
            job.id.clone(),
            ScheduledJob {
                job,
                next_due_at,
                attempts: 0,
                in_flight: false,
            },
        );
        Some(next_due_at)
    }

    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        self.jobs.remove(id).map(|s| s.job)
    }

    /// Mark every due job in-flight and return them, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let mut due: Vec<&mut ScheduledJob> =
            self.jobs.values_mut().filter(|s| s.is_due(now)).collect();
        due.sort_by(|a, b| a.next_due_at.cmp(&b.next_due_at).then_with(|| a.job.id.cmp(&b.job.id)));

        due.into_iter()
            .map(|s| {
                s.in_flight = true;
                Dispatch {
                    job_id: s.job.id.clone(),
                    params: s.job.params.clone(),
                    attempt: s.attempts + 1,
                }
            })
            .collect()
    }

    /// Earliest due time among jobs that are not in flight.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|s| !s.in_flight)
            .map(|s| s.next_due_at)
            .min()
    }

    /// Apply the result of one execution.
    pub fn complete(
        &mut self,
        id: &JobId,
        outcome: Outcome,
        now: DateTime<Utc>,
        period: Duration,
        backoff: &RetryPolicy,
    ) -> Transition {
        let Some(entry) = self.jobs.get_mut(id) else {
            return Transition::Missing;
        };
        entry.in_flight = false;

        match outcome {
            Outcome::Released => Transition::Released,
            Outcome::Deferred { until } => {
                entry.next_due_at = until.max(now);
                Transition::Deferred {
                    next_due_at: entry.next_due_at,
                }
            }
            Outcome::Misconfigured => {
                self.jobs.remove(id);
                Transition::Misconfigured
            }
            Outcome::Success if entry.job.one_time => {
                self.jobs.remove(id);
                Transition::Retired
            }
            Outcome::Success => {
                entry.attempts = 0;
                entry.next_due_at = after(now, period);
                Transition::Rearmed {
                    next_due_at: entry.next_due_at,
                }
            }
            Outcome::Failure => {
                entry.attempts += 1;
                let attempts = entry.attempts;

                if attempts <= entry.job.max_retries {
                    entry.next_due_at = after(now, backoff.delay_for_attempt(attempts));
                    Transition::RetryScheduled {
                        attempt: attempts,
                        next_due_at: entry.next_due_at,
                    }
                } else if entry.job.one_time {
                    self.jobs.remove(id);
                    Transition::Exhausted { attempts }
                } else {
                    entry.attempts = 0;
                    entry.next_due_at = after(now, period);
                    Transition::OccurrenceAbandoned {
                        attempts,
                        next_due_at: entry.next_due_at,
                    }
                }
            }
        }
    }
}
