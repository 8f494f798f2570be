//! Retry scheduler: the job state machine.
//!
//! ```text
//! queued -> processing -> succeeded
//!                      -> retry_scheduled -> queued (promotion) -> processing ...
//!                      -> dead_lettered
//!                      -> failed            (FailImmediately + all-permanent pass)
//! ```
//!
//! [`RetryPolicy::decide`] is pure: given the job, the pass result and `now`
//! it returns a [`Transition`]; persisting it is the worker's job.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

use crate::clock::add_duration;
use crate::models::{FanOutResult, JobFailure, JobStatus, NotificationJob};

/// How a pass whose failures are all permanent is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PermanentFailurePolicy {
    /// Permanent failures consume the shared retry budget like transient ones.
    #[default]
    CountAgainstBudget,
    /// A pass with only permanent failures ends the job as `failed` without retry.
    FailImmediately,
}

impl FromStr for PermanentFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" | "count_against_budget" => Ok(Self::CountAgainstBudget),
            "fail" | "fail_immediately" => Ok(Self::FailImmediately),
            other => Err(format!(
                "unknown permanent failure policy '{other}' (expected 'count' or 'fail')"
            )),
        }
    }
}

/// Outcome of the state machine for one pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Succeed {
        attempt: u32,
    },
    Retry {
        attempt: u32,
        delay: Duration,
        next_run_at: DateTime<Utc>,
        failure: JobFailure,
    },
    DeadLetter {
        attempt: u32,
        failure: JobFailure,
    },
    Fail {
        attempt: u32,
        failure: JobFailure,
    },
}

impl Transition {
    pub fn status(&self) -> JobStatus {
        match self {
            Transition::Succeed { .. } => JobStatus::Succeeded,
            Transition::Retry { .. } => JobStatus::RetryScheduled,
            Transition::DeadLetter { .. } => JobStatus::DeadLettered,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            Transition::Succeed { attempt }
            | Transition::Retry { attempt, .. }
            | Transition::DeadLetter { attempt, .. }
            | Transition::Fail { attempt, .. } => *attempt,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            Transition::Succeed { .. } => None,
            Transition::Retry { failure, .. }
            | Transition::DeadLetter { failure, .. }
            | Transition::Fail { failure, .. } => Some(failure),
        }
    }

    /// Write the transition into a job record.
    pub fn apply(&self, job: &mut NotificationJob, now: DateTime<Utc>) {
        job.attempt = self.attempt();
        job.status = self.status();
        job.updated_at = now;

        match self {
            Transition::Succeed { .. } => {
                job.next_run_at = None;
                job.last_error = None;
            }
            Transition::Retry {
                next_run_at,
                failure,
                ..
            } => {
                job.next_run_at = Some(*next_run_at);
                job.last_error = Some(failure.clone());
            }
            Transition::DeadLetter { failure, .. } | Transition::Fail { failure, .. } => {
                job.next_run_at = None;
                job.last_error = Some(failure.clone());
            }
        }
    }
}

/// Backoff and budget rules shared by every worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Optional ceiling on a single backoff delay.
    pub max_delay: Option<Duration>,
    pub permanent_failures: PermanentFailurePolicy,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_permanent_failures(mut self, policy: PermanentFailurePolicy) -> Self {
        self.permanent_failures = policy;
        self
    }

    /// `base * 2^(attempt - 1)`: attempt 1 waits `base`, attempt 2 `2 * base`, ...
    ///
    /// Saturates instead of overflowing; attempt 0 is treated as attempt 1.
    pub fn backoff_delay(&self, base: Duration, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u64.saturating_pow(exponent);
        let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Decide the next state from a completed fan-out pass.
    pub fn decide(
        &self,
        job: &NotificationJob,
        result: &FanOutResult,
        now: DateTime<Utc>,
    ) -> Transition {
        let attempt = job.attempt.saturating_add(1);
        if result.all_succeeded {
            return Transition::Succeed { attempt };
        }
        self.decide_failure(job, result.to_failure(attempt, now), now)
    }

    /// Decide the next state of a failed pass. `failure.attempt` is the attempt
    /// being charged.
    pub fn decide_failure(
        &self,
        job: &NotificationJob,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Transition {
        let attempt = job.attempt.saturating_add(1);

        if self.permanent_failures == PermanentFailurePolicy::FailImmediately
            && failure.all_permanent()
        {
            return Transition::Fail { attempt, failure };
        }

        if attempt > job.max_retries {
            return Transition::DeadLetter { attempt, failure };
        }

        let delay = self.backoff_delay(job.base_delay(), attempt);
        Transition::Retry {
            attempt,
            delay,
            next_run_at: add_duration(now, delay),
            failure,
        }
    }
}
