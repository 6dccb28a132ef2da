//! Failure disposition: requeue with backoff, or dead-letter.
//!
//! The controller is pure decision logic. It never touches task records
//! itself; the store calls [`RetryController::dispose`] inside its own
//! atomic failure transition and applies the returned [`Disposition`]
//! under the same lock, so classification, attempt accounting and the
//! state change cannot be torn apart by a concurrent reaper or claimer.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::backoff::BackoffPolicy;
use super::classifier::ErrorClass;
use crate::clock::chrono_duration;

/// Default retry ceiling for failures classified [`ErrorClass::Unknown`].
pub const DEFAULT_UNKNOWN_RETRY_BUDGET: u32 = 2;

/// A classified failure reported against an owned task.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Human-readable error text, kept as the task's `last_error` and in
    /// the dead-letter record.
    pub error: String,
    /// Classification decided by the caller (explicit hint or rule table).
    pub class: ErrorClass,
    /// Throttle hint from the failing dependency; only honored for
    /// [`ErrorClass::RateLimited`].
    pub retry_after: Option<Duration>,
}

impl TaskFailure {
    /// Creates a failure with the given class and no retry-after hint.
    pub fn new(error: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            error: error.into(),
            class,
            retry_after: None,
        }
    }

    /// Attaches a retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// What the store should do with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return the task to the claimable set, eligible again at `not_before`.
    Retry { not_before: DateTime<Utc> },
    /// Terminal: move the task to the dead-letter set.
    DeadLetter,
}

/// Decides between retry and dead-letter for classified failures.
#[derive(Debug, Clone)]
pub struct RetryController {
    backoff: BackoffPolicy,
    unknown_retry_budget: u32,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), DEFAULT_UNKNOWN_RETRY_BUDGET)
    }
}

impl RetryController {
    /// Creates a controller with the given backoff policy and Unknown-class
    /// retry budget.
    pub fn new(backoff: BackoffPolicy, unknown_retry_budget: u32) -> Self {
        Self {
            backoff,
            unknown_retry_budget,
        }
    }

    /// The backoff policy in use.
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Decides the next state for a task whose failure has just been
    /// counted.
    ///
    /// `attempt_count` is the value *after* the failed attempt was added,
    /// so a task with `max_attempts = 3` dead-letters when its third
    /// failure is reported.
    pub fn dispose(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        failure: &TaskFailure,
        now: DateTime<Utc>,
    ) -> Disposition {
        let ceiling = match failure.class {
            ErrorClass::Permanent => return Disposition::DeadLetter,
            ErrorClass::Unknown => max_attempts.min(self.unknown_retry_budget),
            ErrorClass::Transient | ErrorClass::RateLimited => max_attempts,
        };

        if attempt_count >= ceiling {
            return Disposition::DeadLetter;
        }

        let delay = match (failure.class, failure.retry_after) {
            (ErrorClass::RateLimited, Some(hint)) => hint.min(self.backoff.max_delay),
            _ => self.backoff.jittered_delay_for(attempt_count),
        };

        Disposition::Retry {
            not_before: now + chrono_duration(delay),
        }
    }
}
