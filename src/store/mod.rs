//! Task store: the single source of truth for task records.
//!
//! Every lifecycle transition is a single atomic operation on the store:
//! claiming, completion, failure disposition, orphan reclaim and the boost
//! sweep. No caller ever reads task state and writes it back in a second
//! step; that discipline, not application-level locking, is what enforces
//! the at-most-one-owner invariant under contention.
//!
//! The [`TaskStore`] trait is the seam for swapping implementations: the
//! in-memory store here serves single-node deployments and tests, while a
//! durable implementation (a database with non-blocking row claims, for
//! instance) can be substituted behind the same contract.

pub mod memory;
pub mod task;

// Re-export main types for convenience
pub use memory::InMemoryTaskStore;
pub use task::{
    DeadLetter, EnqueueRequest, Task, TaskState, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::config::BoostConfig;
use crate::retry::{ErrorClass, TaskFailure};

/// Errors that can occur during store operations.
///
/// `Unavailable` is infrastructure trouble: callers must back off and retry
/// the store call itself, separately from any task-level retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot currently serve requests.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// No active or dead-lettered record exists for the id.
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),
}

/// Result of a `complete` report.
///
/// A `Conflict` is expected under races (the caller lost ownership to the
/// reaper or a subsequent claim) and is a signal, not an error: the report
/// was rejected and task state is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The report was applied.
    Ok,
    /// The caller no longer owns the task; nothing was changed.
    Conflict,
}

impl ReportOutcome {
    /// Returns whether the report was rejected for lost ownership.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReportOutcome::Conflict)
    }
}

/// Result of a `fail` report, carrying the applied disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task returned to the claimable set, eligible at `not_before`.
    Retried { not_before: chrono::DateTime<chrono::Utc> },
    /// The task moved to the dead-letter set.
    DeadLettered,
    /// The caller no longer owns the task; nothing was changed.
    Conflict,
}

impl FailureOutcome {
    /// Returns whether the report was rejected for lost ownership.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FailureOutcome::Conflict)
    }
}

/// Parameters of one claim call.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Worker taking ownership.
    pub worker_id: String,
    /// Restrict claims to these kinds; `None` claims any kind.
    pub capabilities: Option<Vec<String>>,
    /// Upper bound on tasks granted by this call.
    pub batch_size: usize,
    /// Ownership lease; the store sets `claim_deadline = now + lease`.
    pub lease_duration: Duration,
}

/// Filter for dead-letter inspection.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    /// Only dead letters of this kind.
    pub kind: Option<String>,
    /// Only dead letters with this final error class.
    pub class: Option<ErrorClass>,
    /// Upper bound on returned records; 0 means no bound.
    pub limit: usize,
}

impl DeadLetterFilter {
    /// Matches everything, unbounded.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts to one task kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Restricts to one error class.
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Bounds the number of returned records.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Task counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    /// Tasks eligible (now or later) for claiming.
    pub claimable: usize,
    /// Tasks currently held by a worker.
    pub owned: usize,
    /// Tasks completed successfully.
    pub completed: usize,
    /// Tasks in the dead-letter set.
    pub dead_lettered: usize,
}

impl StoreCounts {
    /// Total records tracked, terminal states included.
    pub fn total(&self) -> usize {
        self.claimable + self.owned + self.completed + self.dead_lettered
    }
}

/// Durable record of tasks and their states.
///
/// Implementations must make each method a single atomic operation: under
/// N concurrent claimers every claimable task is granted to at most one of
/// them, and a contended caller skips to the next eligible task rather
/// than waiting.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new Claimable task and returns its id.
    async fn insert(&self, request: EnqueueRequest) -> Result<Uuid, StoreError>;

    /// Inserts several tasks in one call.
    async fn insert_batch(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<Uuid>, StoreError>;

    /// Claims up to `batch_size` eligible tasks for a worker, ordered by
    /// priority (descending) then `not_before` (ascending). Returns the
    /// tasks now Owned; an empty result is not an error.
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<Task>, StoreError>;

    /// Reports successful completion. Rejected with `Conflict` if the
    /// caller no longer owns the task.
    async fn complete(&self, task_id: Uuid, worker_id: &str) -> Result<ReportOutcome, StoreError>;

    /// Reports a classified failure. Counts the attempt, then either
    /// requeues with the controller's delay or dead-letters. Rejected with
    /// `Conflict` if the caller no longer owns the task.
    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        failure: TaskFailure,
    ) -> Result<FailureOutcome, StoreError>;

    /// Age-based priority boost sweep over Claimable tasks. Idempotent
    /// within one age-threshold window and safe to run concurrently with
    /// claims. Returns the number of boosted tasks.
    async fn boost_priorities(&self, config: &BoostConfig) -> Result<usize, StoreError>;

    /// Returns every task Owned by `worker_id` to Claimable, leaving
    /// `attempt_count` unchanged. Used by the reaper after a worker's
    /// lease expires. Returns the number of reclaimed tasks.
    async fn reclaim_owned_by(&self, worker_id: &str) -> Result<usize, StoreError>;

    /// Returns every Owned task whose `claim_deadline` has passed to
    /// Claimable, regardless of owner liveness. Returns the number of
    /// released tasks.
    async fn release_expired_claims(&self) -> Result<usize, StoreError>;

    /// Fetches an active (non-dead-lettered) task by id.
    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Inspects the dead-letter set, newest first.
    async fn dead_letters(&self, filter: &DeadLetterFilter)
        -> Result<Vec<DeadLetter>, StoreError>;

    /// Re-enqueues a dead-lettered task as a fresh task with the original
    /// kind and payload, removing the dead-letter record. Returns the new
    /// task's id.
    async fn replay_dead_letter(&self, task_id: Uuid) -> Result<Uuid, StoreError>;

    /// Task counts by state.
    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}
