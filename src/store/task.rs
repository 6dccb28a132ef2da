//! Task records and the lifecycle state machine.
//!
//! This module defines the core record types held by the task store:
//!
//! - `Task`: a unit of work with its lifecycle state and attempt accounting
//! - `TaskState`: the four-state lifecycle machine
//! - `EnqueueRequest`: what producers hand to the engine
//! - `DeadLetter`: the enriched terminal record for unretryable tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::ErrorClass;

/// Default maximum number of attempts before a task dead-letters.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for tasks (0 is normal priority).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Lifecycle state of a task.
///
/// State transitions:
/// - Claimable -> Owned (claim; exactly one winner under contention)
/// - Owned -> Completed (owner reports success)
/// - Owned -> Claimable (owner reports a retryable failure, or the reaper
///   reclaims an orphaned claim)
/// - Owned -> DeadLettered (permanent failure or attempts exhausted)
///
/// `Completed` and `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Eligible for a worker to take ownership.
    Claimable,
    /// Held exclusively by one worker, pending a completion or failure
    /// report.
    Owned,
    /// Successfully completed.
    Completed,
    /// Terminal failure; the enriched record lives in the dead-letter set.
    DeadLettered,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::DeadLettered)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Claimable => write!(f, "claimable"),
            TaskState::Owned => write!(f, "owned"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// A producer's request to enqueue one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Tag identifying the handler to invoke.
    pub kind: String,
    /// Opaque payload; never mutated by the engine.
    pub payload: serde_json::Value,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Earliest time the task may be claimed; absent means immediately.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Attempt ceiling; absent means the engine default.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    /// Creates a request with normal priority, no delay and the default
    /// attempt ceiling.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            not_before: None,
            max_attempts: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Schedules the task for no earlier than `not_before`.
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    /// Sets the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A unit of work tracked by the store.
///
/// The store is the single source of truth for these records; workers only
/// ever see clones and report back through the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at creation.
    pub id: Uuid,
    /// Tag identifying the handler to invoke.
    pub kind: String,
    /// Opaque payload, immutable after creation. A retried task keeps its
    /// original payload.
    pub payload: serde_json::Value,
    /// Higher values are claimed first; mutated only by the boost sweep.
    pub priority: i32,
    /// Lifecycle state.
    pub state: TaskState,
    /// Number of claim-to-reported-failure cycles so far.
    pub attempt_count: u32,
    /// Ceiling on `attempt_count`.
    pub max_attempts: u32,
    /// Task is ineligible for claiming while `now < not_before`.
    pub not_before: DateTime<Utc>,
    /// Worker currently holding the task, if any.
    pub owner_id: Option<String>,
    /// Instant after which an Owned task counts as orphaned regardless of
    /// owner liveness.
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Last recorded failure text; cleared on completion.
    pub last_error: Option<String>,
    /// When the boost sweep last raised this task's priority. Used to keep
    /// the sweep idempotent within one age-threshold window.
    #[serde(default)]
    pub last_boosted_at: Option<DateTime<Utc>>,
    /// When this task was created.
    pub created_at: DateTime<Utc>,
    /// When this record last changed.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Builds a new Claimable task from an enqueue request.
    pub fn from_request(request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: request.kind,
            payload: request.payload,
            priority: request.priority,
            state: TaskState::Claimable,
            attempt_count: 0,
            max_attempts: request.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            not_before: request.not_before.unwrap_or(now),
            owner_id: None,
            claim_deadline: None,
            last_error: None,
            last_boosted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns whether `worker_id` currently owns this task.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.state == TaskState::Owned && self.owner_id.as_deref() == Some(worker_id)
    }

    /// Returns the number of attempts left before dead-lettering.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Transition: Claimable -> Owned.
    pub(crate) fn begin_claim(
        &mut self,
        worker_id: &str,
        claim_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = TaskState::Owned;
        self.owner_id = Some(worker_id.to_string());
        self.claim_deadline = Some(claim_deadline);
        self.updated_at = now;
    }

    /// Transition: Owned -> Completed. Clears the ownership fields and any
    /// recorded error.
    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.owner_id = None;
        self.claim_deadline = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Transition: Owned -> Claimable after a retryable failure. The failed
    /// attempt has already been counted by the caller.
    pub(crate) fn requeue_after_failure(
        &mut self,
        not_before: DateTime<Utc>,
        error: String,
        now: DateTime<Utc>,
    ) {
        self.state = TaskState::Claimable;
        self.owner_id = None;
        self.claim_deadline = None;
        self.not_before = not_before;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Transition: Owned -> Claimable for an orphaned claim (dead worker or
    /// expired claim deadline). Does NOT touch `attempt_count`: a lost
    /// worker is not evidence against the task.
    pub(crate) fn release_orphaned(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Claimable;
        self.owner_id = None;
        self.claim_deadline = None;
        self.updated_at = now;
    }
}

/// Enriched terminal record for a task that can no longer be retried.
///
/// Operators inspecting dead letters always see the original payload, the
/// full final error and the attempt count that led here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Id the task had while active.
    pub task_id: Uuid,
    /// Original task kind.
    pub kind: String,
    /// Original, unmodified payload.
    pub payload: serde_json::Value,
    /// Priority at the time of dead-lettering.
    pub priority: i32,
    /// The error that ended the task.
    pub final_error: String,
    /// Classification of the final error.
    pub error_class: ErrorClass,
    /// Attempts consumed before dead-lettering.
    pub attempt_count: u32,
    /// Attempt ceiling the task ran under; reused on replay.
    pub max_attempts: u32,
    /// Worker that owned the task when it failed for the last time.
    pub failed_worker: Option<String>,
    /// When the task was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
    /// When the task was originally created.
    pub created_at: DateTime<Utc>,
}
