//! In-memory task store.
//!
//! Backs single-node deployments, simulations and tests. All records live
//! behind one async mutex; every trait method takes the lock once, applies
//! its full transition and releases, which makes each operation atomic with
//! respect to every other and keeps the at-most-one-owner invariant
//! trivially true: contending claimers serialize, and a task granted to one
//! caller is out of the claimable index before the next caller scans it.
//!
//! A `BTreeSet` index over `(priority DESC, not_before ASC, id ASC)` keys
//! keeps the claim scan from ever touching owned or terminal records.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::task::{DeadLetter, EnqueueRequest, Task, TaskState};
use super::{
    ClaimRequest, DeadLetterFilter, FailureOutcome, ReportOutcome, StoreCounts, StoreError,
    TaskStore,
};
use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::config::BoostConfig;
use crate::retry::{Disposition, RetryController, TaskFailure};

/// Claimable-index key.
///
/// Ordered so that iterating the index front-to-back visits tasks in claim
/// order: priority descending, then `not_before` ascending (older-scheduled
/// first), then id as a deterministic tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClaimableKey {
    priority: i32,
    not_before: DateTime<Utc>,
    id: Uuid,
}

impl ClaimableKey {
    fn for_task(task: &Task) -> Self {
        Self {
            priority: task.priority,
            not_before: task.not_before,
            id: task.id,
        }
    }
}

impl PartialOrd for ClaimableKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClaimableKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.not_before.cmp(&other.not_before))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// All records, guarded by one lock.
struct StoreState {
    /// Active tasks (Claimable, Owned, Completed), by id.
    tasks: HashMap<Uuid, Task>,
    /// Claim-order index over Claimable tasks only.
    claimable: BTreeSet<ClaimableKey>,
    /// Dead-letter set, in dead-lettering order.
    dead_letters: Vec<DeadLetter>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            claimable: BTreeSet::new(),
            dead_letters: Vec::new(),
        }
    }

    fn insert_task(&mut self, task: Task) -> Uuid {
        let id = task.id;
        self.claimable.insert(ClaimableKey::for_task(&task));
        self.tasks.insert(id, task);
        id
    }
}

/// In-memory implementation of [`TaskStore`].
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    controller: RetryController,
}

impl InMemoryTaskStore {
    /// Creates a store with an injected clock and retry controller.
    pub fn new(clock: Arc<dyn Clock>, controller: RetryController) -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
            clock,
            controller,
        }
    }

    /// Creates a store on the system clock with default retry behavior.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(SystemClock), RetryController::default())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, request: EnqueueRequest) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        Ok(state.insert_task(Task::from_request(request, now)))
    }

    async fn insert_batch(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        Ok(requests
            .into_iter()
            .map(|request| state.insert_task(Task::from_request(request, now)))
            .collect())
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let deadline = now + chrono_duration(request.lease_duration);

        // Phase 1: walk the index in claim order and pick eligible keys.
        let mut selected: Vec<ClaimableKey> = Vec::new();
        for key in &state.claimable {
            if selected.len() == request.batch_size {
                break;
            }
            if key.not_before > now {
                continue;
            }
            if let Some(ref capabilities) = request.capabilities {
                match state.tasks.get(&key.id) {
                    Some(task) if capabilities.iter().any(|kind| *kind == task.kind) => {}
                    _ => continue,
                }
            }
            selected.push(*key);
        }

        // Phase 2: take ownership of the selected tasks.
        let mut granted = Vec::with_capacity(selected.len());
        for key in selected {
            state.claimable.remove(&key);
            if let Some(task) = state.tasks.get_mut(&key.id) {
                task.begin_claim(&request.worker_id, deadline, now);
                granted.push(task.clone());
            }
        }

        Ok(granted)
    }

    async fn complete(&self, task_id: Uuid, worker_id: &str) -> Result<ReportOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        // A record missing from the active set but present in the
        // dead-letter set went terminal under someone else; that is a lost
        // ownership race, not an unknown task.
        let went_terminal = state.dead_letters.iter().any(|d| d.task_id == task_id);
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return if went_terminal {
                Ok(ReportOutcome::Conflict)
            } else {
                Err(StoreError::TaskNotFound(task_id))
            };
        };

        if !task.is_owned_by(worker_id) {
            debug!(task_id = %task_id, worker_id = %worker_id, "completion rejected: stale owner");
            return Ok(ReportOutcome::Conflict);
        }

        task.mark_completed(now);
        Ok(ReportOutcome::Ok)
    }

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        failure: TaskFailure,
    ) -> Result<FailureOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let went_terminal = state.dead_letters.iter().any(|d| d.task_id == task_id);
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return if went_terminal {
                Ok(FailureOutcome::Conflict)
            } else {
                Err(StoreError::TaskNotFound(task_id))
            };
        };

        if !task.is_owned_by(worker_id) {
            debug!(task_id = %task_id, worker_id = %worker_id, "failure report rejected: stale owner");
            return Ok(FailureOutcome::Conflict);
        }

        task.attempt_count += 1;
        let disposition =
            self.controller
                .dispose(task.attempt_count, task.max_attempts, &failure, now);

        match disposition {
            Disposition::Retry { not_before } => {
                task.requeue_after_failure(not_before, failure.error, now);
                let key = ClaimableKey::for_task(task);
                state.claimable.insert(key);
                Ok(FailureOutcome::Retried { not_before })
            }
            Disposition::DeadLetter => {
                let dead = DeadLetter {
                    task_id: task.id,
                    kind: task.kind.clone(),
                    payload: task.payload.clone(),
                    priority: task.priority,
                    final_error: failure.error,
                    error_class: failure.class,
                    attempt_count: task.attempt_count,
                    max_attempts: task.max_attempts,
                    failed_worker: Some(worker_id.to_string()),
                    dead_lettered_at: now,
                    created_at: task.created_at,
                };
                // Physically move the record: the dead-letter set is not
                // selectable by claims, and both sides of the move happen
                // under the same lock.
                state.tasks.remove(&task_id);
                state.dead_letters.push(dead);
                Ok(FailureOutcome::DeadLettered)
            }
        }
    }

    async fn boost_priorities(&self, config: &BoostConfig) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let threshold = chrono_duration(config.age_threshold);

        let candidates: Vec<ClaimableKey> = state
            .claimable
            .iter()
            .filter(|key| now - key.not_before >= threshold)
            .copied()
            .collect();

        let mut boosted = 0;
        for key in candidates {
            let eligible = match state.tasks.get(&key.id) {
                Some(task) => {
                    task.priority < config.max_priority
                        && task
                            .last_boosted_at
                            .map_or(true, |last| now - last >= threshold)
                }
                None => false,
            };
            if !eligible {
                continue;
            }

            state.claimable.remove(&key);
            if let Some(task) = state.tasks.get_mut(&key.id) {
                task.priority = (task.priority + config.step).min(config.max_priority);
                task.last_boosted_at = Some(now);
                task.updated_at = now;
                let new_key = ClaimableKey::for_task(task);
                state.claimable.insert(new_key);
                boosted += 1;
            }
        }

        Ok(boosted)
    }

    async fn reclaim_owned_by(&self, worker_id: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let orphaned: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|task| task.is_owned_by(worker_id))
            .map(|task| task.id)
            .collect();

        for id in &orphaned {
            if let Some(task) = state.tasks.get_mut(id) {
                task.release_orphaned(now);
                let key = ClaimableKey::for_task(task);
                state.claimable.insert(key);
            }
        }

        Ok(orphaned.len())
    }

    async fn release_expired_claims(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let expired: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|task| {
                task.state == TaskState::Owned
                    && task.claim_deadline.map_or(false, |deadline| deadline < now)
            })
            .map(|task| task.id)
            .collect();

        for id in &expired {
            if let Some(task) = state.tasks.get_mut(id) {
                debug!(task_id = %id, owner = ?task.owner_id, "claim deadline expired, releasing task");
                task.release_orphaned(now);
                let key = ClaimableKey::for_task(task);
                state.claimable.insert(key);
            }
        }

        Ok(expired.len())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let state = self.state.lock().await;
        let limit = if filter.limit == 0 {
            usize::MAX
        } else {
            filter.limit
        };

        Ok(state
            .dead_letters
            .iter()
            .rev()
            .filter(|dead| filter.kind.as_deref().map_or(true, |k| k == dead.kind))
            .filter(|dead| filter.class.map_or(true, |c| c == dead.error_class))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_dead_letter(&self, task_id: Uuid) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let position = state
            .dead_letters
            .iter()
            .position(|dead| dead.task_id == task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let dead = state.dead_letters.remove(position);

        let request = EnqueueRequest::new(dead.kind, dead.payload)
            .with_priority(dead.priority)
            .with_max_attempts(dead.max_attempts);
        Ok(state.insert_task(Task::from_request(request, now)))
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StoreCounts {
            dead_lettered: state.dead_letters.len(),
            ..StoreCounts::default()
        };
        for task in state.tasks.values() {
            match task.state {
                TaskState::Claimable => counts.claimable += 1,
                TaskState::Owned => counts.owned += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::DeadLettered => counts.dead_lettered += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retry::{BackoffPolicy, ErrorClass};
    use std::time::Duration;

    fn store_with_clock() -> (InMemoryTaskStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryTaskStore::new(
            Arc::clone(&clock) as Arc<dyn Clock>,
            RetryController::default(),
        );
        (store, clock)
    }

    fn claim_one(worker: &str) -> ClaimRequest {
        ClaimRequest {
            worker_id: worker.to_string(),
            capabilities: None,
            batch_size: 1,
            lease_duration: Duration::from_secs(60),
        }
    }

    fn request(kind: &str) -> EnqueueRequest {
        EnqueueRequest::new(kind, serde_json::json!({}))
    }

    #[tokio::test]
    async fn insert_and_counts() {
        let (store, _clock) = store_with_clock();
        store.insert(request("resize")).await.unwrap();
        store.insert(request("resize")).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.claimable, 2);
        assert_eq!(counts.owned, 0);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_schedule_time() {
        let (store, clock) = store_with_clock();
        let low = store.insert(request("a")).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let high = store
            .insert(request("b").with_priority(5))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let low_late = store.insert(request("c")).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let granted = store.claim(claim_one("w")).await.unwrap();
            order.push(granted[0].id);
        }
        assert_eq!(order, vec![high, low, low_late]);
    }

    #[tokio::test]
    async fn claim_respects_not_before() {
        let (store, clock) = store_with_clock();
        let later = clock.now() + chrono::Duration::minutes(5);
        store
            .insert(request("delayed").with_not_before(later))
            .await
            .unwrap();

        assert!(store.claim(claim_one("w")).await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(store.claim(claim_one("w")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_respects_capabilities() {
        let (store, _clock) = store_with_clock();
        store.insert(request("resize")).await.unwrap();

        let mut filtered = claim_one("w");
        filtered.capabilities = Some(vec!["transcode".to_string()]);
        assert!(store.claim(filtered).await.unwrap().is_empty());

        let mut matching = claim_one("w");
        matching.capabilities = Some(vec!["resize".to_string()]);
        assert_eq!(store.claim(matching).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimed_task_carries_lease_deadline() {
        let (store, clock) = store_with_clock();
        store.insert(request("resize")).await.unwrap();

        let granted = store.claim(claim_one("w")).await.unwrap();
        let task = &granted[0];
        assert_eq!(task.state, TaskState::Owned);
        assert_eq!(task.owner_id.as_deref(), Some("w"));
        assert_eq!(
            task.claim_deadline,
            Some(clock.now() + chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn stale_owner_reports_are_conflicts() {
        let (store, _clock) = store_with_clock();
        let id = store.insert(request("resize")).await.unwrap();
        store.claim(claim_one("w1")).await.unwrap();

        let outcome = store.complete(id, "w2").await.unwrap();
        assert!(outcome.is_conflict());

        let failure = TaskFailure::new("boom", ErrorClass::Transient);
        let outcome = store.fail(id, "w2", failure).await.unwrap();
        assert!(outcome.is_conflict());

        // The rejected reports changed nothing.
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Owned);
        assert_eq!(task.attempt_count, 0);
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let (store, clock) = store_with_clock();
        let id = store.insert(request("resize")).await.unwrap();
        store.claim(claim_one("w")).await.unwrap();

        let failure = TaskFailure::new("connection reset", ErrorClass::Transient);
        let outcome = store.fail(id, "w", failure).await.unwrap();

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Claimable);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("connection reset"));
        match outcome {
            FailureOutcome::Retried { not_before } => {
                assert!(not_before >= clock.now());
                assert_eq!(task.not_before, not_before);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_moves_to_dead_letter_set() {
        let (store, _clock) = store_with_clock();
        let id = store.insert(request("resize")).await.unwrap();
        store.claim(claim_one("w")).await.unwrap();

        let failure = TaskFailure::new("invalid payload", ErrorClass::Permanent);
        let outcome = store.fail(id, "w", failure).await.unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);

        // Gone from the active set, present and enriched in the DLQ.
        assert!(store.get(id).await.unwrap().is_none());
        let dead = store
            .dead_letters(&DeadLetterFilter::any())
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task_id, id);
        assert_eq!(dead[0].final_error, "invalid payload");
        assert_eq!(dead[0].error_class, ErrorClass::Permanent);
        assert_eq!(dead[0].attempt_count, 1);
        assert_eq!(dead[0].failed_worker.as_deref(), Some("w"));

        assert!(store.claim(claim_one("w")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn boost_sweep_is_idempotent_within_a_window() {
        let (store, clock) = store_with_clock();
        let config = BoostConfig {
            age_threshold: Duration::from_secs(60),
            step: 2,
            max_priority: 5,
        };
        let id = store.insert(request("slow")).await.unwrap();

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(store.boost_priorities(&config).await.unwrap(), 1);
        assert_eq!(store.boost_priorities(&config).await.unwrap(), 0);
        assert_eq!(store.get(id).await.unwrap().unwrap().priority, 2);

        // Each further window adds one step, up to the cap.
        clock.advance(chrono::Duration::seconds(61));
        store.boost_priorities(&config).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        store.boost_priorities(&config).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        store.boost_priorities(&config).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().priority, 5);
    }

    #[tokio::test]
    async fn reclaim_returns_orphans_without_counting_attempts() {
        let (store, _clock) = store_with_clock();
        let id = store.insert(request("resize")).await.unwrap();
        store.claim(claim_one("w1")).await.unwrap();

        assert_eq!(store.reclaim_owned_by("w1").await.unwrap(), 1);
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Claimable);
        assert_eq!(task.attempt_count, 0);
        assert!(task.owner_id.is_none());
    }

    #[tokio::test]
    async fn expired_claim_deadlines_are_released() {
        let (store, clock) = store_with_clock();
        store.insert(request("resize")).await.unwrap();
        store.claim(claim_one("w1")).await.unwrap();

        assert_eq!(store.release_expired_claims().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(store.release_expired_claims().await.unwrap(), 1);

        let granted = store.claim(claim_one("w2")).await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].owner_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn replay_creates_a_fresh_task_and_consumes_the_dead_letter() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryTaskStore::new(
            Arc::clone(&clock) as Arc<dyn Clock>,
            RetryController::new(BackoffPolicy::default(), 2),
        );
        let id = store
            .insert(request("resize").with_max_attempts(1))
            .await
            .unwrap();
        store.claim(claim_one("w")).await.unwrap();
        store
            .fail(id, "w", TaskFailure::new("boom", ErrorClass::Transient))
            .await
            .unwrap();

        let new_id = store.replay_dead_letter(id).await.unwrap();
        assert_ne!(new_id, id);

        let replayed = store.get(new_id).await.unwrap().unwrap();
        assert_eq!(replayed.state, TaskState::Claimable);
        assert_eq!(replayed.attempt_count, 0);
        assert_eq!(replayed.max_attempts, 1);
        assert!(store
            .dead_letters(&DeadLetterFilter::any())
            .await
            .unwrap()
            .is_empty());

        // Replaying twice is an error, not a duplicate task.
        assert!(matches!(
            store.replay_dead_letter(id).await,
            Err(StoreError::TaskNotFound(_))
        ));
    }
}
