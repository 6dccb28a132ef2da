//! End-to-end lifecycle tests for the task queue engine.
//!
//! These cover the contended-claim and crash-recovery guarantees: at most
//! one owner per task, no task loss across simulated worker crashes,
//! deterministic retry exhaustion under a mocked clock, and conflict
//! rejection of stale owners.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use taskforge::clock::{Clock, ManualClock};
use taskforge::liveness::Reaper;
use taskforge::store::{DeadLetterFilter, EnqueueRequest, TaskState};
use taskforge::{
    EngineConfig, ErrorClass, FailureOutcome, FailureReport, ReportOutcome, TaskQueueEngine,
    TaskStore,
};

fn engine_with_manual_clock(config: EngineConfig) -> (Arc<TaskQueueEngine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let engine = Arc::new(TaskQueueEngine::in_memory_with_clock(
        config,
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    (engine, clock)
}

fn request(kind: &str) -> EnqueueRequest {
    EnqueueRequest::new(kind, serde_json::json!({"payload": "original"}))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_grant_each_task_exactly_once() {
    let engine = Arc::new(TaskQueueEngine::in_memory(EngineConfig::default()));

    // M tasks, N > M workers racing for them.
    let m = 8;
    let n = 24;
    for _ in 0..m {
        engine.enqueue(request("race")).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..n {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let worker_id = format!("racer-{i}");
            engine.claim(&worker_id, 1).await.unwrap()
        }));
    }

    let mut granted_ids = Vec::new();
    for handle in handles {
        for task in handle.await.unwrap() {
            granted_ids.push(task.id);
        }
    }

    // Total grants across all workers equal the task count, no duplicates.
    assert_eq!(granted_ids.len(), m);
    let unique: HashSet<_> = granted_ids.iter().collect();
    assert_eq!(unique.len(), m);

    let counts = engine.counts().await.unwrap();
    assert_eq!(counts.owned, m);
    assert_eq!(counts.claimable, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_workers_race_for_one_task() {
    let engine = Arc::new(TaskQueueEngine::in_memory(EngineConfig::default()));
    engine.enqueue(request("single")).await.unwrap();

    let a = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.claim("w-a", 1).await.unwrap() })
    };
    let b = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.claim("w-b", 1).await.unwrap() })
    };

    let (got_a, got_b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(got_a.len() + got_b.len(), 1);
    assert!(got_a.is_empty() || got_b.is_empty());
}

#[tokio::test]
async fn transient_exhaustion_walks_the_full_state_sequence() {
    let (engine, clock) = engine_with_manual_clock(EngineConfig::default());
    let max_backoff = engine.config().backoff.max_delay;

    let id = engine
        .enqueue(request("flaky").with_max_attempts(3))
        .await
        .unwrap();

    let mut observed_attempts = vec![engine.store().get(id).await.unwrap().unwrap().attempt_count];

    for round in 1..=3u32 {
        let granted = engine.claim("w1", 1).await.unwrap();
        assert_eq!(granted.len(), 1, "round {round} should claim the task");
        assert_eq!(granted[0].state, TaskState::Owned);

        let outcome = engine
            .report_failed(
                id,
                "w1",
                FailureReport::new("connection refused").with_class(ErrorClass::Transient),
            )
            .await
            .unwrap();

        if round < 3 {
            // Back to Claimable with the attempt counted and a backoff delay.
            match outcome {
                FailureOutcome::Retried { not_before } => {
                    let task = engine.store().get(id).await.unwrap().unwrap();
                    assert_eq!(task.state, TaskState::Claimable);
                    assert_eq!(task.attempt_count, round);
                    assert_eq!(task.not_before, not_before);
                    observed_attempts.push(task.attempt_count);
                }
                other => panic!("round {round}: expected retry, got {other:?}"),
            }
            // Jump past any possible jittered delay.
            clock.advance(chrono::Duration::from_std(max_backoff).unwrap());
            clock.advance(chrono::Duration::seconds(1));
        } else {
            assert_eq!(outcome, FailureOutcome::DeadLettered);
        }
    }

    // Attempt count progressed 0 -> 1 -> 2, then the third failure
    // dead-lettered at 3.
    assert_eq!(observed_attempts, vec![0, 1, 2]);

    let dead = engine
        .inspect_dead_letters(&DeadLetterFilter::any())
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, id);
    assert_eq!(dead[0].attempt_count, 3);
    assert_eq!(dead[0].final_error, "connection refused");
    assert_eq!(dead[0].payload, serde_json::json!({"payload": "original"}));

    // Exhaustion terminates: the task never re-enters the claimable set.
    clock.advance(chrono::Duration::hours(2));
    assert!(engine.claim("w1", 1).await.unwrap().is_empty());
    let counts = engine.counts().await.unwrap();
    assert_eq!(counts.dead_lettered, 1);
    assert_eq!(counts.claimable, 0);
}

#[tokio::test]
async fn no_task_loss_when_a_worker_crashes_mid_processing() {
    let (engine, clock) = engine_with_manual_clock(EngineConfig::default());
    let reaper = Reaper::new(
        Arc::clone(engine.store()),
        Arc::clone(engine.registry()),
        Duration::from_secs(10),
    );

    engine.register_worker("doomed", vec![]).await.unwrap();
    let id = engine.enqueue(request("important")).await.unwrap();
    let granted = engine.claim("doomed", 1).await.unwrap();
    assert_eq!(granted[0].id, id);

    // The worker dies without reporting; its liveness lease (30s) expires.
    clock.advance(chrono::Duration::seconds(31));
    let summary = reaper.sweep().await.unwrap();
    assert_eq!(summary.reaped_workers, 1);
    assert_eq!(summary.reclaimed_tasks, 1);

    // The task is back, attempt budget untouched, and another worker can
    // finish it.
    let task = engine.store().get(id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Claimable);
    assert_eq!(task.attempt_count, 0);

    let granted = engine.claim("survivor", 1).await.unwrap();
    assert_eq!(granted[0].id, id);
    let outcome = engine.report_complete(id, "survivor").await.unwrap();
    assert_eq!(outcome, ReportOutcome::Ok);

    let counts = engine.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.total(), 1);
}

#[tokio::test]
async fn stale_owner_reports_conflict_after_reclaim_and_reclaim_wins() {
    let (engine, clock) = engine_with_manual_clock(EngineConfig::default());
    let reaper = Reaper::new(
        Arc::clone(engine.store()),
        Arc::clone(engine.registry()),
        Duration::from_secs(10),
    );

    engine.register_worker("w1", vec![]).await.unwrap();
    let id = engine.enqueue(request("contended")).await.unwrap();
    engine.claim("w1", 1).await.unwrap();

    clock.advance(chrono::Duration::seconds(31));
    reaper.sweep().await.unwrap();
    let granted = engine.claim("w2", 1).await.unwrap();
    assert_eq!(granted[0].id, id);

    // w1 wakes up late; both kinds of report lose.
    let outcome = engine.report_complete(id, "w1").await.unwrap();
    assert_eq!(outcome, ReportOutcome::Conflict);
    let outcome = engine
        .report_failed(id, "w1", FailureReport::new("late failure"))
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::Conflict);

    // The conflict mutated nothing: w2 still owns the task and completes.
    let task = engine.store().get(id).await.unwrap().unwrap();
    assert_eq!(task.owner_id.as_deref(), Some("w2"));
    assert_eq!(task.attempt_count, 0);
    assert_eq!(engine.report_complete(id, "w2").await.unwrap(), ReportOutcome::Ok);
}

#[tokio::test]
async fn boost_sweep_is_idempotent_and_lifts_starved_tasks() {
    let (engine, clock) = engine_with_manual_clock(EngineConfig::default());
    let age_threshold = engine.config().boost.age_threshold;

    let starved = engine.enqueue(request("starved")).await.unwrap();
    clock.advance(chrono::Duration::from_std(age_threshold).unwrap());
    clock.advance(chrono::Duration::seconds(1));
    let fresh = engine
        .enqueue(request("fresh").with_priority(1))
        .await
        .unwrap();

    // Running the sweep twice back-to-back boosts exactly once.
    assert_eq!(engine.boost_sweep().await.unwrap(), 1);
    assert_eq!(engine.boost_sweep().await.unwrap(), 0);

    let starved_task = engine.store().get(starved).await.unwrap().unwrap();
    assert_eq!(starved_task.priority, 1);

    // Another aging window lifts the starved task above the fresh one.
    clock.advance(chrono::Duration::from_std(age_threshold).unwrap());
    clock.advance(chrono::Duration::seconds(1));
    engine.boost_sweep().await.unwrap();

    let first = engine.claim("w1", 1).await.unwrap();
    assert_eq!(first[0].id, starved);
    let second = engine.claim("w1", 1).await.unwrap();
    assert_eq!(second[0].id, fresh);
}

#[tokio::test]
async fn rate_limited_failures_use_the_retry_after_hint() {
    let (engine, clock) = engine_with_manual_clock(EngineConfig::default());
    let id = engine.enqueue(request("throttled")).await.unwrap();
    engine.claim("w1", 1).await.unwrap();

    let outcome = engine
        .report_failed(
            id,
            "w1",
            FailureReport::new("429 slow down")
                .with_class(ErrorClass::RateLimited)
                .with_retry_after(Duration::from_secs(120)),
        )
        .await
        .unwrap();

    match outcome {
        FailureOutcome::Retried { not_before } => {
            assert_eq!(not_before, clock.now() + chrono::Duration::seconds(120));
        }
        other => panic!("expected retry, got {other:?}"),
    }

    // Not claimable until the hint elapses.
    assert!(engine.claim("w1", 1).await.unwrap().is_empty());
    clock.advance(chrono::Duration::seconds(121));
    assert_eq!(engine.claim("w1", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_failures_exhaust_against_the_smaller_budget() {
    // max_attempts 10, unknown budget 2: the budget decides.
    let (engine, clock) = engine_with_manual_clock(EngineConfig::default());
    let max_backoff = engine.config().backoff.max_delay;

    let id = engine
        .enqueue(request("weird").with_max_attempts(10))
        .await
        .unwrap();

    engine.claim("w1", 1).await.unwrap();
    let outcome = engine
        .report_failed(id, "w1", FailureReport::new("inexplicable bit flip"))
        .await
        .unwrap();
    assert!(matches!(outcome, FailureOutcome::Retried { .. }));

    clock.advance(chrono::Duration::from_std(max_backoff).unwrap());
    clock.advance(chrono::Duration::seconds(1));

    engine.claim("w1", 1).await.unwrap();
    let outcome = engine
        .report_failed(id, "w1", FailureReport::new("inexplicable bit flip"))
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::DeadLettered);

    let dead = engine
        .inspect_dead_letters(&DeadLetterFilter::any().with_class(ErrorClass::Unknown))
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count, 2);
}

#[tokio::test]
async fn batch_claim_is_bounded_and_ordered() {
    let engine = TaskQueueEngine::in_memory(EngineConfig::default());
    for priority in [1, 9, 5, 7, 3] {
        engine
            .enqueue(request("bulk").with_priority(priority))
            .await
            .unwrap();
    }

    let granted = engine.claim("w1", 3).await.unwrap();
    let priorities: Vec<i32> = granted.iter().map(|t| t.priority).collect();
    assert_eq!(priorities, vec![9, 7, 5]);

    let rest = engine.claim("w2", 10).await.unwrap();
    let priorities: Vec<i32> = rest.iter().map(|t| t.priority).collect();
    assert_eq!(priorities, vec![3, 1]);
}

#[tokio::test]
async fn every_enqueued_task_is_acknowledged_and_tracked() {
    let engine = TaskQueueEngine::in_memory(EngineConfig::default());
    let ids = engine
        .enqueue_batch((0..50).map(|_| request("bulk")).collect())
        .await
        .unwrap();

    assert_eq!(ids.len(), 50);
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 50);

    let counts = engine.counts().await.unwrap();
    assert_eq!(counts.claimable, 50);
    assert_eq!(counts.total(), 50);
}
