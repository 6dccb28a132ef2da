//! Custom metric collectors for taskforge operations.
//!
//! This module provides a high-level interface for recording metrics
//! throughout the engine. The `MetricsCollector` struct wraps the raw
//! Prometheus metrics and provides convenient methods for common
//! operations; every method is a no-op until `init_metrics()` has run, so
//! library users who do not care about metrics pay nothing.

use super::prometheus::{
    ACTIVE_WORKERS, CLAIMS_EMPTY, CLAIMS_GRANTED, QUEUE_DEPTH, TASKS_BOOSTED, TASKS_COMPLETED,
    TASKS_DEAD_LETTERED, TASKS_ENQUEUED, TASKS_RECLAIMED, TASK_DURATION, TASK_FAILURES,
    WORKERS_REAPED,
};
use crate::retry::ErrorClass;
use crate::store::StoreCounts;

/// Metrics collector for recording taskforge operational metrics.
///
/// Cheap to construct and clone; all state lives in the global registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    ///
    /// Note: Metrics must be initialized with `init_metrics()` before
    /// recorded values show up in exports.
    pub fn new() -> Self {
        Self
    }

    /// Record an enqueued task.
    pub fn record_enqueued(&self, kind: &str) {
        if let Some(enqueued) = TASKS_ENQUEUED.get() {
            enqueued.with_label_values(&[kind]).inc();
        }
    }

    /// Record a successful task completion.
    pub fn record_completed(&self, kind: &str) {
        if let Some(completed) = TASKS_COMPLETED.get() {
            completed.with_label_values(&[kind]).inc();
        }
    }

    /// Record how long a task spent in its handler.
    pub fn record_task_duration(&self, kind: &str, duration_secs: f64) {
        if let Some(duration) = TASK_DURATION.get() {
            duration.with_label_values(&[kind]).observe(duration_secs);
        }
    }

    /// Record a classified failure report.
    ///
    /// Every classification is countable by kind and class; this is what
    /// lets an operator see a sudden surge of, say, rate-limited `export`
    /// tasks without reading logs.
    pub fn record_failure(&self, kind: &str, class: ErrorClass) {
        if let Some(failures) = TASK_FAILURES.get() {
            failures.with_label_values(&[kind, class.as_str()]).inc();
        }
    }

    /// Record a task moving to the dead-letter set.
    pub fn record_dead_letter(&self, kind: &str, class: ErrorClass) {
        if let Some(dead) = TASKS_DEAD_LETTERED.get() {
            dead.with_label_values(&[kind, class.as_str()]).inc();
        }
    }

    /// Record the outcome of one claim call.
    pub fn record_claim(&self, granted: usize) {
        if granted == 0 {
            if let Some(empty) = CLAIMS_EMPTY.get() {
                empty.inc();
            }
        } else if let Some(claims) = CLAIMS_GRANTED.get() {
            claims.inc_by(granted as f64);
        }
    }

    /// Record boost-sweep activity.
    pub fn record_boosted(&self, boosted: usize) {
        if boosted > 0 {
            if let Some(metric) = TASKS_BOOSTED.get() {
                metric.inc_by(boosted as f64);
            }
        }
    }

    /// Record a reaper sweep: workers removed and tasks returned to the
    /// claimable set.
    pub fn record_reap(&self, workers: usize, tasks: usize) {
        if workers > 0 {
            if let Some(metric) = WORKERS_REAPED.get() {
                metric.inc_by(workers as f64);
            }
        }
        if tasks > 0 {
            if let Some(metric) = TASKS_RECLAIMED.get() {
                metric.inc_by(tasks as f64);
            }
        }
    }

    /// Update the per-state queue depth gauges from a counts snapshot.
    pub fn update_queue_depth(&self, counts: &StoreCounts) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            depth
                .with_label_values(&["claimable"])
                .set(counts.claimable as f64);
            depth.with_label_values(&["owned"]).set(counts.owned as f64);
            depth
                .with_label_values(&["completed"])
                .set(counts.completed as f64);
            depth
                .with_label_values(&["dead_lettered"])
                .set(counts.dead_lettered as f64);
        }
    }

    /// Mark a worker as busy.
    pub fn worker_busy(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    /// Mark a worker as idle again.
    pub fn worker_idle(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }
}
