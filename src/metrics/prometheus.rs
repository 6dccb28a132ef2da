//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by taskforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all taskforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of tasks enqueued, labeled by kind.
pub static TASKS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Total number of tasks completed successfully, labeled by kind.
pub static TASKS_COMPLETED: OnceLock<CounterVec> = OnceLock::new();

/// Total number of failure reports, labeled by kind and error class.
pub static TASK_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Total number of tasks dead-lettered, labeled by kind and error class.
pub static TASKS_DEAD_LETTERED: OnceLock<CounterVec> = OnceLock::new();

/// Total number of tasks granted by claim calls.
pub static CLAIMS_GRANTED: OnceLock<Counter> = OnceLock::new();

/// Total number of claim calls that found no eligible task.
pub static CLAIMS_EMPTY: OnceLock<Counter> = OnceLock::new();

/// Total number of priority boosts applied by the starvation sweep.
pub static TASKS_BOOSTED: OnceLock<Counter> = OnceLock::new();

/// Total number of workers removed after lease expiry.
pub static WORKERS_REAPED: OnceLock<Counter> = OnceLock::new();

/// Total number of orphaned tasks returned to the claimable set.
pub static TASKS_RECLAIMED: OnceLock<Counter> = OnceLock::new();

/// Number of tasks per lifecycle state, labeled by state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently processing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Task processing duration in seconds, labeled by kind.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. It creates all
/// metric instances with appropriate labels and buckets, and registers them
/// with the global Prometheus registry. Calling it again is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due
/// to duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Lifecycle metrics
    let tasks_enqueued = CounterVec::new(
        Opts::new("taskforge_tasks_enqueued_total", "Total tasks enqueued"),
        &["kind"],
    )?;

    let tasks_completed = CounterVec::new(
        Opts::new(
            "taskforge_tasks_completed_total",
            "Total tasks completed successfully",
        ),
        &["kind"],
    )?;

    let task_failures = CounterVec::new(
        Opts::new(
            "taskforge_task_failures_total",
            "Total failure reports by classification",
        ),
        &["kind", "class"],
    )?;

    let tasks_dead_lettered = CounterVec::new(
        Opts::new(
            "taskforge_tasks_dead_lettered_total",
            "Total tasks moved to the dead-letter set",
        ),
        &["kind", "class"],
    )?;

    // Claim metrics
    let claims_granted = Counter::new(
        "taskforge_claims_granted_total",
        "Total tasks granted by claim calls",
    )?;

    let claims_empty = Counter::new(
        "taskforge_claims_empty_total",
        "Total claim calls that found no eligible task",
    )?;

    // Maintenance metrics
    let tasks_boosted = Counter::new(
        "taskforge_tasks_boosted_total",
        "Total priority boosts applied by the starvation sweep",
    )?;

    let workers_reaped = Counter::new(
        "taskforge_workers_reaped_total",
        "Total workers removed after lease expiry",
    )?;

    let tasks_reclaimed = Counter::new(
        "taskforge_tasks_reclaimed_total",
        "Total orphaned tasks returned to the claimable set",
    )?;

    // Gauges and histograms
    let queue_depth = GaugeVec::new(
        Opts::new("taskforge_queue_depth", "Tasks per lifecycle state"),
        &["state"],
    )?;

    let active_workers = Gauge::new(
        "taskforge_active_workers",
        "Workers currently processing a task",
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "taskforge_task_duration_seconds",
            "Task processing duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["kind"],
    )?;

    // Register all metrics with the registry
    registry.register(Box::new(tasks_enqueued.clone()))?;
    registry.register(Box::new(tasks_completed.clone()))?;
    registry.register(Box::new(task_failures.clone()))?;
    registry.register(Box::new(tasks_dead_lettered.clone()))?;
    registry.register(Box::new(claims_granted.clone()))?;
    registry.register(Box::new(claims_empty.clone()))?;
    registry.register(Box::new(tasks_boosted.clone()))?;
    registry.register(Box::new(workers_reaped.clone()))?;
    registry.register(Box::new(tasks_reclaimed.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_ENQUEUED.set(tasks_enqueued);
    let _ = TASKS_COMPLETED.set(tasks_completed);
    let _ = TASK_FAILURES.set(task_failures);
    let _ = TASKS_DEAD_LETTERED.set(tasks_dead_lettered);
    let _ = CLAIMS_GRANTED.set(claims_granted);
    let _ = CLAIMS_EMPTY.set(claims_empty);
    let _ = TASKS_BOOSTED.set(tasks_boosted);
    let _ = WORKERS_REAPED.set(workers_reaped);
    let _ = TASKS_RECLAIMED.set(tasks_reclaimed);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = TASK_DURATION.set(task_duration);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Gathers all metrics from the registry and encodes them in the text
/// exposition format, suitable for scraping. If the registry has not been
/// initialized or encoding fails, returns an explanatory comment line
/// instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
