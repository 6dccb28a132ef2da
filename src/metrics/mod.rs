//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for taskforge
//! operations: enqueue/claim/report volumes, failure classifications by
//! kind and class, dead-letter flow, reaper activity and queue depth.
//!
//! # Example
//!
//! ```ignore
//! use taskforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Record from anywhere in the process
//! let collector = MetricsCollector::new();
//! collector.record_enqueued("resize");
//!
//! // Export for scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

// Re-export metric constants for direct access when needed
pub use prometheus::{
    ACTIVE_WORKERS, CLAIMS_EMPTY, CLAIMS_GRANTED, QUEUE_DEPTH, REGISTRY, TASKS_BOOSTED,
    TASKS_COMPLETED, TASKS_DEAD_LETTERED, TASKS_ENQUEUED, TASKS_RECLAIMED, TASK_DURATION,
    TASK_FAILURES, WORKERS_REAPED,
};
