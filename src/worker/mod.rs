//! Worker pool and task handlers.
//!
//! This module provides the execution side of the engine:
//!
//! - **TaskHandler / HandlerRegistry**: the logic invoked per task kind
//! - **WorkerPool**: a pool of workers running the claim -> process ->
//!   report poll loop with adaptive idle backoff, heartbeats and graceful
//!   shutdown
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │    Engine    │
//!                      │ (task store) │
//!                      └──────┬───────┘
//!                             │ claim / report
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! Workers never talk to each other; the store's atomic claim is the only
//! arbitration between them.

pub mod handler;
pub mod pool;

// Re-export main types for convenience
pub use handler::{HandlerRegistry, TaskError, TaskHandler};
pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
