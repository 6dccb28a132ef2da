//! Worker liveness tracking and crash recovery.
//!
//! - **WorkerRegistry**: register/heartbeat/deregister with lease expiry
//! - **Reaper**: periodic sweep that removes dead workers and returns their
//!   orphaned tasks to the claimable set

pub mod reaper;
pub mod registry;

// Re-export main types for convenience
pub use reaper::{ReapSummary, Reaper, ReaperError};
pub use registry::{InMemoryWorkerRegistry, RegistryError, WorkerRecord, WorkerRegistry};
