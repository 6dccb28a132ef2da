//! Retry and failure handling.
//!
//! This module decides what happens to a task after a failure report:
//!
//! - **ErrorClassifier**: data-driven mapping from error text to an
//!   [`ErrorClass`], configurable without redeploying
//! - **BackoffPolicy**: exponential delays with a hard ceiling and full
//!   jitter
//! - **RetryController**: requeue-or-dead-letter decision, applied by the
//!   store inside its atomic failure transition

pub mod backoff;
pub mod classifier;
pub mod controller;

// Re-export main types for convenience
pub use backoff::BackoffPolicy;
pub use classifier::{ClassifierError, ClassifierRule, ErrorClass, ErrorClassifier};
pub use controller::{
    Disposition, RetryController, TaskFailure, DEFAULT_UNKNOWN_RETRY_BUDGET,
};
