//! Task handlers and the kind-to-handler registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::FailureReport;
use crate::retry::ErrorClass;
use crate::store::Task;

/// Error returned by a task handler.
///
/// Handlers usually return a bare message and let the engine's rule table
/// classify it; a handler that already knows the failure class (it saw the
/// status code, it validated the payload itself) attaches the class so the
/// rule table is bypassed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TaskError {
    /// Human-readable error text.
    pub message: String,
    /// Explicit classification, if the handler knows it.
    pub class: Option<ErrorClass>,
    /// Throttle hint for rate-limited failures.
    pub retry_after: Option<Duration>,
}

impl TaskError {
    /// An error classified by the engine's rule table.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: None,
            retry_after: None,
        }
    }

    /// A known-transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(message).with_class(ErrorClass::Transient)
    }

    /// A known-permanent error; the task will not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(message).with_class(ErrorClass::Permanent)
    }

    /// A throttling error with the dependency's retry-after hint.
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        let mut error = Self::new(message).with_class(ErrorClass::RateLimited);
        error.retry_after = Some(retry_after);
        error
    }

    /// Sets an explicit classification.
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    pub(crate) fn into_report(self) -> FailureReport {
        let mut report = FailureReport::new(self.message);
        if let Some(class) = self.class {
            report = report.with_class(class);
        }
        if let Some(retry_after) = self.retry_after {
            report = report.with_retry_after(retry_after);
        }
        report
    }
}

/// Logic invoked for one task kind.
///
/// Handlers run fully parallel and uncoordinated; all coordination happens
/// through the engine. A handler must return an error rather than silently
/// give up: lease expiry exists for crash recovery, not for normal
/// timeout handling.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Processes one claimed task.
    async fn handle(&self, task: &Task) -> Result<(), TaskError>;
}

/// Maps task kinds to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a kind, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Builder-style registration.
    pub fn with_handler(mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Looks up the handler for a kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// The kinds this registry can handle. Workers register these as their
    /// claim capabilities.
    pub fn kinds(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
