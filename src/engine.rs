//! Engine facade: the single entry point for producers, workers and
//! operators.
//!
//! The engine wires the task store, the liveness registry, the error
//! classifier and the configured policies behind the operation contracts
//! the rest of the system uses: enqueue, claim, report, worker lifecycle
//! and dead-letter tooling. It holds no task or worker state of its own;
//! every mutation is one atomic store or registry operation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::liveness::{InMemoryWorkerRegistry, Reaper, RegistryError, WorkerRegistry};
use crate::metrics::MetricsCollector;
use crate::retry::{ErrorClass, ErrorClassifier, RetryController, TaskFailure};
use crate::store::{
    ClaimRequest, DeadLetter, DeadLetterFilter, EnqueueRequest, FailureOutcome,
    InMemoryTaskStore, ReportOutcome, StoreCounts, StoreError, Task, TaskStore,
};

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The task store could not serve the request.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The liveness registry could not serve the request.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A worker's description of a task failure.
///
/// The class is usually left for the engine's rule table to decide; a
/// handler that knows better (it saw an HTTP 429, say) can pass an explicit
/// hint, and a throttled dependency's retry-after value rides along.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Human-readable error text.
    pub error: String,
    /// Explicit classification, overriding the rule table.
    pub class_hint: Option<ErrorClass>,
    /// Throttle hint, honored for rate-limited failures.
    pub retry_after: Option<Duration>,
}

impl FailureReport {
    /// Creates a report classified by the engine's rule table.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            class_hint: None,
            retry_after: None,
        }
    }

    /// Sets an explicit classification.
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class_hint = Some(class);
        self
    }

    /// Attaches a retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// The task queue engine.
pub struct TaskQueueEngine {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn WorkerRegistry>,
    classifier: ErrorClassifier,
    config: EngineConfig,
    metrics: MetricsCollector,
}

impl TaskQueueEngine {
    /// Creates an engine over explicit store and registry implementations.
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn WorkerRegistry>,
        classifier: ErrorClassifier,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            classifier,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a fully in-memory engine on the system clock.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a fully in-memory engine on an injected clock. Tests and
    /// simulations use this with a [`crate::clock::ManualClock`].
    pub fn in_memory_with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let controller = RetryController::new(config.backoff.clone(), config.unknown_retry_budget);
        let store = Arc::new(InMemoryTaskStore::new(Arc::clone(&clock), controller));
        let registry = Arc::new(InMemoryWorkerRegistry::new(
            clock,
            config.worker_lease_duration,
        ));
        Self::new(store, registry, ErrorClassifier::with_default_rules(), config)
    }

    /// Replaces the failure classifier.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Enqueues one task. Never silently drops: the caller gets the new
    /// task's id or a store error.
    pub async fn enqueue(&self, mut request: EnqueueRequest) -> Result<Uuid, EngineError> {
        if request.max_attempts.is_none() {
            request.max_attempts = Some(self.config.default_max_attempts);
        }
        let kind = request.kind.clone();
        let task_id = self.store.insert(request).await?;
        self.metrics.record_enqueued(&kind);
        debug!(task_id = %task_id, kind = %kind, "Task enqueued");
        Ok(task_id)
    }

    /// Enqueues several tasks in one store call.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<Uuid>, EngineError> {
        let requests: Vec<EnqueueRequest> = requests
            .into_iter()
            .map(|mut request| {
                if request.max_attempts.is_none() {
                    request.max_attempts = Some(self.config.default_max_attempts);
                }
                request
            })
            .collect();
        for request in &requests {
            self.metrics.record_enqueued(&request.kind);
        }
        Ok(self.store.insert_batch(requests).await?)
    }

    /// Claims up to `batch_size` tasks for a worker.
    ///
    /// The capability filter comes from the worker's registration record;
    /// an unregistered worker (or one registered with no capability list)
    /// claims any kind. May return fewer tasks than requested, or none;
    /// an empty result is normal, not an error.
    pub async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
    ) -> Result<Vec<Task>, EngineError> {
        let capabilities = match self.registry.get(worker_id).await? {
            Some(record) if !record.capabilities.is_empty() => Some(record.capabilities),
            _ => None,
        };

        let granted = self
            .store
            .claim(ClaimRequest {
                worker_id: worker_id.to_string(),
                capabilities,
                batch_size: batch_size.max(1),
                lease_duration: self.config.lease_duration,
            })
            .await?;

        self.metrics.record_claim(granted.len());
        Ok(granted)
    }

    /// Reports successful completion of an owned task.
    pub async fn report_complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
    ) -> Result<ReportOutcome, EngineError> {
        let kind = match self.store.get(task_id).await? {
            Some(task) => task.kind,
            None => String::new(),
        };
        let outcome = self.store.complete(task_id, worker_id).await?;
        match outcome {
            ReportOutcome::Ok => {
                self.metrics.record_completed(&kind);
                debug!(task_id = %task_id, worker_id = %worker_id, "Task completed");
            }
            ReportOutcome::Conflict => {
                debug!(task_id = %task_id, worker_id = %worker_id, "Completion lost ownership race");
            }
        }
        Ok(outcome)
    }

    /// Reports a task failure.
    ///
    /// Classifies the error (rule table, unless the report carries an
    /// explicit hint), then hands the classified failure to the store,
    /// which counts the attempt and applies the retry controller's
    /// disposition atomically.
    pub async fn report_failed(
        &self,
        task_id: Uuid,
        worker_id: &str,
        report: FailureReport,
    ) -> Result<FailureOutcome, EngineError> {
        let kind = match self.store.get(task_id).await? {
            Some(task) => task.kind,
            None => String::new(),
        };

        let class = report
            .class_hint
            .unwrap_or_else(|| self.classifier.classify(&kind, &report.error));
        if class == ErrorClass::Unknown {
            warn!(
                task_id = %task_id,
                kind = %kind,
                error = %report.error,
                "Unclassified task failure; extend the classifier rule table"
            );
        }

        let mut failure = TaskFailure::new(report.error, class);
        if let Some(retry_after) = report.retry_after {
            failure = failure.with_retry_after(retry_after);
        }

        let outcome = self.store.fail(task_id, worker_id, failure).await?;
        match outcome {
            FailureOutcome::Retried { not_before } => {
                self.metrics.record_failure(&kind, class);
                debug!(
                    task_id = %task_id,
                    class = %class,
                    not_before = %not_before,
                    "Task failed, requeued with backoff"
                );
            }
            FailureOutcome::DeadLettered => {
                self.metrics.record_failure(&kind, class);
                self.metrics.record_dead_letter(&kind, class);
                info!(task_id = %task_id, kind = %kind, class = %class, "Task dead-lettered");
            }
            FailureOutcome::Conflict => {
                debug!(task_id = %task_id, worker_id = %worker_id, "Failure report lost ownership race");
            }
        }
        Ok(outcome)
    }

    /// Registers a worker (idempotent upsert).
    pub async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: Vec<String>,
    ) -> Result<(), EngineError> {
        self.registry.register(worker_id, capabilities).await?;
        debug!(worker_id = %worker_id, "Worker registered");
        Ok(())
    }

    /// Renews a worker's liveness lease.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), EngineError> {
        Ok(self.registry.renew(worker_id).await?)
    }

    /// Removes a worker record immediately (graceful shutdown).
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<(), EngineError> {
        self.registry.deregister(worker_id).await?;
        debug!(worker_id = %worker_id, "Worker deregistered");
        Ok(())
    }

    /// Inspects the dead-letter set. Operator-facing and read-only.
    pub async fn inspect_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetter>, EngineError> {
        Ok(self.store.dead_letters(filter).await?)
    }

    /// Re-enqueues a dead-lettered task as a fresh task. Explicitly manual:
    /// nothing in the engine ever replays a dead letter on its own.
    pub async fn replay_dead_letter(&self, task_id: Uuid) -> Result<Uuid, EngineError> {
        let new_id = self.store.replay_dead_letter(task_id).await?;
        info!(dead_task_id = %task_id, new_task_id = %new_id, "Dead letter replayed");
        Ok(new_id)
    }

    /// Task counts by state; also refreshes the queue-depth gauges.
    pub async fn counts(&self) -> Result<StoreCounts, EngineError> {
        let counts = self.store.counts().await?;
        self.metrics.update_queue_depth(&counts);
        Ok(counts)
    }

    /// Runs one age-based priority boost sweep.
    pub async fn boost_sweep(&self) -> Result<usize, EngineError> {
        let boosted = self.store.boost_priorities(&self.config.boost).await?;
        self.metrics.record_boosted(boosted);
        if boosted > 0 {
            debug!(boosted = boosted, "Boost sweep raised priorities");
        }
        Ok(boosted)
    }

    /// Spawns the periodic boost sweep. Runs until the shutdown channel
    /// fires.
    pub fn spawn_boost_loop(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = engine.config.boost_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.boost_sweep().await {
                            warn!(error = %e, "Boost sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Spawns the reaper sweep loop over this engine's store and registry.
    pub fn spawn_reaper(&self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        Reaper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.reaper_interval,
        )
        .spawn(shutdown_rx)
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying task store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// The underlying worker registry.
    pub fn registry(&self) -> &Arc<dyn WorkerRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retry::ClassifierRule;

    fn engine_with_clock() -> (TaskQueueEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = TaskQueueEngine::in_memory_with_clock(
            EngineConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (engine, clock)
    }

    fn request(kind: &str) -> EnqueueRequest {
        EnqueueRequest::new(kind, serde_json::json!({"n": 1}))
    }

    #[tokio::test]
    async fn enqueue_applies_configured_default_max_attempts() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = EngineConfig::default().with_default_max_attempts(7);
        let engine =
            TaskQueueEngine::in_memory_with_clock(config, Arc::clone(&clock) as Arc<dyn Clock>);

        let id = engine.enqueue(request("resize")).await.unwrap();
        let task = engine.store().get(id).await.unwrap().unwrap();
        assert_eq!(task.max_attempts, 7);

        // An explicit ceiling on the request wins over the default.
        let id = engine
            .enqueue(request("resize").with_max_attempts(1))
            .await
            .unwrap();
        let task = engine.store().get(id).await.unwrap().unwrap();
        assert_eq!(task.max_attempts, 1);
    }

    #[tokio::test]
    async fn claim_uses_registered_capabilities_as_filter() {
        let (engine, _clock) = engine_with_clock();
        engine
            .register_worker("w1", vec!["transcode".to_string()])
            .await
            .unwrap();
        engine.enqueue(request("resize")).await.unwrap();

        // w1 only does transcoding, so the resize task stays put.
        assert!(engine.claim("w1", 1).await.unwrap().is_empty());

        // An unregistered worker claims any kind.
        assert_eq!(engine.claim("w2", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn report_failed_classifies_via_rule_table() {
        let (engine, _clock) = engine_with_clock();
        let id = engine
            .enqueue(request("resize").with_max_attempts(1))
            .await
            .unwrap();
        engine.claim("w1", 1).await.unwrap();

        let outcome = engine
            .report_failed(id, "w1", FailureReport::new("invalid payload shape"))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);

        let dead = engine
            .inspect_dead_letters(&DeadLetterFilter::any())
            .await
            .unwrap();
        assert_eq!(dead[0].error_class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn explicit_class_hint_overrides_rule_table() {
        let (engine, _clock) = engine_with_clock();
        let id = engine.enqueue(request("resize")).await.unwrap();
        engine.claim("w1", 1).await.unwrap();

        // The text would classify Permanent, but the handler knows better.
        let outcome = engine
            .report_failed(
                id,
                "w1",
                FailureReport::new("invalid payload shape").with_class(ErrorClass::Transient),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Retried { .. }));
    }

    #[tokio::test]
    async fn custom_classifier_is_injectable() {
        let clock = Arc::new(ManualClock::starting_now());
        let classifier = ErrorClassifier::new(
            vec![ClassifierRule::new("boom", ErrorClass::Permanent)],
            ErrorClass::Transient,
        )
        .expect("valid rules");
        let engine = TaskQueueEngine::in_memory_with_clock(
            EngineConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .with_classifier(classifier);

        let id = engine.enqueue(request("resize")).await.unwrap();
        engine.claim("w1", 1).await.unwrap();
        let outcome = engine
            .report_failed(id, "w1", FailureReport::new("boom"))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn replay_dead_letter_is_claimable_again() {
        let (engine, _clock) = engine_with_clock();
        let id = engine
            .enqueue(request("resize").with_max_attempts(1))
            .await
            .unwrap();
        engine.claim("w1", 1).await.unwrap();
        engine
            .report_failed(id, "w1", FailureReport::new("timeout talking to backend"))
            .await
            .unwrap();

        let new_id = engine.replay_dead_letter(id).await.unwrap();
        let granted = engine.claim("w1", 1).await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].id, new_id);
    }
}
