//! Worker pool for processing tasks from the engine.
//!
//! This module provides a pool of workers that poll the engine for work.
//! Each worker runs as an independent async task executing the
//! claim -> process -> report loop; workers share no state beyond pool
//! statistics, and all coordination happens through the engine.
//!
//! # Features
//!
//! - Configurable number of workers and claim batch size
//! - Adaptive idle backoff: fast polls while work flows, capped exponential
//!   slowdown when the queue runs dry
//! - Per-task local timeout, reported as a failure rather than left to
//!   lease expiry
//! - Liveness heartbeats per worker, with re-registration after reaping
//! - Graceful shutdown with broadcast channel
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{HandlerRegistry, TaskError};
use crate::engine::{EngineError, TaskQueueEngine};
use crate::metrics::MetricsCollector;
use crate::store::{FailureOutcome, ReportOutcome, Task};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Engine error during pool lifecycle.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Tasks claimed per poll; bounds store round-trips under load.
    pub batch_size: usize,
    /// Idle poll delay after finding work (the floor).
    pub idle_poll_min: Duration,
    /// Idle poll delay ceiling reached by doubling on empty polls.
    pub idle_poll_max: Duration,
    /// Maximum time allowed for processing a single task.
    pub task_timeout: Duration,
    /// How often each worker renews its liveness lease.
    pub heartbeat_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            batch_size: 1,
            idle_poll_min: Duration::from_millis(100),
            idle_poll_max: Duration::from_secs(5),
            task_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the claim batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the idle poll floor.
    pub fn with_idle_poll_min(mut self, min: Duration) -> Self {
        self.idle_poll_min = min;
        self
    }

    /// Sets the idle poll ceiling.
    pub fn with_idle_poll_max(mut self, max: Duration) -> Self {
        self.idle_poll_max = max;
        self
    }

    /// Sets the per-task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing tasks.
    pub active_workers: usize,
    /// Total number of tasks completed successfully.
    pub tasks_completed: u64,
    /// Total number of tasks that failed.
    pub tasks_failed: u64,
    /// Average task processing duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_tasks = completed + failed;
        let average_duration = if total_tasks > 0 {
            Duration::from_millis(total_duration_ms / total_tasks)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers polling the engine.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    engine: Arc<TaskQueueEngine>,
    handlers: Arc<HandlerRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool over an engine and a handler registry.
    pub fn new(
        config: WorkerPoolConfig,
        engine: Arc<TaskQueueEngine>,
        handlers: HandlerRegistry,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            engine,
            handlers: Arc::new(handlers),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Each worker registers with the liveness registry (its capabilities
    /// are the registry's handler kinds) and begins polling immediately. A
    /// separate heartbeat task per worker keeps the lease renewed even
    /// while a long task is being processed.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or the engine error if worker registration fails.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let capabilities = self.handlers.kinds();

        for i in 0..self.config.num_workers {
            let worker_id = format!("worker-{}", i);
            self.engine
                .register_worker(&worker_id, capabilities.clone())
                .await?;

            self.worker_handles
                .push(self.spawn_heartbeat(worker_id.clone(), capabilities.clone()));

            let worker = Worker {
                id: worker_id,
                engine: Arc::clone(&self.engine),
                handlers: Arc::clone(&self.handlers),
                shutdown_rx: self.shutdown_tx.subscribe(),
                batch_size: self.config.batch_size,
                idle_poll_min: self.config.idle_poll_min,
                idle_poll_max: self.config.idle_poll_max,
                task_timeout: self.config.task_timeout,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(async move {
                worker.run().await;
            }));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal to all workers and waits for them to finish
    /// their current tasks.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await {
            Ok(()) => {
                self.is_running.store(false, Ordering::SeqCst);
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Spawns the heartbeat loop for one worker. If a heartbeat comes back
    /// `UnknownWorker` the worker was reaped (its tasks are already being
    /// reclaimed), so it re-registers and carries on.
    fn spawn_heartbeat(&self, worker_id: String, capabilities: Vec<String>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.heartbeat(&worker_id).await {
                            warn!(worker_id = %worker_id, error = %e, "Heartbeat rejected, re-registering");
                            if let Err(e) = engine.register_worker(&worker_id, capabilities.clone()).await {
                                error!(worker_id = %worker_id, error = %e, "Re-registration failed");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

/// A single worker polling the engine for tasks.
struct Worker {
    id: String,
    engine: Arc<TaskQueueEngine>,
    handlers: Arc<HandlerRegistry>,
    shutdown_rx: broadcast::Receiver<()>,
    batch_size: usize,
    idle_poll_min: Duration,
    idle_poll_max: Duration,
    task_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop: claim, process, report, until shutdown.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        let mut idle_delay = self.idle_poll_min;

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // We missed some signals, but since it's shutdown, just check again
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    // No shutdown signal, continue processing
                }
            }

            match self.engine.claim(&self.id, self.batch_size).await {
                Ok(tasks) if !tasks.is_empty() => {
                    idle_delay = self.idle_poll_min;
                    for task in tasks {
                        self.process_task(task).await;
                    }
                }
                Ok(_) => {
                    debug!(worker_id = %self.id, "No tasks available");
                    idle_delay = self.idle_wait(idle_delay).await;
                }
                Err(e) => {
                    // Store trouble: back off the poll itself, same shape
                    // as the empty-queue backoff.
                    error!(worker_id = %self.id, error = %e, "Failed to claim tasks");
                    idle_delay = self.idle_wait(idle_delay).await;
                }
            }
        }

        // Best-effort deregistration so the reaper has nothing to do for us.
        if let Err(e) = self.engine.deregister_worker(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Deregistration failed");
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps the current idle delay, then returns the doubled (capped)
    /// delay for the next empty poll.
    async fn idle_wait(&self, delay: Duration) -> Duration {
        tokio::time::sleep(delay).await;
        delay.saturating_mul(2).min(self.idle_poll_max)
    }

    /// Processes a single claimed task.
    async fn process_task(&self, task: Task) {
        let task_id = task.id;
        let kind = task.kind.clone();
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            kind = %kind,
            attempt = task.attempt_count + 1,
            "Processing task"
        );

        self.stats.increment_active();
        self.metrics.worker_busy();

        let result = match self.handlers.get(&kind) {
            Some(handler) => {
                match tokio::time::timeout(self.task_timeout, handler.handle(&task)).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::transient(format!(
                        "handler timed out after {:?}",
                        self.task_timeout
                    ))),
                }
            }
            None => Err(TaskError::permanent(format!(
                "no handler registered for kind '{}'",
                kind
            ))),
        };

        let duration = start_time.elapsed();
        self.stats.decrement_active();
        self.metrics.worker_idle();

        match result {
            Ok(()) => match self.engine.report_complete(task_id, &self.id).await {
                Ok(ReportOutcome::Ok) => {
                    self.stats.record_completion(duration);
                    self.metrics
                        .record_task_duration(&kind, duration.as_secs_f64());
                    debug!(
                        worker_id = %self.id,
                        task_id = %task_id,
                        duration_ms = duration.as_millis() as u64,
                        "Task completed"
                    );
                }
                Ok(ReportOutcome::Conflict) => {
                    // Someone reclaimed the task while we worked; our
                    // result is discarded and another worker redoes it.
                    warn!(
                        worker_id = %self.id,
                        task_id = %task_id,
                        "Task finished but ownership was lost"
                    );
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        task_id = %task_id,
                        error = %e,
                        "Failed to report completion"
                    );
                }
            },
            Err(task_error) => {
                self.stats.record_failure(duration);
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %task_error,
                    remaining_attempts = task.remaining_attempts().saturating_sub(1),
                    "Task failed"
                );

                match self
                    .engine
                    .report_failed(task_id, &self.id, task_error.into_report())
                    .await
                {
                    Ok(FailureOutcome::Conflict) => {
                        warn!(
                            worker_id = %self.id,
                            task_id = %task_id,
                            "Failure report lost ownership race"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            worker_id = %self.id,
                            task_id = %task_id,
                            error = %e,
                            "Failed to report failure"
                        );
                    }
                }
            }
        }
    }
}
