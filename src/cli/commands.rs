//! CLI command definitions for taskforge.
//!
//! The `simulate` command drives the whole engine in-process: it enqueues a
//! batch of synthetic tasks, runs a worker pool with randomly failing
//! handlers alongside the reaper and boost sweeps, and prints the resulting
//! lifecycle and dead-letter summary. The `classify` command checks a
//! classifier rule table against a sample error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::TaskQueueEngine;
use crate::metrics::init_metrics;
use crate::retry::{BackoffPolicy, ErrorClassifier};
use crate::store::{DeadLetterFilter, EnqueueRequest, Task};
use crate::worker::{HandlerRegistry, TaskError, TaskHandler, WorkerPool, WorkerPoolConfig};

/// Task kinds used by the simulation.
const SIMULATED_KINDS: &[&str] = &["render", "notify"];

/// Task queue engine with atomic claiming, retries and worker liveness.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Task queue engine: atomic claiming, retry scheduling and worker liveness")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run an in-process simulation of the full engine.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Classify a sample error against a rule table.
    Classify(ClassifyArgs),
}

/// Arguments for `taskforge simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of workers in the pool.
    #[arg(short, long, default_value = "4")]
    pub workers: usize,

    /// Number of tasks to enqueue.
    #[arg(short = 'n', long, default_value = "100")]
    pub tasks: usize,

    /// Probability that a handler invocation fails transiently.
    #[arg(long, default_value = "0.2")]
    pub fail_rate: f64,

    /// Probability that a handler invocation fails permanently.
    #[arg(long, default_value = "0.02")]
    pub permanent_rate: f64,

    /// Tasks claimed per poll.
    #[arg(long, default_value = "4")]
    pub batch_size: usize,

    /// Give up if the queue has not drained after this many seconds.
    #[arg(long, default_value = "60")]
    pub timeout_secs: u64,
}

/// Arguments for `taskforge classify`.
#[derive(Parser, Debug)]
pub struct ClassifyArgs {
    /// YAML rule table; the built-in rules are used when omitted.
    #[arg(short, long)]
    pub rules: Option<String>,

    /// Task kind the error was reported against.
    #[arg(short, long, default_value = "")]
    pub kind: String,

    /// The error text to classify.
    pub error: String,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the CLI with parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Simulate(args) => run_simulate(args).await,
        Commands::Classify(args) => run_classify(args),
    }
}

/// Handler that fails a configurable fraction of invocations.
struct SimulatedHandler {
    fail_rate: f64,
    permanent_rate: f64,
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        use rand::RngExt;

        let (work_ms, roll) = {
            let mut rng = rand::rng();
            (rng.random_range(1..20u64), rng.random_range(0.0..1.0f64))
        };
        tokio::time::sleep(Duration::from_millis(work_ms)).await;

        if roll < self.permanent_rate {
            Err(TaskError::permanent(format!(
                "simulated permanent failure in {}",
                task.kind
            )))
        } else if roll < self.permanent_rate + self.fail_rate {
            Err(TaskError::transient(format!(
                "simulated connection timeout in {}",
                task.kind
            )))
        } else {
            Ok(())
        }
    }
}

async fn run_simulate(args: SimulateArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics initialization failed, continuing without");
    }

    // Short leases and fast backoff so the simulation shows full lifecycle
    // churn in seconds instead of hours.
    let config = EngineConfig::from_env()?
        .with_backoff(
            BackoffPolicy::new()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(2)),
        )
        .with_lease_duration(Duration::from_secs(10))
        .with_worker_lease_duration(Duration::from_secs(5))
        .with_reaper_interval(Duration::from_secs(1))
        .with_boost_interval(Duration::from_secs(2));
    config.validate()?;

    let engine = Arc::new(TaskQueueEngine::in_memory(config));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let reaper_handle = engine.spawn_reaper(shutdown_tx.subscribe());
    let boost_handle = engine.spawn_boost_loop(shutdown_tx.subscribe());

    // Enqueue the synthetic workload with a spread of priorities.
    let requests: Vec<EnqueueRequest> = (0..args.tasks)
        .map(|i| {
            use rand::RngExt;
            let kind = SIMULATED_KINDS[i % SIMULATED_KINDS.len()];
            let priority = rand::rng().random_range(0..10);
            EnqueueRequest::new(kind, serde_json::json!({ "seq": i }))
                .with_priority(priority)
        })
        .collect();
    engine.enqueue_batch(requests).await?;
    info!(tasks = args.tasks, "Workload enqueued");

    let mut handlers = HandlerRegistry::new();
    for kind in SIMULATED_KINDS {
        handlers.register(
            *kind,
            Arc::new(SimulatedHandler {
                fail_rate: args.fail_rate,
                permanent_rate: args.permanent_rate,
            }),
        );
    }

    let pool_config = WorkerPoolConfig::new(args.workers)
        .with_batch_size(args.batch_size)
        .with_idle_poll_min(Duration::from_millis(10))
        .with_idle_poll_max(Duration::from_millis(500));
    let mut pool = WorkerPool::new(pool_config, Arc::clone(&engine), handlers);
    pool.start().await?;

    // Wait until every task has reached a terminal state.
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    loop {
        let counts = engine.counts().await?;
        if counts.claimable == 0 && counts.owned == 0 {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                claimable = counts.claimable,
                owned = counts.owned,
                "Simulation timed out before the queue drained"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pool.shutdown().await?;
    let _ = shutdown_tx.send(());
    let _ = reaper_handle.await;
    let _ = boost_handle.await;

    let counts = engine.counts().await?;
    let stats = pool.stats();
    info!(
        completed = counts.completed,
        dead_lettered = counts.dead_lettered,
        processed = stats.total_processed(),
        success_rate_pct = stats.success_rate(),
        avg_task_ms = stats.average_task_duration.as_millis() as u64,
        "Simulation finished"
    );

    let dead = engine
        .inspect_dead_letters(&DeadLetterFilter::any().with_limit(20))
        .await?;
    for entry in &dead {
        info!(
            task_id = %entry.task_id,
            kind = %entry.kind,
            class = %entry.error_class,
            attempts = entry.attempt_count,
            error = %entry.final_error,
            "Dead letter"
        );
    }

    Ok(())
}

fn run_classify(args: ClassifyArgs) -> anyhow::Result<()> {
    let classifier = match args.rules {
        Some(path) => ErrorClassifier::from_yaml_file(&path)?,
        None => ErrorClassifier::with_default_rules(),
    };

    let class = classifier.classify(&args.kind, &args.error);
    println!("{class}");
    Ok(())
}
