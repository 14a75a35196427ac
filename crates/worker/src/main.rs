//! Worker binary: runs job executors, the reaper, and queue stats against
//! the Postgres-backed store.
//!
//! Batch orchestration is not a subcommand here: batch state lives in the
//! process that accepted the imports, which schedules its own reconciliation
//! via `BatchOrchestrator::spawn_tick`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use writforge_core::WorkerId;
use writforge_queue::{
    Executor, ExecutorConfig, JobKind, JobOutcome, JobStore, PostgresJobStore, Reaper,
    ReaperConfig, ReaperLedger, WorkerRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "writforge-worker")]
#[command(about = "Background job worker for the judgment pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Claim and execute jobs of one type until interrupted.
    Run {
        /// Job type to work, e.g. entity_resolve, create_judgment, enrich.
        #[arg(long)]
        job_type: String,
        /// Worker identity; defaults to <job-type>-<hostname>-<pid>.
        #[arg(long)]
        worker_id: Option<String>,
        /// Run a single queue pass and exit.
        #[arg(long)]
        once: bool,
        /// Seconds to sleep when the queue is empty.
        #[arg(long, default_value_t = 2)]
        poll_interval: u64,
    },
    /// Sweep stuck and stale jobs back into circulation.
    Reap {
        #[arg(long)]
        once: bool,
        /// Seconds between sweeps.
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Print queue statistics.
    Stats {
        /// Restrict to one job type.
        #[arg(long)]
        job_type: Option<String>,
    },
}

const PIPELINE_KINDS: [JobKind; 3] = [
    JobKind::EntityResolve,
    JobKind::CreateJudgment,
    JobKind::Enrich,
];

fn main() -> anyhow::Result<()> {
    writforge_observability::init();
    let cli = Cli::parse();

    // The runtime outlives every store call; the store bridges its blocking
    // trait methods onto this handle.
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store = Arc::new(
        runtime
            .block_on(PostgresJobStore::connect(&url))
            .context("failed to connect to the job store")?,
    );

    match cli.cmd {
        Cmd::Run {
            job_type,
            worker_id,
            once,
            poll_interval,
        } => run(&runtime, store, job_type, worker_id, once, poll_interval),
        Cmd::Reap { once, interval } => reap(&runtime, store, once, interval),
        Cmd::Stats { job_type } => stats(store, job_type),
    }
}

fn run(
    runtime: &tokio::runtime::Runtime,
    store: Arc<PostgresJobStore>,
    job_type: String,
    worker_id: Option<String>,
    once: bool,
    poll_interval: u64,
) -> anyhow::Result<()> {
    let kind = JobKind::from(job_type);
    let worker_id = WorkerId::new(worker_id.unwrap_or_else(|| {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        format!("{kind}-{hostname}-{}", std::process::id())
    }));

    let registry: Arc<dyn WorkerRegistry> = store.clone();
    let mut executor = Executor::new(store).with_worker_registry(registry);
    for pipeline_kind in PIPELINE_KINDS {
        // Pass-through handlers; deployments embedding this crate register
        // their own stage logic.
        executor.register_handler(pipeline_kind.clone(), move |job| {
            info!(job_id = %job.id, kind = %pipeline_kind, "pass-through handler");
            JobOutcome::Success
        });
    }

    let config = ExecutorConfig::new(kind, worker_id)
        .with_poll_interval(Duration::from_secs(poll_interval));

    if once {
        let cycle = executor.run_once(&config)?;
        info!(?cycle, "single pass finished");
        return Ok(());
    }

    let handle = executor.spawn(config);
    runtime.block_on(tokio::signal::ctrl_c())?;
    info!("shutdown requested");
    handle.shutdown();
    Ok(())
}

fn reap(
    runtime: &tokio::runtime::Runtime,
    store: Arc<PostgresJobStore>,
    once: bool,
    interval: u64,
) -> anyhow::Result<()> {
    let ledger: Arc<dyn ReaperLedger> = store.clone();
    let reaper = Reaper::new(store, ledger, ReaperConfig::default());

    if once {
        let summary = reaper.sweep();
        anyhow::ensure!(!summary.errored, "sweep finished with errors");
        return Ok(());
    }

    let handle = reaper.spawn(Duration::from_secs(interval));
    runtime.block_on(tokio::signal::ctrl_c())?;
    info!("shutdown requested");
    handle.shutdown();
    Ok(())
}

fn stats(store: Arc<PostgresJobStore>, job_type: Option<String>) -> anyhow::Result<()> {
    let kinds: Vec<JobKind> = match job_type {
        Some(t) => vec![JobKind::from(t)],
        None => PIPELINE_KINDS.to_vec(),
    };

    for kind in kinds {
        let counts = store.stats(&kind)?;
        let oldest = store.oldest_pending_age(&kind)?;
        println!(
            "{kind}: pending={} processing={} completed={} failed={} dead_lettered={} oldest_pending={}",
            counts.pending,
            counts.processing,
            counts.completed,
            counts.failed,
            counts.dead_lettered,
            oldest
                .map(|age| format!("{}s", age.num_seconds()))
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    let throughput = store.throughput(chrono::Duration::hours(1))?;
    println!(
        "last hour: completed={} failed={} error_rate={:.1}%",
        throughput.completed,
        throughput.failed,
        throughput.error_rate() * 100.0
    );

    let dead = store.dead_letters(20)?;
    for job in dead {
        println!(
            "dead-letter {} kind={} attempts={} error={}",
            job.id,
            job.kind,
            job.attempts,
            job.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
