//! Worker executor: claims jobs of one kind, dispatches to registered
//! handlers, and reports outcomes back to the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use writforge_core::WorkerId;

use crate::heartbeat::WorkerRegistry;
use crate::job::{FailureKind, Job, JobKind, JobOutcome, JobStatus, Lease};
use crate::store::{JobStore, JobStoreError};

/// Handler for one job kind. Pure with respect to the queue: it receives the
/// claimed job and reports an outcome, nothing else.
pub type JobHandler = Box<dyn Fn(&Job) -> JobOutcome + Send + Sync>;

/// Invoked after a job reaches a terminal status (completed or failed);
/// transient re-queues do not fire it. Lets the batch orchestrator observe
/// cohort completions without polling.
pub type TerminalHook = Box<dyn Fn(&Job) + Send + Sync>;

/// Executor configuration for one polling loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Kind this loop claims.
    pub kind: JobKind,
    pub worker_id: WorkerId,
    /// Reported to the worker heartbeat registry.
    pub worker_type: String,
    pub hostname: String,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Lease renewal interval while a handler runs.
    pub heartbeat_interval: Duration,
}

impl ExecutorConfig {
    pub fn new(kind: JobKind, worker_id: WorkerId) -> Self {
        let worker_type = kind.as_str().to_string();
        Self {
            kind,
            worker_id,
            worker_type,
            hostname: hostname(),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Executor runtime counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub leases_lost: u64,
}

/// What one claim cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    /// No eligible job to claim.
    Idle,
    /// A job was executed; carries its status after the outcome landed.
    Processed(JobStatus),
    /// The lease was lost mid-run or before the outcome landed; local work
    /// was abandoned.
    LeaseLost,
}

/// Handle to control a spawned executor loop.
#[derive(Debug)]
pub struct ExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl ExecutorHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        *self.stats.lock().unwrap()
    }
}

/// Claims jobs from a store and runs them through the handler dispatch table.
///
/// Handlers are registered per kind at startup; adding a job kind is a
/// registration, not a code change here.
pub struct Executor<S: JobStore> {
    store: Arc<S>,
    handlers: HashMap<String, JobHandler>,
    registry: Option<Arc<dyn WorkerRegistry>>,
    on_terminal: Option<TerminalHook>,
}

impl<S: JobStore + 'static> Executor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            registry: None,
            on_terminal: None,
        }
    }

    /// Register a handler for a job kind.
    pub fn register_handler<F>(&mut self, kind: JobKind, handler: F)
    where
        F: Fn(&Job) -> JobOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(kind.as_str().to_string(), Box::new(handler));
    }

    /// Report liveness to this registry each loop iteration.
    pub fn with_worker_registry(mut self, registry: Arc<dyn WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Fire this hook whenever a job lands in a terminal status.
    pub fn with_terminal_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.on_terminal = Some(Box::new(hook));
        self
    }

    /// Claim and execute at most one job.
    pub fn run_once(&self, config: &ExecutorConfig) -> Result<CycleResult, JobStoreError> {
        if let Some(registry) = &self.registry {
            registry.beat(&config.worker_id, &config.worker_type, &config.hostname)?;
        }

        let Some(job) = self.store.claim(&config.kind, &config.worker_id)? else {
            return Ok(CycleResult::Idle);
        };
        debug!(job_id = %job.id, kind = %job.kind, worker = %config.worker_id, "claimed job");

        let outcome = self.execute_with_heartbeat(&job, config);
        self.report(&job, outcome, config)
    }

    /// Run the handler while a sidecar thread renews the lease. If the lease
    /// is lost mid-run (job reaped and possibly reclaimed), the handler's
    /// result is discarded rather than written over the new owner's work.
    fn execute_with_heartbeat(&self, job: &Job, config: &ExecutorConfig) -> Option<JobOutcome> {
        let handler = self.handlers.get(job.kind.as_str());

        let lost = AtomicBool::new(false);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let outcome = thread::scope(|scope| {
            // The sidecar takes ownership of the receiver; everything else it
            // touches is a shared reference.
            let lost = &lost;
            scope.spawn(move || {
                while let Err(mpsc::RecvTimeoutError::Timeout) =
                    stop_rx.recv_timeout(config.heartbeat_interval)
                {
                    match self.store.heartbeat(job.id, &config.worker_id) {
                        Ok(Lease::Held) => {}
                        Ok(Lease::Lost) => {
                            lost.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "heartbeat failed");
                        }
                    }
                }
            });

            let outcome = match handler {
                Some(handler) => handler(job),
                None => JobOutcome::Discard(format!("no handler registered for kind {}", job.kind)),
            };
            drop(stop_tx);
            outcome
        });

        if lost.load(Ordering::SeqCst) {
            warn!(job_id = %job.id, worker = %config.worker_id, "lease lost mid-run, abandoning result");
            return None;
        }
        Some(outcome)
    }

    fn report(
        &self,
        job: &Job,
        outcome: Option<JobOutcome>,
        config: &ExecutorConfig,
    ) -> Result<CycleResult, JobStoreError> {
        let lease = match &outcome {
            None => return Ok(CycleResult::LeaseLost),
            Some(JobOutcome::Success) => self.store.complete(job.id, &config.worker_id)?,
            Some(JobOutcome::Retry(error)) => {
                self.store
                    .fail(job.id, &config.worker_id, error, FailureKind::Transient)?
            }
            Some(JobOutcome::Discard(error)) => {
                self.store
                    .fail(job.id, &config.worker_id, error, FailureKind::Permanent)?
            }
        };

        if lease == Lease::Lost {
            warn!(job_id = %job.id, worker = %config.worker_id, "job reclaimed before outcome landed");
            return Ok(CycleResult::LeaseLost);
        }

        // Re-read to learn how the failure resolved (requeued vs terminal).
        let Some(after) = self.store.get(job.id)? else {
            return Err(JobStoreError::NotFound(job.id));
        };
        match after.status {
            JobStatus::Completed => {
                debug!(job_id = %after.id, "job completed");
            }
            JobStatus::Failed => {
                warn!(job_id = %after.id, error = ?after.last_error, "job failed terminally");
            }
            _ => {
                debug!(
                    job_id = %after.id,
                    attempts = after.attempts,
                    next_run_at = ?after.next_run_at,
                    "job requeued with backoff"
                );
            }
        }
        if after.status.is_terminal()
            && let Some(hook) = &self.on_terminal
        {
            hook(&after);
        }
        Ok(CycleResult::Processed(after.status))
    }

    /// Spawn the polling loop in a background thread.
    pub fn spawn(self, config: ExecutorConfig) -> ExecutorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let name = format!("executor-{}", config.kind);
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                executor_loop(self, config, shutdown_rx, stats_clone);
            })
            .expect("failed to spawn executor thread");

        ExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: Executor<S>,
    config: ExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(kind = %config.kind, worker = %config.worker_id, "executor started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match executor.run_once(&config) {
            Ok(CycleResult::Processed(status)) => {
                let mut s = stats.lock().unwrap();
                s.processed += 1;
                match status {
                    JobStatus::Completed => s.succeeded += 1,
                    JobStatus::Failed => s.failed += 1,
                    _ => s.requeued += 1,
                }
            }
            Ok(CycleResult::LeaseLost) => {
                let mut s = stats.lock().unwrap();
                s.processed += 1;
                s.leases_lost += 1;
            }
            Ok(CycleResult::Idle) => {
                // Empty poll; also the shutdown check interval.
                if shutdown_rx.recv_timeout(config.poll_interval).is_ok() {
                    break;
                }
            }
            Err(e) => {
                error!(kind = %config.kind, error = %e, "claim cycle failed");
                if shutdown_rx.recv_timeout(config.poll_interval).is_ok() {
                    break;
                }
            }
        }
    }

    if let Some(registry) = &executor.registry {
        let _ = registry.mark_stopped(&config.worker_id);
    }
    info!(kind = %config.kind, worker = %config.worker_id, "executor stopped");
}
