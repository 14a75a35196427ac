//! Job storage: trait contract plus in-memory and Postgres implementations.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use chrono::Duration;

use writforge_core::{JobId, WorkerId};

use crate::job::{FailureKind, Job, JobKind, Lease, NewJob};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// What the reaper does with a stuck `processing` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReapPolicy {
    /// Return the job to `pending` for another worker. Once a job has been
    /// reaped as many times as its retry budget it is dead-lettered instead,
    /// so a job that hangs every worker cannot loop forever.
    #[default]
    Requeue,
    /// Terminal failure with an explanatory error.
    Fail,
}

/// Per-kind counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Subset of `failed` carrying the dead-letter marker.
    pub dead_lettered: usize,
}

/// Terminal outcomes over a trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ThroughputStats {
    pub completed: usize,
    pub failed: usize,
}

impl ThroughputStats {
    /// Fraction of terminal outcomes that were failures (0 when idle).
    pub fn error_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64
        }
    }
}

/// Counts for one cohort, identified by an idempotency-key prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CohortCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl CohortCounts {
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.completed + self.failed == self.total
    }
}

/// Durable job store contract.
///
/// `claim` must be atomic under concurrent callers (exactly one worker wins a
/// given job); `heartbeat`/`complete`/`fail` must verify current ownership so
/// a reaped-and-reclaimed job is never corrupted by a stale worker's delayed
/// write.
pub trait JobStore: Send + Sync {
    /// Insert a `pending` job, deduplicated on `idempotency_key`: an already
    /// seen key returns the existing job unchanged.
    fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError>;

    /// Fetch a job by id.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim the oldest eligible pending job of a kind. Eligible
    /// means `next_run_at` is null or past; ordering is FIFO by `created_at`.
    fn claim(&self, kind: &JobKind, worker_id: &WorkerId) -> Result<Option<Job>, JobStoreError>;

    /// Renew the lease on a processing job. `Lease::Lost` when the job is no
    /// longer owned by `worker_id`.
    fn heartbeat(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Lease, JobStoreError>;

    /// Transition `processing -> completed`; a no-op returning `Lease::Lost`
    /// if the job was reclaimed.
    fn complete(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Lease, JobStoreError>;

    /// Record a failure. Transient failures consume retry budget and re-queue
    /// with exponential backoff; permanent failures dead-letter immediately.
    fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<Lease, JobStoreError>;

    // Observability reads backing the operator reporting views.

    /// Counts by status for one kind.
    fn stats(&self, kind: &JobKind) -> Result<QueueStats, JobStoreError>;

    /// Age of the oldest claimable pending job of a kind.
    fn oldest_pending_age(&self, kind: &JobKind) -> Result<Option<Duration>, JobStoreError>;

    /// Currently processing jobs of a kind (in-flight detail).
    fn in_flight(&self, kind: &JobKind) -> Result<Vec<Job>, JobStoreError>;

    /// Dead-lettered jobs, newest first.
    fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs currently owned by a worker.
    fn active_jobs(&self, worker_id: &WorkerId) -> Result<Vec<Job>, JobStoreError>;

    /// Terminal outcomes whose last update falls within the trailing window.
    fn throughput(&self, window: Duration) -> Result<ThroughputStats, JobStoreError>;

    /// Counts for the cohort of jobs whose idempotency key starts with the
    /// given prefix. Used by the orchestrator's reconciliation tick.
    fn cohort_counts(&self, kind: &JobKind, key_prefix: &str)
    -> Result<CohortCounts, JobStoreError>;

    // Reaper sweeps.

    /// Reclaim processing jobs whose lease anchor is older than the
    /// threshold. Returns the jobs as they look after the sweep.
    fn sweep_stuck(
        &self,
        stuck_after: Duration,
        policy: ReapPolicy,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Force-fail pending jobs older than the ceiling (safety valve against
    /// payloads that can never succeed aging forever).
    fn sweep_stale_pending(&self, ceiling: Duration) -> Result<Vec<Job>, JobStoreError>;
}
