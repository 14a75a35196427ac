//! Durable background job queue for the enforcement pipeline.
//!
//! Jobs are claimed with an exclusive worker lease, renewed by heartbeat and
//! reclaimed by the [`reaper::Reaper`] when a worker dies. Enqueues are
//! idempotent on the caller-supplied key. [`store::InMemoryJobStore`] backs
//! tests and single-process runs; [`store::PostgresJobStore`] is the durable
//! implementation.

pub mod executor;
pub mod heartbeat;
pub mod job;
pub mod reaper;
pub mod store;

pub use executor::{CycleResult, Executor, ExecutorConfig, ExecutorHandle, ExecutorStats};
pub use heartbeat::{
    InMemoryReaperLedger, InMemoryWorkerRegistry, ReaperHeartbeat, ReaperLedger, SweepStatus,
    WorkerHeartbeat, WorkerRegistry, WorkerStatus,
};
pub use job::{
    FailDisposition, FailureKind, Job, JobKind, JobOutcome, JobStatus, Lease, NewJob, RetryPolicy,
    DEAD_LETTER_MARKER, DEFAULT_MAX_ATTEMPTS,
};
pub use reaper::{Reaper, ReaperConfig, ReaperHandle, SweepSummary};
pub use store::{
    CohortCounts, InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore, QueueStats,
    ReapPolicy, ThroughputStats,
};
