//! Core job model: kinds, statuses, retry policy, lifecycle transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use writforge_core::{JobId, WorkerId};

/// Marker prefix on `last_error` identifying a dead-lettered job.
///
/// Dead-letter is a convention on terminal `failed` jobs rather than a fifth
/// status: marked jobs are excluded from retry scans but stay queryable for
/// operators.
pub const DEAD_LETTER_MARKER: &str = "[dead-letter]";

/// Job kind for routing to the appropriate handler.
///
/// The set of kinds grows over time; `Custom` keeps the enumeration open so a
/// new kind is a handler registration, not a schema change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobKind {
    /// Resolve imported debtor rows against known entities.
    EntityResolve,
    /// Create a judgment record from a resolved entity.
    CreateJudgment,
    /// Enrich a judgment with external data (addresses, assets, employers).
    Enrich,
    /// Score a judgment into an enforcement tier.
    TierScore,
    /// Generate an enforcement packet for filing.
    GeneratePacket,
    /// Application-defined kind.
    Custom(String),
}

impl JobKind {
    pub fn as_str(&self) -> &str {
        match self {
            JobKind::EntityResolve => "entity_resolve",
            JobKind::CreateJudgment => "create_judgment",
            JobKind::Enrich => "enrich",
            JobKind::TierScore => "tier_score",
            JobKind::GeneratePacket => "generate_packet",
            JobKind::Custom(kind) => kind,
        }
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "entity_resolve" => JobKind::EntityResolve,
            "create_judgment" => JobKind::CreateJudgment,
            "enrich" => JobKind::Enrich,
            "tier_score" => JobKind::TierScore,
            "generate_packet" => JobKind::GeneratePacket,
            _ => JobKind::Custom(value),
        }
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<JobKind> for String {
    fn from(value: JobKind) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed (or waiting out a backoff window).
    Pending,
    /// Claimed and owned by a worker.
    Processing,
    /// Finished successfully (terminal).
    Completed,
    /// Finished unsuccessfully (terminal; dead-lettered when marked).
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Whether a failure should consume retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Dependency timeout, network blip: retry with backoff.
    Transient,
    /// Malformed payload or other error that can never succeed: straight to
    /// dead-letter without burning retries.
    Permanent,
}

/// Result a handler reports for one claimed job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Work done; mark the job completed.
    Success,
    /// Transient failure; re-queue with backoff (or dead-letter once retries
    /// are exhausted).
    Retry(String),
    /// Permanent failure; dead-letter immediately.
    Discard(String),
}

/// Result of an ownership-checked mutation (`heartbeat`/`complete`/`fail`).
///
/// `Lost` means the job was reaped and possibly reclaimed; the caller must
/// abandon local work immediately rather than write stale results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    Held,
    Lost,
}

/// Retry backoff configuration: `base * 2^attempts`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.min(24) as i32);
        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }
}

/// Default retry budget for a new job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A durable queue job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Opaque to the queue; only the handler interprets it.
    pub payload: serde_json::Value,
    /// Caller-supplied deduplication token, unique per logical unit of work.
    pub idempotency_key: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest eligible claim time while pending (backoff scheduling).
    pub next_run_at: Option<DateTime<Utc>>,
    /// Owner while `processing`.
    pub worker_id: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last lease renewal; claim time until the first heartbeat lands.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Times this job was forcibly reclaimed from a dead worker.
    pub reap_count: u32,
}

/// Parameters for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(
        kind: JobKind,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload,
            idempotency_key: idempotency_key.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// How a `fail` transition resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailDisposition {
    /// Returned to pending, eligible at the given time.
    Retried(DateTime<Utc>),
    /// Terminal; `last_error` carries the dead-letter marker.
    DeadLettered,
}

impl Job {
    pub(crate) fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: new.kind,
            payload: new.payload,
            idempotency_key: new.idempotency_key,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            next_run_at: None,
            worker_id: None,
            claimed_at: None,
            started_at: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
            last_error: None,
            reap_count: 0,
        }
    }

    /// Whether this pending job may be claimed right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at.is_none_or(|at| at <= now)
    }

    /// Whether this job is owned by the given worker.
    pub fn is_owned_by(&self, worker_id: &WorkerId) -> bool {
        self.status == JobStatus::Processing && self.worker_id.as_ref() == Some(worker_id)
    }

    /// Whether this job sits in the dead-letter state.
    pub fn is_dead_lettered(&self) -> bool {
        self.status == JobStatus::Failed
            && self
                .last_error
                .as_deref()
                .is_some_and(|e| e.starts_with(DEAD_LETTER_MARKER))
    }

    /// Timestamp the lease is measured from: the last heartbeat, falling back
    /// to the claim time.
    pub fn lease_anchor(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at.or(self.claimed_at)
    }

    pub(crate) fn mark_claimed(&mut self, worker_id: WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.worker_id = Some(worker_id);
        self.claimed_at = Some(now);
        self.started_at = Some(now);
        self.last_heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.next_run_at = None;
        self.updated_at = now;
    }

    /// Apply a failure: backoff re-queue for transient failures with budget
    /// left, dead-letter otherwise.
    pub(crate) fn mark_failed(
        &mut self,
        policy: &RetryPolicy,
        kind: FailureKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> FailDisposition {
        self.updated_at = now;
        match kind {
            FailureKind::Transient => {
                self.attempts += 1;
                if self.attempts < self.max_attempts {
                    let next = now
                        + chrono::Duration::from_std(policy.delay_for_attempt(self.attempts))
                            .unwrap_or_default();
                    self.status = JobStatus::Pending;
                    self.next_run_at = Some(next);
                    self.worker_id = None;
                    self.last_error = Some(error.to_string());
                    FailDisposition::Retried(next)
                } else {
                    self.dead_letter(error, now);
                    FailDisposition::DeadLettered
                }
            }
            FailureKind::Permanent => {
                self.dead_letter(error, now);
                FailDisposition::DeadLettered
            }
        }
    }

    pub(crate) fn dead_letter(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.next_run_at = None;
        self.last_error = Some(format!("{DEAD_LETTER_MARKER} {error}"));
        self.updated_at = now;
    }

    /// Reclaim a stuck job: back to pending with `reap_count` bumped.
    pub(crate) fn requeue_reaped(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.next_run_at = None;
        self.last_error = Some(error.to_string());
        self.reap_count += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            JobKind::EntityResolve,
            JobKind::CreateJudgment,
            JobKind::Enrich,
            JobKind::TierScore,
            JobKind::GeneratePacket,
            JobKind::Custom("recalc_liens".to_string()),
        ] {
            assert_eq!(JobKind::from(kind.as_str()), kind);
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(600));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(600));
    }

    #[test]
    fn transient_failure_requeues_until_budget_exhausted() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let mut job = Job::from_new(
            NewJob::new(JobKind::Enrich, serde_json::json!({}), "k-1").with_max_attempts(2),
            now,
        );
        job.mark_claimed(WorkerId::new("w1"), now);

        let d = job.mark_failed(&policy, FailureKind::Transient, "timeout", now);
        assert!(matches!(d, FailDisposition::Retried(_)));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.worker_id.is_none());
        assert!(job.next_run_at.unwrap() > now);

        job.mark_claimed(WorkerId::new("w1"), now);
        let d = job.mark_failed(&policy, FailureKind::Transient, "timeout", now);
        assert_eq!(d, FailDisposition::DeadLettered);
        assert!(job.is_dead_lettered());
    }

    #[test]
    fn permanent_failure_skips_retry_budget() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let mut job = Job::from_new(
            NewJob::new(JobKind::EntityResolve, serde_json::json!({}), "k-2"),
            now,
        );
        job.mark_claimed(WorkerId::new("w1"), now);

        let d = job.mark_failed(&policy, FailureKind::Permanent, "payload missing debtor", now);
        assert_eq!(d, FailDisposition::DeadLettered);
        assert_eq!(job.attempts, 0);
        assert!(job.is_dead_lettered());
        assert!(job.last_error.unwrap().contains("payload missing debtor"));
    }

    #[test]
    fn backoff_scheduling_gates_claimability() {
        let now = Utc::now();
        let mut job = Job::from_new(
            NewJob::new(JobKind::TierScore, serde_json::json!({}), "k-3"),
            now,
        );
        assert!(job.is_claimable(now));

        job.next_run_at = Some(now + chrono::Duration::seconds(60));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(61)));
    }

    proptest! {
        /// Backoff grows strictly with each attempt until it reaches the cap.
        #[test]
        fn backoff_is_monotonic(base_secs in 1u64..120, attempts in 2u32..16) {
            let policy = RetryPolicy {
                base_delay: Duration::from_secs(base_secs),
                max_delay: Duration::from_secs(base_secs * 1000),
            };
            let mut last = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = policy.delay_for_attempt(attempt);
                prop_assert!(delay >= last);
                prop_assert!(delay <= policy.max_delay);
                if delay < policy.max_delay {
                    prop_assert!(delay > last);
                }
                last = delay;
            }
        }
    }
}
