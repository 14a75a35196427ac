//! Postgres-backed job store.
//!
//! The atomic claim is a single conditional `UPDATE ... WHERE id = (SELECT
//! ... FOR UPDATE SKIP LOCKED) RETURNING *`, so exactly one worker receives a
//! given job even under many concurrent claimers. All ownership-checked
//! mutations (`heartbeat`/`complete`/`fail`) include `worker_id` and
//! `status = 'processing'` in the `WHERE` clause, so a reaped-and-reclaimed
//! job cannot be corrupted by a stale worker's delayed write.
//!
//! Schema lives in `crates/queue/schema.sql`.
//!
//! ## Runtime bridging
//!
//! The `JobStore` trait is synchronous (workers are plain polling threads);
//! SQLx is async. The store holds a tokio runtime handle captured at
//! construction and bridges with `Handle::block_on`. Call trait methods from
//! ordinary threads, not from inside the runtime itself.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;

use writforge_core::{JobId, WorkerId};

use super::{CohortCounts, JobStore, JobStoreError, QueueStats, ReapPolicy, ThroughputStats};
use crate::heartbeat::{
    ReaperHeartbeat, ReaperLedger, SweepStatus, WorkerHeartbeat, WorkerRegistry, WorkerStatus,
};
use crate::job::{
    DEAD_LETTER_MARKER, FailureKind, Job, JobKind, JobStatus, Lease, NewJob, RetryPolicy,
};

const JOB_COLUMNS: &str = "id, kind, payload, idempotency_key, status, attempts, max_attempts, \
     next_run_at, worker_id, claimed_at, started_at, last_heartbeat_at, created_at, updated_at, \
     last_error, reap_count";

/// Postgres `JobStore` (also backs the worker registry and reaper ledger).
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    handle: Handle,
    retry_policy: RetryPolicy,
}

impl PostgresJobStore {
    /// Wrap an existing pool. The handle must belong to a runtime that
    /// outlives the store.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool,
            handle,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Connect to the given database URL.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    async fn enqueue_async(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let id = JobId::new();
        let sql = format!(
            "INSERT INTO jobs (id, kind, payload, idempotency_key, max_attempts) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(new.kind.as_str())
            .bind(&new.payload)
            .bind(&new.idempotency_key)
            .bind(new.max_attempts as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

        // Conflict means the key was already seen: return the existing job
        // unchanged (idempotent enqueue, never a duplicate row).
        match row {
            Some(row) => job_from_row(&row),
            None => {
                let sql =
                    format!("SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1");
                let row = sqlx::query(&sql)
                    .bind(&new.idempotency_key)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("enqueue_lookup", e))?;
                job_from_row(&row)
            }
        }
    }

    async fn get_async(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_async(
        &self,
        kind: &JobKind,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET \
                 status = 'processing', \
                 worker_id = $2, \
                 claimed_at = NOW(), \
                 started_at = NOW(), \
                 last_heartbeat_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE kind = $1 \
                   AND status = 'pending' \
                   AND (next_run_at IS NULL OR next_run_at <= NOW()) \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(worker_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Resolve an ownership-guarded update that touched no rows:
    /// distinguishes "job gone" from "job exists but reclaimed".
    async fn lease_after_update(
        &self,
        operation: &str,
        rows_affected: u64,
        job_id: JobId,
    ) -> Result<Lease, JobStoreError> {
        if rows_affected > 0 {
            return Ok(Lease::Held);
        }
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        match exists {
            Some(_) => Ok(Lease::Lost),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    async fn heartbeat_async(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<Lease, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET last_heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(job_id.as_uuid())
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        self.lease_after_update("heartbeat", result.rows_affected(), job_id)
            .await
    }

    async fn complete_async(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<Lease, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', next_run_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(job_id.as_uuid())
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;
        self.lease_after_update("complete", result.rows_affected(), job_id)
            .await
    }

    async fn fail_async(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<Lease, JobStoreError> {
        let transient = kind == FailureKind::Transient;
        let dead_letter_error = format!("{DEAD_LETTER_MARKER} {error}");
        let base_secs = self.retry_policy.base_delay.as_secs_f64();
        let max_secs = self.retry_policy.max_delay.as_secs_f64();

        // Retry-or-dead-letter decided in one statement: transient failures
        // with budget left go back to pending with capped exponential
        // backoff, everything else is terminal with the dead-letter marker.
        let result = sqlx::query(
            "UPDATE jobs SET \
                 attempts = CASE WHEN $3 THEN attempts + 1 ELSE attempts END, \
                 status = CASE WHEN $3 AND attempts + 1 < max_attempts \
                     THEN 'pending' ELSE 'failed' END, \
                 next_run_at = CASE WHEN $3 AND attempts + 1 < max_attempts \
                     THEN NOW() + make_interval(secs => LEAST($6 * POWER(2, attempts + 1), $7)) \
                     ELSE NULL END, \
                 worker_id = CASE WHEN $3 AND attempts + 1 < max_attempts \
                     THEN NULL ELSE worker_id END, \
                 last_error = CASE WHEN $3 AND attempts + 1 < max_attempts \
                     THEN $4 ELSE $5 END, \
                 updated_at = NOW() \
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
        )
        .bind(job_id.as_uuid())
        .bind(worker_id.as_str())
        .bind(transient)
        .bind(error)
        .bind(&dead_letter_error)
        .bind(base_secs)
        .bind(max_secs)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        self.lease_after_update("fail", result.rows_affected(), job_id)
            .await
    }

    async fn stats_async(&self, kind: &JobKind) -> Result<QueueStats, JobStoreError> {
        let row = sqlx::query(
            "SELECT \
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                 COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                 COUNT(*) FILTER (WHERE status = 'failed' AND last_error LIKE $2 || '%') \
                     AS dead_lettered \
             FROM jobs WHERE kind = $1",
        )
        .bind(kind.as_str())
        .bind(DEAD_LETTER_MARKER)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        Ok(QueueStats {
            pending: count(&row, "pending")?,
            processing: count(&row, "processing")?,
            completed: count(&row, "completed")?,
            failed: count(&row, "failed")?,
            dead_lettered: count(&row, "dead_lettered")?,
        })
    }

    async fn oldest_pending_age_async(
        &self,
        kind: &JobKind,
    ) -> Result<Option<Duration>, JobStoreError> {
        let row = sqlx::query(
            "SELECT MIN(created_at) AS oldest FROM jobs \
             WHERE kind = $1 AND status = 'pending' \
               AND (next_run_at IS NULL OR next_run_at <= NOW())",
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("oldest_pending_age", e))?;

        let oldest: Option<DateTime<Utc>> = row
            .try_get("oldest")
            .map_err(|e| JobStoreError::Storage(format!("oldest_pending_age: {e}")))?;
        Ok(oldest.map(|at| Utc::now() - at))
    }

    async fn in_flight_async(&self, kind: &JobKind) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE kind = $1 AND status = 'processing' ORDER BY claimed_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("in_flight", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn dead_letters_async(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'failed' AND last_error LIKE $1 || '%' \
             ORDER BY updated_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(DEAD_LETTER_MARKER)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letters", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn active_jobs_async(&self, worker_id: &WorkerId) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE worker_id = $1 AND status = 'processing' ORDER BY claimed_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("active_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn throughput_async(&self, window: Duration) -> Result<ThroughputStats, JobStoreError> {
        let row = sqlx::query(
            "SELECT \
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed \
             FROM jobs WHERE updated_at >= NOW() - make_interval(secs => $1)",
        )
        .bind(window.num_seconds() as f64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("throughput", e))?;

        Ok(ThroughputStats {
            completed: count(&row, "completed")?,
            failed: count(&row, "failed")?,
        })
    }

    async fn cohort_counts_async(
        &self,
        kind: &JobKind,
        key_prefix: &str,
    ) -> Result<CohortCounts, JobStoreError> {
        let row = sqlx::query(
            "SELECT \
                 COUNT(*) AS total, \
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed \
             FROM jobs WHERE kind = $1 AND idempotency_key LIKE $2 || '%'",
        )
        .bind(kind.as_str())
        .bind(key_prefix)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("cohort_counts", e))?;

        Ok(CohortCounts {
            total: count(&row, "total")?,
            completed: count(&row, "completed")?,
            failed: count(&row, "failed")?,
        })
    }

    async fn sweep_stuck_async(
        &self,
        stuck_after: Duration,
        policy: ReapPolicy,
    ) -> Result<Vec<Job>, JobStoreError> {
        let threshold_secs = stuck_after.num_seconds() as f64;
        let mut reaped = Vec::new();

        if policy == ReapPolicy::Requeue {
            let sql = format!(
                "UPDATE jobs SET \
                     status = 'pending', \
                     worker_id = NULL, \
                     next_run_at = NULL, \
                     reap_count = reap_count + 1, \
                     last_error = 'reaped: stuck in processing for ' || \
                         EXTRACT(EPOCH FROM (NOW() - COALESCE(last_heartbeat_at, claimed_at)))::bigint \
                         || 's (worker ' || COALESCE(worker_id, 'unknown') || ')', \
                     updated_at = NOW() \
                 WHERE status = 'processing' \
                   AND COALESCE(last_heartbeat_at, claimed_at) < NOW() - make_interval(secs => $1) \
                   AND reap_count + 1 < GREATEST(max_attempts, 1) \
                 RETURNING {JOB_COLUMNS}"
            );
            let rows = sqlx::query(&sql)
                .bind(threshold_secs)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("sweep_stuck_requeue", e))?;
            for row in &rows {
                reaped.push(job_from_row(row)?);
            }
        }

        // Straight to dead-letter: everything stuck under the Fail policy,
        // or jobs that exhausted their reap budget under Requeue.
        let budget_guard = match policy {
            ReapPolicy::Fail => "",
            ReapPolicy::Requeue => " AND reap_count + 1 >= GREATEST(max_attempts, 1)",
        };
        let sql = format!(
            "UPDATE jobs SET \
                 status = 'failed', \
                 next_run_at = NULL, \
                 reap_count = reap_count + 1, \
                 last_error = $2 || ' reaped: stuck in processing for ' || \
                     EXTRACT(EPOCH FROM (NOW() - COALESCE(last_heartbeat_at, claimed_at)))::bigint \
                     || 's (worker ' || COALESCE(worker_id, 'unknown') || ')', \
                 updated_at = NOW() \
             WHERE status = 'processing' \
               AND COALESCE(last_heartbeat_at, claimed_at) < NOW() - make_interval(secs => $1)\
               {budget_guard} \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(threshold_secs)
            .bind(DEAD_LETTER_MARKER)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("sweep_stuck_fail", e))?;
        for row in &rows {
            reaped.push(job_from_row(row)?);
        }

        Ok(reaped)
    }

    async fn sweep_stale_pending_async(
        &self,
        ceiling: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET \
                 status = 'failed', \
                 next_run_at = NULL, \
                 last_error = $2 || ' expired: pending for ' || \
                     EXTRACT(EPOCH FROM (NOW() - created_at))::bigint || 's without completing', \
                 updated_at = NOW() \
             WHERE status = 'pending' \
               AND created_at < NOW() - make_interval(secs => $1) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(ceiling.num_seconds() as f64)
            .bind(DEAD_LETTER_MARKER)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("sweep_stale_pending", e))?;
        rows.iter().map(job_from_row).collect()
    }
}

impl JobStore for PostgresJobStore {
    fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        self.block_on(self.enqueue_async(new))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.get_async(job_id))
    }

    fn claim(&self, kind: &JobKind, worker_id: &WorkerId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.claim_async(kind, worker_id))
    }

    fn heartbeat(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Lease, JobStoreError> {
        self.block_on(self.heartbeat_async(job_id, worker_id))
    }

    fn complete(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Lease, JobStoreError> {
        self.block_on(self.complete_async(job_id, worker_id))
    }

    fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<Lease, JobStoreError> {
        self.block_on(self.fail_async(job_id, worker_id, error, kind))
    }

    fn stats(&self, kind: &JobKind) -> Result<QueueStats, JobStoreError> {
        self.block_on(self.stats_async(kind))
    }

    fn oldest_pending_age(&self, kind: &JobKind) -> Result<Option<Duration>, JobStoreError> {
        self.block_on(self.oldest_pending_age_async(kind))
    }

    fn in_flight(&self, kind: &JobKind) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.in_flight_async(kind))
    }

    fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.dead_letters_async(limit))
    }

    fn active_jobs(&self, worker_id: &WorkerId) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.active_jobs_async(worker_id))
    }

    fn throughput(&self, window: Duration) -> Result<ThroughputStats, JobStoreError> {
        self.block_on(self.throughput_async(window))
    }

    fn cohort_counts(
        &self,
        kind: &JobKind,
        key_prefix: &str,
    ) -> Result<CohortCounts, JobStoreError> {
        self.block_on(self.cohort_counts_async(kind, key_prefix))
    }

    fn sweep_stuck(
        &self,
        stuck_after: Duration,
        policy: ReapPolicy,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.sweep_stuck_async(stuck_after, policy))
    }

    fn sweep_stale_pending(&self, ceiling: Duration) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.sweep_stale_pending_async(ceiling))
    }
}

impl WorkerRegistry for PostgresJobStore {
    fn beat(
        &self,
        worker_id: &WorkerId,
        worker_type: &str,
        hostname: &str,
    ) -> Result<(), JobStoreError> {
        self.block_on(async {
            sqlx::query(
                "INSERT INTO worker_heartbeats (worker_id, worker_type, hostname, status) \
                 VALUES ($1, $2, $3, 'running') \
                 ON CONFLICT (worker_id) \
                 DO UPDATE SET status = 'running', last_seen_at = NOW()",
            )
            .bind(worker_id.as_str())
            .bind(worker_type)
            .bind(hostname)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("worker_beat", e))?;
            Ok(())
        })
    }

    fn mark_stopped(&self, worker_id: &WorkerId) -> Result<(), JobStoreError> {
        self.block_on(async {
            sqlx::query(
                "UPDATE worker_heartbeats \
                 SET status = 'stopped', last_seen_at = NOW() WHERE worker_id = $1",
            )
            .bind(worker_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("worker_mark_stopped", e))?;
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<WorkerHeartbeat>, JobStoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT worker_id, worker_type, hostname, status, started_at, last_seen_at \
                 FROM worker_heartbeats ORDER BY worker_id ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("worker_list", e))?;
            rows.iter().map(worker_from_row).collect()
        })
    }

    fn dead_workers(&self, threshold: Duration) -> Result<Vec<WorkerHeartbeat>, JobStoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT worker_id, worker_type, hostname, status, started_at, last_seen_at \
                 FROM worker_heartbeats \
                 WHERE status = 'running' \
                   AND last_seen_at < NOW() - make_interval(secs => $1) \
                 ORDER BY worker_id ASC",
            )
            .bind(threshold.num_seconds() as f64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_workers", e))?;
            rows.iter().map(worker_from_row).collect()
        })
    }
}

impl ReaperLedger for PostgresJobStore {
    fn record_sweep(
        &self,
        jobs_reaped: u64,
        error: Option<&str>,
    ) -> Result<ReaperHeartbeat, JobStoreError> {
        self.block_on(async {
            let status = if error.is_some() {
                SweepStatus::Error
            } else {
                SweepStatus::Ok
            };
            let row = sqlx::query(
                "INSERT INTO reaper_heartbeat \
                     (singleton, last_run_at, jobs_reaped, run_count, status, error_message) \
                 VALUES (TRUE, NOW(), $1, 1, $2, $3) \
                 ON CONFLICT (singleton) DO UPDATE SET \
                     last_run_at = NOW(), \
                     jobs_reaped = EXCLUDED.jobs_reaped, \
                     run_count = reaper_heartbeat.run_count + 1, \
                     status = EXCLUDED.status, \
                     error_message = EXCLUDED.error_message \
                 RETURNING last_run_at, jobs_reaped, run_count, status, error_message",
            )
            .bind(jobs_reaped as i64)
            .bind(status.as_str())
            .bind(error)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_sweep", e))?;
            reaper_from_row(&row)
        })
    }

    fn last(&self) -> Result<Option<ReaperHeartbeat>, JobStoreError> {
        self.block_on(async {
            let row = sqlx::query(
                "SELECT last_run_at, jobs_reaped, run_count, status, error_message \
                 FROM reaper_heartbeat",
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reaper_last", e))?;
            row.as_ref().map(reaper_from_row).transpose()
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation}: {err}"))
}

fn count(row: &sqlx::postgres::PgRow, column: &str) -> Result<usize, JobStoreError> {
    let value: i64 = row
        .try_get(column)
        .map_err(|e| JobStoreError::Storage(format!("read {column}: {e}")))?;
    Ok(value.max(0) as usize)
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    kind: String,
    payload: serde_json::Value,
    idempotency_key: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_run_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
    reap_count: i32,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            worker_id: row.try_get("worker_id")?,
            claimed_at: row.try_get("claimed_at")?,
            started_at: row.try_get("started_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_error: row.try_get("last_error")?,
            reap_count: row.try_get("reap_count")?,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("deserialize job row: {e}")))?;
    let status = match row.status.as_str() {
        "pending" => JobStatus::Pending,
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        other => {
            return Err(JobStoreError::Storage(format!("unknown job status: {other}")));
        }
    };
    Ok(Job {
        id: JobId::from_uuid(row.id),
        kind: JobKind::from(row.kind),
        payload: row.payload,
        idempotency_key: row.idempotency_key,
        status,
        attempts: row.attempts.max(0) as u32,
        max_attempts: row.max_attempts.max(0) as u32,
        next_run_at: row.next_run_at,
        worker_id: row.worker_id.map(WorkerId::new),
        claimed_at: row.claimed_at,
        started_at: row.started_at,
        last_heartbeat_at: row.last_heartbeat_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
        last_error: row.last_error,
        reap_count: row.reap_count.max(0) as u32,
    })
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkerHeartbeat, JobStoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| JobStoreError::Storage(format!("read worker status: {e}")))?;
    let status = match status.as_str() {
        "running" => WorkerStatus::Running,
        _ => WorkerStatus::Stopped,
    };
    let get = |col: &str| -> Result<String, JobStoreError> {
        row.try_get(col)
            .map_err(|e| JobStoreError::Storage(format!("read {col}: {e}")))
    };
    Ok(WorkerHeartbeat {
        worker_id: WorkerId::new(get("worker_id")?),
        worker_type: get("worker_type")?,
        hostname: get("hostname")?,
        status,
        started_at: row
            .try_get("started_at")
            .map_err(|e| JobStoreError::Storage(format!("read started_at: {e}")))?,
        last_seen_at: row
            .try_get("last_seen_at")
            .map_err(|e| JobStoreError::Storage(format!("read last_seen_at: {e}")))?,
    })
}

fn reaper_from_row(row: &sqlx::postgres::PgRow) -> Result<ReaperHeartbeat, JobStoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| JobStoreError::Storage(format!("read sweep status: {e}")))?;
    let jobs_reaped: i64 = row
        .try_get("jobs_reaped")
        .map_err(|e| JobStoreError::Storage(format!("read jobs_reaped: {e}")))?;
    let run_count: i64 = row
        .try_get("run_count")
        .map_err(|e| JobStoreError::Storage(format!("read run_count: {e}")))?;
    Ok(ReaperHeartbeat {
        last_run_at: row
            .try_get("last_run_at")
            .map_err(|e| JobStoreError::Storage(format!("read last_run_at: {e}")))?,
        jobs_reaped: jobs_reaped.max(0) as u64,
        run_count: run_count.max(0) as u64,
        status: if status == "error" {
            SweepStatus::Error
        } else {
            SweepStatus::Ok
        },
        error_message: row
            .try_get("error_message")
            .map_err(|e| JobStoreError::Storage(format!("read error_message: {e}")))?,
    })
}
