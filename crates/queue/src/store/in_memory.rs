//! In-memory job store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{Duration, Utc};

use writforge_core::{JobId, WorkerId};

use super::{CohortCounts, JobStore, JobStoreError, QueueStats, ReapPolicy, ThroughputStats};
use crate::job::{FailureKind, Job, JobKind, JobStatus, Lease, NewJob, RetryPolicy};

/// In-memory `JobStore`.
///
/// All mutations run under one write lock, which is what makes `claim`
/// atomic here; the Postgres implementation gets the same guarantee from a
/// conditional `UPDATE`.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    /// idempotency_key -> job id.
    keys: RwLock<HashMap<String, JobId>>,
    retry_policy: RetryPolicy,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            retry_policy,
        }
    }

    /// Direct access to job state, for tests that need to backdate
    /// timestamps.
    #[cfg(test)]
    pub(crate) fn jobs_for_test(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let mut keys = self.keys.write().unwrap();

        if let Some(existing_id) = keys.get(&new.idempotency_key) {
            let existing = jobs
                .get(existing_id)
                .ok_or(JobStoreError::NotFound(*existing_id))?;
            return Ok(existing.clone());
        }

        let job = Job::from_new(new, Utc::now());
        keys.insert(job.idempotency_key.clone(), job.id);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    fn claim(&self, kind: &JobKind, worker_id: &WorkerId) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();

        // Oldest eligible pending job of this kind; id breaks created_at ties
        // so ordering stays deterministic.
        let candidate = jobs
            .values()
            .filter(|j| j.kind == *kind && j.is_claimable(now))
            .min_by_key(|j| (j.created_at, *j.id.as_uuid()))
            .map(|j| j.id);

        match candidate {
            Some(id) => {
                let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
                job.mark_claimed(worker_id.clone(), now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    fn heartbeat(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Lease, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_owned_by(worker_id) {
            return Ok(Lease::Lost);
        }
        let now = Utc::now();
        job.last_heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(Lease::Held)
    }

    fn complete(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Lease, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_owned_by(worker_id) {
            return Ok(Lease::Lost);
        }
        job.mark_completed(Utc::now());
        Ok(Lease::Held)
    }

    fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<Lease, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_owned_by(worker_id) {
            return Ok(Lease::Lost);
        }
        job.mark_failed(&self.retry_policy, kind, error, Utc::now());
        Ok(Lease::Held)
    }

    fn stats(&self, kind: &JobKind) -> Result<QueueStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.kind == *kind) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => {
                    stats.failed += 1;
                    if job.is_dead_lettered() {
                        stats.dead_lettered += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    fn oldest_pending_age(&self, kind: &JobKind) -> Result<Option<Duration>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let now = Utc::now();
        Ok(jobs
            .values()
            .filter(|j| j.kind == *kind && j.is_claimable(now))
            .map(|j| j.created_at)
            .min()
            .map(|oldest| now - oldest))
    }

    fn in_flight(&self, kind: &JobKind) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.kind == *kind && j.status == JobStatus::Processing)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.claimed_at);
        Ok(result)
    }

    fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.is_dead_lettered())
            .cloned()
            .collect();
        result.sort_by_key(|j| std::cmp::Reverse(j.updated_at));
        result.truncate(limit);
        Ok(result)
    }

    fn active_jobs(&self, worker_id: &WorkerId) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.is_owned_by(worker_id))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.claimed_at);
        Ok(result)
    }

    fn throughput(&self, window: Duration) -> Result<ThroughputStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let cutoff = Utc::now() - window;
        let mut stats = ThroughputStats::default();
        for job in jobs.values().filter(|j| j.updated_at >= cutoff) {
            match job.status {
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    fn cohort_counts(
        &self,
        kind: &JobKind,
        key_prefix: &str,
    ) -> Result<CohortCounts, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut counts = CohortCounts::default();
        for job in jobs
            .values()
            .filter(|j| j.kind == *kind && j.idempotency_key.starts_with(key_prefix))
        {
            counts.total += 1;
            match job.status {
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    fn sweep_stuck(
        &self,
        stuck_after: Duration,
        policy: ReapPolicy,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();
        let mut reaped = Vec::new();

        for job in jobs.values_mut().filter(|j| j.status == JobStatus::Processing) {
            let Some(anchor) = job.lease_anchor() else {
                continue;
            };
            let stuck_for = now - anchor;
            if stuck_for <= stuck_after {
                continue;
            }

            let error = format!(
                "reaped: stuck in processing for {}s (worker {})",
                stuck_for.num_seconds(),
                job.worker_id
                    .as_ref()
                    .map(|w| w.as_str())
                    .unwrap_or("unknown"),
            );
            let exhausted = job.reap_count + 1 >= job.max_attempts.max(1);
            match policy {
                ReapPolicy::Requeue if !exhausted => job.requeue_reaped(&error, now),
                _ => {
                    job.reap_count += 1;
                    job.dead_letter(&error, now);
                }
            }
            reaped.push(job.clone());
        }

        Ok(reaped)
    }

    fn sweep_stale_pending(&self, ceiling: Duration) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let now = Utc::now();
        let cutoff = now - ceiling;
        let mut expired = Vec::new();

        for job in jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Pending && j.created_at < cutoff)
        {
            let error = format!(
                "expired: pending for {}s without completing",
                (now - job.created_at).num_seconds()
            );
            job.dead_letter(&error, now);
            expired.push(job.clone());
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn store() -> InMemoryJobStore {
        InMemoryJobStore::new()
    }

    fn resolve_job(key: &str) -> NewJob {
        NewJob::new(
            JobKind::EntityResolve,
            serde_json::json!({"row": key}),
            key,
        )
    }

    #[test]
    fn enqueue_is_idempotent_on_key() {
        let store = store();
        let first = store.enqueue(resolve_job("b1:resolve:7")).unwrap();
        let second = store.enqueue(resolve_job("b1:resolve:7")).unwrap();

        assert_eq!(first.id, second.id);
        let stats = store.stats(&JobKind::EntityResolve).unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn claim_is_fifo_within_kind() {
        let store = store();
        let a = store.enqueue(resolve_job("a")).unwrap();
        let b = store.enqueue(resolve_job("b")).unwrap();

        let w = WorkerId::new("w1");
        assert_eq!(store.claim(&JobKind::EntityResolve, &w).unwrap().unwrap().id, a.id);
        assert_eq!(store.claim(&JobKind::EntityResolve, &w).unwrap().unwrap().id, b.id);
        assert!(store.claim(&JobKind::EntityResolve, &w).unwrap().is_none());
    }

    #[test]
    fn claim_respects_kind_and_backoff_window() {
        let store = store();
        store.enqueue(resolve_job("a")).unwrap();
        let w = WorkerId::new("w1");

        assert!(store.claim(&JobKind::Enrich, &w).unwrap().is_none());

        let claimed = store.claim(&JobKind::EntityResolve, &w).unwrap().unwrap();
        store
            .fail(claimed.id, &w, "timeout", FailureKind::Transient)
            .unwrap();

        // Back in pending but gated by next_run_at.
        let job = store.get(claimed.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(store.claim(&JobKind::EntityResolve, &w).unwrap().is_none());
    }

    #[test]
    fn concurrent_claimers_get_disjoint_jobs() {
        let store = Arc::new(store());
        for i in 0..8 {
            store.enqueue(resolve_job(&format!("job-{i}"))).unwrap();
        }

        let mut handles = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let w = WorkerId::new(format!("w{t}"));
                let mut claimed = Vec::new();
                while let Some(job) = store.claim(&JobKind::EntityResolve, &w).unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all: Vec<JobId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_by_key(|id| *id.as_uuid());
        all.dedup();
        assert_eq!(all.len(), 8, "every job claimed exactly once");
    }

    #[test]
    fn stale_worker_writes_are_rejected() {
        let store = store();
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");

        let job = store.enqueue(resolve_job("a")).unwrap();
        store.claim(&JobKind::EntityResolve, &w1).unwrap().unwrap();

        assert_eq!(store.heartbeat(job.id, &w2).unwrap(), Lease::Lost);
        assert_eq!(store.complete(job.id, &w2).unwrap(), Lease::Lost);
        assert_eq!(
            store
                .fail(job.id, &w2, "nope", FailureKind::Transient)
                .unwrap(),
            Lease::Lost
        );

        // The rightful owner is unaffected.
        assert_eq!(store.heartbeat(job.id, &w1).unwrap(), Lease::Held);
        assert_eq!(store.complete(job.id, &w1).unwrap(), Lease::Held);
    }

    #[test]
    fn retries_exhaust_into_dead_letter() {
        let store = store();
        let w = WorkerId::new("w1");
        let job = store
            .enqueue(resolve_job("a").with_max_attempts(3))
            .unwrap();

        for attempt in 1..=3u32 {
            // Clear the backoff gate so the test can re-claim immediately.
            {
                let mut jobs = store.jobs.write().unwrap();
                jobs.get_mut(&job.id).unwrap().next_run_at = None;
            }
            let claimed = store.claim(&JobKind::EntityResolve, &w).unwrap().unwrap();
            assert_eq!(claimed.attempts, attempt - 1);
            store
                .fail(claimed.id, &w, "timeout", FailureKind::Transient)
                .unwrap();
        }

        let job = store.get(job.id).unwrap().unwrap();
        assert!(job.is_dead_lettered());
        assert_eq!(job.attempts, 3);

        // Dead-lettered jobs are not claimable a fourth time.
        assert!(store.claim(&JobKind::EntityResolve, &w).unwrap().is_none());
        assert_eq!(store.dead_letters(10).unwrap().len(), 1);
    }

    #[test]
    fn permanent_failure_dead_letters_without_retry() {
        let store = store();
        let w = WorkerId::new("w1");
        store.enqueue(resolve_job("a")).unwrap();

        let claimed = store.claim(&JobKind::EntityResolve, &w).unwrap().unwrap();
        store
            .fail(claimed.id, &w, "payload is not valid JSON", FailureKind::Permanent)
            .unwrap();

        let job = store.get(claimed.id).unwrap().unwrap();
        assert!(job.is_dead_lettered());
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn sweep_requeues_stuck_jobs() {
        let store = store();
        let w = WorkerId::new("w1");
        let job = store.enqueue(resolve_job("a")).unwrap();
        store.claim(&JobKind::EntityResolve, &w).unwrap();

        // Nothing is stuck yet.
        assert!(store
            .sweep_stuck(Duration::minutes(10), ReapPolicy::Requeue)
            .unwrap()
            .is_empty());

        // Backdate the lease to simulate a crashed worker.
        {
            let mut jobs = store.jobs.write().unwrap();
            let j = jobs.get_mut(&job.id).unwrap();
            let old = Utc::now() - Duration::minutes(30);
            j.claimed_at = Some(old);
            j.last_heartbeat_at = Some(old);
        }

        let reaped = store
            .sweep_stuck(Duration::minutes(10), ReapPolicy::Requeue)
            .unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, JobStatus::Pending);
        assert_eq!(reaped[0].reap_count, 1);
        assert!(reaped[0].last_error.as_deref().unwrap().contains("stuck in processing"));

        // Reclaimable right away; the original worker's late write bounces.
        let reclaimed = store.claim(&JobKind::EntityResolve, &WorkerId::new("w2")).unwrap();
        assert!(reclaimed.is_some());
        assert_eq!(store.complete(job.id, &w).unwrap(), Lease::Lost);
    }

    #[test]
    fn repeatedly_reaped_job_is_dead_lettered() {
        let store = store();
        let job = store
            .enqueue(resolve_job("a").with_max_attempts(2))
            .unwrap();

        for round in 1..=2u32 {
            store
                .claim(&JobKind::EntityResolve, &WorkerId::new(format!("w{round}")))
                .unwrap()
                .unwrap();
            {
                let mut jobs = store.jobs.write().unwrap();
                let j = jobs.get_mut(&job.id).unwrap();
                j.last_heartbeat_at = Some(Utc::now() - Duration::hours(1));
            }
            store
                .sweep_stuck(Duration::minutes(10), ReapPolicy::Requeue)
                .unwrap();
        }

        let job = store.get(job.id).unwrap().unwrap();
        assert!(job.is_dead_lettered());
        assert_eq!(job.reap_count, 2);
    }

    #[test]
    fn sweep_expires_ancient_pending_jobs() {
        let store = store();
        let job = store.enqueue(resolve_job("a")).unwrap();
        {
            let mut jobs = store.jobs.write().unwrap();
            jobs.get_mut(&job.id).unwrap().created_at = Utc::now() - Duration::hours(25);
        }

        let expired = store.sweep_stale_pending(Duration::hours(24)).unwrap();
        assert_eq!(expired.len(), 1);
        assert!(expired[0].is_dead_lettered());
        assert!(expired[0].last_error.as_deref().unwrap().contains("expired"));
    }

    #[test]
    fn observability_reads_reflect_queue_state() {
        let store = store();
        let w = WorkerId::new("w1");
        for i in 0..3 {
            store.enqueue(resolve_job(&format!("b1:resolve:{i}"))).unwrap();
        }

        let claimed = store.claim(&JobKind::EntityResolve, &w).unwrap().unwrap();
        store.complete(claimed.id, &w).unwrap();
        let claimed = store.claim(&JobKind::EntityResolve, &w).unwrap().unwrap();

        let stats = store.stats(&JobKind::EntityResolve).unwrap();
        assert_eq!((stats.pending, stats.processing, stats.completed), (1, 1, 1));

        assert!(store.oldest_pending_age(&JobKind::EntityResolve).unwrap().is_some());
        assert_eq!(store.in_flight(&JobKind::EntityResolve).unwrap().len(), 1);
        assert_eq!(store.active_jobs(&w).unwrap()[0].id, claimed.id);

        let throughput = store.throughput(Duration::minutes(5)).unwrap();
        assert_eq!(throughput.completed, 1);
        assert_eq!(throughput.error_rate(), 0.0);

        let cohort = store
            .cohort_counts(&JobKind::EntityResolve, "b1:resolve:")
            .unwrap();
        assert_eq!(cohort.total, 3);
        assert_eq!(cohort.completed, 1);
        assert!(!cohort.is_settled());
    }
}
