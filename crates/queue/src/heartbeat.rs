//! Liveness tracking: per-worker heartbeats and the reaper's own heartbeat.
//!
//! Worker heartbeats are independent of job leases; a worker may hold zero or
//! many leased jobs. The reaper heartbeat is a singleton record updated after
//! every sweep so the watchdog itself stays observable.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use writforge_core::WorkerId;

use crate::store::JobStoreError;

/// Worker process status as self-reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

/// Liveness record for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub worker_type: String,
    pub hostname: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Fleet liveness registry, written by workers on a fixed interval and read
/// by health views and the dead-worker check.
pub trait WorkerRegistry: Send + Sync {
    /// Upsert this worker's heartbeat.
    fn beat(
        &self,
        worker_id: &WorkerId,
        worker_type: &str,
        hostname: &str,
    ) -> Result<(), JobStoreError>;

    /// Record a clean shutdown.
    fn mark_stopped(&self, worker_id: &WorkerId) -> Result<(), JobStoreError>;

    /// All known workers.
    fn list(&self) -> Result<Vec<WorkerHeartbeat>, JobStoreError>;

    /// Workers still marked running whose last beat is older than the
    /// threshold.
    fn dead_workers(&self, threshold: Duration) -> Result<Vec<WorkerHeartbeat>, JobStoreError>;
}

/// The reaper's own heartbeat (single logical record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperHeartbeat {
    pub last_run_at: DateTime<Utc>,
    /// Jobs reaped by the most recent sweep.
    pub jobs_reaped: u64,
    /// Total sweeps since the record was created.
    pub run_count: u64,
    pub status: SweepStatus,
    pub error_message: Option<String>,
}

/// Outcome of the most recent reaper sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Ok,
    Error,
}

impl SweepStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SweepStatus::Ok => "ok",
            SweepStatus::Error => "error",
        }
    }
}

/// Persistence for the reaper heartbeat singleton.
pub trait ReaperLedger: Send + Sync {
    /// Record a sweep, success or failure. Must never be skipped.
    fn record_sweep(
        &self,
        jobs_reaped: u64,
        error: Option<&str>,
    ) -> Result<ReaperHeartbeat, JobStoreError>;

    /// Most recent heartbeat, if any sweep has run.
    fn last(&self) -> Result<Option<ReaperHeartbeat>, JobStoreError>;
}

/// In-memory worker registry.
#[derive(Debug, Default)]
pub struct InMemoryWorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerHeartbeat>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerRegistry for InMemoryWorkerRegistry {
    fn beat(
        &self,
        worker_id: &WorkerId,
        worker_type: &str,
        hostname: &str,
    ) -> Result<(), JobStoreError> {
        let mut workers = self.workers.write().unwrap();
        let now = Utc::now();
        workers
            .entry(worker_id.clone())
            .and_modify(|hb| {
                hb.status = WorkerStatus::Running;
                hb.last_seen_at = now;
            })
            .or_insert_with(|| WorkerHeartbeat {
                worker_id: worker_id.clone(),
                worker_type: worker_type.to_string(),
                hostname: hostname.to_string(),
                status: WorkerStatus::Running,
                started_at: now,
                last_seen_at: now,
            });
        Ok(())
    }

    fn mark_stopped(&self, worker_id: &WorkerId) -> Result<(), JobStoreError> {
        let mut workers = self.workers.write().unwrap();
        if let Some(hb) = workers.get_mut(worker_id) {
            hb.status = WorkerStatus::Stopped;
            hb.last_seen_at = Utc::now();
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<WorkerHeartbeat>, JobStoreError> {
        let workers = self.workers.read().unwrap();
        let mut result: Vec<_> = workers.values().cloned().collect();
        result.sort_by(|a, b| a.worker_id.as_str().cmp(b.worker_id.as_str()));
        Ok(result)
    }

    fn dead_workers(&self, threshold: Duration) -> Result<Vec<WorkerHeartbeat>, JobStoreError> {
        let workers = self.workers.read().unwrap();
        let cutoff = Utc::now() - threshold;
        Ok(workers
            .values()
            .filter(|hb| hb.status == WorkerStatus::Running && hb.last_seen_at < cutoff)
            .cloned()
            .collect())
    }
}

/// In-memory reaper ledger.
#[derive(Debug, Default)]
pub struct InMemoryReaperLedger {
    heartbeat: Mutex<Option<ReaperHeartbeat>>,
}

impl InMemoryReaperLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReaperLedger for InMemoryReaperLedger {
    fn record_sweep(
        &self,
        jobs_reaped: u64,
        error: Option<&str>,
    ) -> Result<ReaperHeartbeat, JobStoreError> {
        let mut guard = self.heartbeat.lock().unwrap();
        let run_count = guard.as_ref().map_or(0, |hb| hb.run_count) + 1;
        let hb = ReaperHeartbeat {
            last_run_at: Utc::now(),
            jobs_reaped,
            run_count,
            status: if error.is_some() {
                SweepStatus::Error
            } else {
                SweepStatus::Ok
            },
            error_message: error.map(str::to_string),
        };
        *guard = Some(hb.clone());
        Ok(hb)
    }

    fn last(&self) -> Result<Option<ReaperHeartbeat>, JobStoreError> {
        Ok(self.heartbeat.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_upserts_and_refreshes() {
        let registry = InMemoryWorkerRegistry::new();
        let id = WorkerId::new("w1");

        registry.beat(&id, "enrich", "host-a").unwrap();
        registry.beat(&id, "enrich", "host-a").unwrap();

        let workers = registry.list().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, WorkerStatus::Running);
    }

    #[test]
    fn dead_worker_check_ignores_stopped_and_fresh() {
        let registry = InMemoryWorkerRegistry::new();
        let fresh = WorkerId::new("fresh");
        let stale = WorkerId::new("stale");
        let stopped = WorkerId::new("stopped");

        registry.beat(&fresh, "resolve", "host-a").unwrap();
        registry.beat(&stale, "resolve", "host-b").unwrap();
        registry.beat(&stopped, "resolve", "host-c").unwrap();
        registry.mark_stopped(&stopped).unwrap();

        {
            let mut workers = registry.workers.write().unwrap();
            workers.get_mut(&stale).unwrap().last_seen_at = Utc::now() - Duration::minutes(10);
            workers.get_mut(&stopped).unwrap().last_seen_at = Utc::now() - Duration::minutes(10);
        }

        let dead = registry.dead_workers(Duration::minutes(2)).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].worker_id, stale);
    }

    #[test]
    fn reaper_ledger_records_errors_too() {
        let ledger = InMemoryReaperLedger::new();
        assert!(ledger.last().unwrap().is_none());

        ledger.record_sweep(3, None).unwrap();
        let hb = ledger.record_sweep(0, Some("store unavailable")).unwrap();

        assert_eq!(hb.run_count, 2);
        assert_eq!(hb.status, SweepStatus::Error);
        assert_eq!(hb.error_message.as_deref(), Some("store unavailable"));
    }
}
