//! Stale-work reaper: reclaims jobs whose lease expired and expires jobs
//! pending past the ceiling.
//!
//! There is no crash signal from a dead worker; the reaper's stuck-job sweep
//! is the recovery mechanism. Its own heartbeat is recorded after every
//! sweep, including failed ones, so the watchdog never fails silently.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tracing::{error, info, warn};

use crate::heartbeat::ReaperLedger;
use crate::store::{JobStore, ReapPolicy};

/// Reaper sweep configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    /// Lease age after which a processing job counts as stuck.
    pub stuck_threshold: Duration,
    /// Age after which a pending job is force-failed.
    pub pending_ceiling: Duration,
    pub policy: ReapPolicy,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::minutes(10),
            pending_ceiling: Duration::hours(24),
            policy: ReapPolicy::default(),
        }
    }
}

/// Outcome of one reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub stuck_reaped: usize,
    pub pending_expired: usize,
    pub errored: bool,
}

impl SweepSummary {
    pub fn total(&self) -> usize {
        self.stuck_reaped + self.pending_expired
    }
}

/// Handle to control a spawned reaper loop.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Periodic watchdog over the job store.
pub struct Reaper<S: JobStore> {
    store: Arc<S>,
    ledger: Arc<dyn ReaperLedger>,
    config: ReaperConfig,
}

impl<S: JobStore + 'static> Reaper<S> {
    pub fn new(store: Arc<S>, ledger: Arc<dyn ReaperLedger>, config: ReaperConfig) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Run both sweeps once. Errors in one phase do not abort the other, and
    /// the heartbeat is recorded unconditionally at the end.
    pub fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let mut errors: Vec<String> = Vec::new();

        match self
            .store
            .sweep_stuck(self.config.stuck_threshold, self.config.policy)
        {
            Ok(reaped) => {
                for job in &reaped {
                    warn!(
                        job_id = %job.id,
                        kind = %job.kind,
                        status = job.status.as_str(),
                        reap_count = job.reap_count,
                        "reaped stuck job"
                    );
                }
                summary.stuck_reaped = reaped.len();
            }
            Err(e) => {
                error!(error = %e, "stuck-job sweep failed");
                errors.push(format!("stuck sweep: {e}"));
            }
        }

        match self.store.sweep_stale_pending(self.config.pending_ceiling) {
            Ok(expired) => {
                for job in &expired {
                    warn!(job_id = %job.id, kind = %job.kind, "expired stale pending job");
                }
                summary.pending_expired = expired.len();
            }
            Err(e) => {
                error!(error = %e, "stale-pending sweep failed");
                errors.push(format!("pending sweep: {e}"));
            }
        }

        summary.errored = !errors.is_empty();
        let error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };

        // The heartbeat write must happen even when the sweep itself failed;
        // an unrecorded sweep makes the watchdog an invisible point of
        // failure.
        if let Err(e) = self
            .ledger
            .record_sweep(summary.total() as u64, error.as_deref())
        {
            error!(error = %e, "failed to record reaper heartbeat");
        }

        info!(
            stuck_reaped = summary.stuck_reaped,
            pending_expired = summary.pending_expired,
            errored = summary.errored,
            "reaper sweep finished"
        );
        summary
    }

    /// Spawn the periodic sweep loop in a background thread.
    pub fn spawn(self, interval: StdDuration) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "reaper started");
                loop {
                    self.sweep();
                    if let Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) =
                        shutdown_rx.recv_timeout(interval)
                    {
                        break;
                    }
                }
                info!("reaper stopped");
            })
            .expect("failed to spawn reaper thread");

        ReaperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
