//! Drives batches through the pipeline by fanning each stage out as a job
//! cohort and advancing on the cohort's settled counts.
//!
//! Advancement is count-based: once `jobs_completed + jobs_failed` reaches
//! `jobs_total` the stage settles, in whatever order the jobs finished.
//! Outcome reporting has two paths. The executor's terminal callback
//! ([`BatchOrchestrator::observe_terminal`]) is the fast path; the periodic
//! [`BatchOrchestrator::tick`] re-derives counts from the job store and is
//! the correctness backstop when a callback was lost.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, mpsc};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use writforge_core::BatchId;
use writforge_queue::{Job, JobStatus, JobStore, NewJob};

use crate::batch::{Batch, BatchStage, ImportRow, PipelinePolicy};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ledger::{ImportKey, ImportLedger};

/// Result of submitting an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// A new batch was created and its first cohort enqueued.
    Accepted(BatchId),
    /// The same import was accepted before; no new batch was created.
    Duplicate(BatchId),
}

impl IntakeOutcome {
    pub fn batch_id(&self) -> BatchId {
        match self {
            IntakeOutcome::Accepted(id) | IntakeOutcome::Duplicate(id) => *id,
        }
    }
}

/// Handle to control a spawned reconciliation loop.
#[derive(Debug)]
pub struct TickHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl TickHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Pipeline coordinator over a job store.
pub struct BatchOrchestrator<S: JobStore> {
    store: Arc<S>,
    policy: PipelinePolicy,
    batches: RwLock<HashMap<BatchId, Batch>>,
    ledger: ImportLedger,
}

impl<S: JobStore> BatchOrchestrator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_policy(store, PipelinePolicy::default())
    }

    pub fn with_policy(store: Arc<S>, policy: PipelinePolicy) -> Self {
        Self {
            store,
            policy,
            batches: RwLock::new(HashMap::new()),
            ledger: ImportLedger::new(),
        }
    }

    /// Accept an import and start its pipeline.
    ///
    /// Resubmission of identical content under the same source identity
    /// returns the prior batch instead of creating a second one.
    pub fn intake(
        &self,
        source_system: &str,
        source_batch_id: &str,
        rows: Vec<ImportRow>,
    ) -> OrchestratorResult<IntakeOutcome> {
        if rows.is_empty() {
            return Err(OrchestratorError::InvalidImport("no rows".to_string()));
        }
        let mut seen = HashSet::new();
        for row in &rows {
            if row.row_ref.is_empty() {
                return Err(OrchestratorError::InvalidImport(
                    "row with empty row_ref".to_string(),
                ));
            }
            if !seen.insert(row.row_ref.as_str()) {
                return Err(OrchestratorError::InvalidImport(format!(
                    "duplicate row_ref {:?}",
                    row.row_ref
                )));
            }
        }

        let key = ImportKey::new(source_system, source_batch_id, &rows);
        if let Some(prior) = self.ledger.lookup(&key) {
            info!(batch_id = %prior, source_system, source_batch_id, "duplicate import");
            return Ok(IntakeOutcome::Duplicate(prior));
        }

        let mut batch = Batch::new(source_system, source_batch_id, rows);
        let batch_id = batch.batch_id;
        if let Some(prior) = self.ledger.record(key, batch_id) {
            return Ok(IntakeOutcome::Duplicate(prior));
        }

        info!(
            batch_id = %batch_id,
            source_system,
            source_batch_id,
            rows = batch.rows.len(),
            "import accepted"
        );
        if self.policy.stages.is_empty() {
            self.finish(&mut batch);
        } else {
            self.begin_stage(&mut batch, 0)?;
        }
        self.batches.write().unwrap().insert(batch_id, batch);
        Ok(IntakeOutcome::Accepted(batch_id))
    }

    /// Push path for job outcomes, wired to the executor's terminal hook.
    /// Jobs that did not come from a batch cohort are ignored, as are jobs
    /// belonging to a cohort the batch has already moved past.
    pub fn observe_terminal(&self, job: &Job) {
        let mut parts = job.idempotency_key.splitn(3, ':');
        let (Some(prefix), Some(stage), Some(_row_ref)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return;
        };
        let Ok(batch_id) = prefix.parse::<BatchId>() else {
            debug!(job_id = %job.id, "terminal job without a batch key");
            return;
        };
        let succeeded = job.status == JobStatus::Completed;
        if let Err(e) = self.record_outcome(batch_id, Some(stage), succeeded) {
            debug!(job_id = %job.id, batch_id = %batch_id, error = %e, "outcome not recorded");
        }
    }

    /// Count one settled job against the batch's current cohort, advancing
    /// the stage when the cohort is complete.
    pub fn record_job_outcome(
        &self,
        batch_id: BatchId,
        succeeded: bool,
    ) -> OrchestratorResult<()> {
        self.record_outcome(batch_id, None, succeeded)
    }

    /// When `stage` is given, outcomes from any cohort other than the batch's
    /// current one are dropped. A delayed callback for an already-settled
    /// stage must not count against the cohort that replaced it.
    fn record_outcome(
        &self,
        batch_id: BatchId,
        stage: Option<&str>,
        succeeded: bool,
    ) -> OrchestratorResult<()> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(OrchestratorError::UnknownBatch(batch_id))?;
        if batch.stage.is_terminal() {
            // Late report from a reaped duplicate; the batch already moved on.
            debug!(batch_id = %batch_id, stage = %batch.stage, "outcome after terminal stage");
            return Ok(());
        }
        if let Some(stage) = stage
            && stage != batch.stage.as_str()
        {
            debug!(
                batch_id = %batch_id,
                reported = stage,
                current = %batch.stage,
                "outcome from a superseded cohort"
            );
            return Ok(());
        }
        if succeeded {
            batch.jobs_completed += 1;
        } else {
            batch.jobs_failed += 1;
        }
        if batch.cohort_settled() {
            self.settle_stage(batch)?;
        }
        Ok(())
    }

    /// Reconciliation sweep: re-derive cohort counts from the job store for
    /// every in-flight batch and settle the ones whose callbacks were lost.
    /// Returns the number of batches whose stage advanced.
    pub fn tick(&self) -> OrchestratorResult<usize> {
        let mut advanced = 0;
        let mut batches = self.batches.write().unwrap();
        for batch in batches.values_mut() {
            let Some(idx) = self.policy.position(batch.stage) else {
                continue;
            };
            let counts = self
                .store
                .cohort_counts(&self.policy.stages[idx].kind, &batch.cohort_prefix())?;
            if counts.total != batch.jobs_total || !counts.is_settled() {
                continue;
            }
            batch.jobs_completed = counts.completed;
            batch.jobs_failed = counts.failed;
            if batch.cohort_settled() {
                let before = batch.stage;
                self.settle_stage(batch)?;
                if batch.stage != before {
                    advanced += 1;
                }
            }
        }
        Ok(advanced)
    }

    pub fn status(&self, batch_id: BatchId) -> Option<Batch> {
        self.batches.read().unwrap().get(&batch_id).cloned()
    }

    /// Batches still moving through the pipeline.
    pub fn active_batches(&self) -> Vec<Batch> {
        let mut active: Vec<_> = self
            .batches
            .read()
            .unwrap()
            .values()
            .filter(|b| !b.stage.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|b| b.started_at);
        active
    }

    /// Fan the stage's cohort out to the queue and reset the counters.
    /// Deterministic idempotency keys make this safe to repeat.
    fn begin_stage(&self, batch: &mut Batch, idx: usize) -> OrchestratorResult<()> {
        let stage = &self.policy.stages[idx];
        batch.stage = stage.working;
        batch.jobs_total = batch.rows.len();
        batch.jobs_completed = 0;
        batch.jobs_failed = 0;

        for row in &batch.rows {
            let key = format!("{}:{}:{}", batch.batch_id, stage.working, row.row_ref);
            let payload = serde_json::json!({
                "batch_id": batch.batch_id,
                "row_ref": row.row_ref,
                "row": row.payload,
            });
            self.store
                .enqueue(NewJob::new(stage.kind.clone(), payload, key))?;
        }
        info!(
            batch_id = %batch.batch_id,
            stage = %batch.stage,
            kind = %stage.kind,
            jobs = batch.jobs_total,
            "stage cohort enqueued"
        );
        Ok(())
    }

    /// The current cohort is fully reported; judge it and move the batch.
    fn settle_stage(&self, batch: &mut Batch) -> OrchestratorResult<()> {
        let Some(idx) = self.policy.position(batch.stage) else {
            return Ok(());
        };
        let stage = &self.policy.stages[idx];

        if batch.jobs_failed > stage.failure_tolerance {
            if stage.required {
                let message = format!(
                    "stage {} exceeded failure tolerance: {} of {} jobs failed (tolerance {})",
                    stage.working, batch.jobs_failed, batch.jobs_total, stage.failure_tolerance
                );
                warn!(batch_id = %batch.batch_id, stage = %stage.working, %message, "batch failed");
                batch.stage = BatchStage::Failed;
                batch.error_message = Some(message);
                batch.completed_at = Some(Utc::now());
                return Ok(());
            }
            warn!(
                batch_id = %batch.batch_id,
                stage = %stage.working,
                failed = batch.jobs_failed,
                total = batch.jobs_total,
                "optional stage degraded, continuing"
            );
        }

        batch.stage = stage.done;
        info!(batch_id = %batch.batch_id, stage = %batch.stage, "stage settled");

        if idx + 1 < self.policy.stages.len() {
            self.begin_stage(batch, idx + 1)
        } else {
            self.finish(batch);
            Ok(())
        }
    }

    fn finish(&self, batch: &mut Batch) {
        batch.stage = BatchStage::Complete;
        batch.completed_at = Some(Utc::now());
        info!(batch_id = %batch.batch_id, "batch complete");
    }
}

impl<S: JobStore + 'static> BatchOrchestrator<S> {
    /// Spawn the periodic reconciliation loop in a background thread.
    ///
    /// Batch state lives in this process, so the loop runs beside the
    /// executors of the process that accepted the imports; it is not a
    /// standalone binary concern.
    pub fn spawn_tick(self: &Arc<Self>, interval: StdDuration) -> TickHandle {
        let orchestrator = self.clone();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("orchestrator-tick".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "reconciliation loop started");
                loop {
                    match orchestrator.tick() {
                        Ok(0) => {}
                        Ok(advanced) => info!(advanced, "reconciliation advanced batches"),
                        Err(e) => error!(error = %e, "reconciliation pass failed"),
                    }
                    if let Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) =
                        shutdown_rx.recv_timeout(interval)
                    {
                        break;
                    }
                }
                info!("reconciliation loop stopped");
            })
            .expect("failed to spawn reconciliation thread");

        TickHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
