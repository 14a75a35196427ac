//! End-to-end pipeline runs: orchestrator, queue, and executor wired the
//! way the worker binary wires them.

use std::sync::Arc;

use writforge_core::WorkerId;
use writforge_orchestrator::{BatchOrchestrator, BatchStage, ImportRow, IntakeOutcome};
use writforge_queue::{
    Executor, ExecutorConfig, InMemoryJobStore, JobKind, JobOutcome, JobStatus, JobStore,
    RetryPolicy,
};

fn rows(n: usize) -> Vec<ImportRow> {
    (1..=n)
        .map(|i| {
            ImportRow::new(
                format!("row-{i}"),
                serde_json::json!({"case_number": format!("24-cv-{i:03}")}),
            )
        })
        .collect()
}

/// Drain every pending job of `kind` through the executor, then let the
/// reconciliation tick pick up anything the callbacks missed.
fn drain(
    orch: &Arc<BatchOrchestrator<InMemoryJobStore>>,
    executor: &Executor<InMemoryJobStore>,
    kind: JobKind,
) {
    let config = ExecutorConfig::new(kind, WorkerId::new("it-worker"));
    loop {
        match executor.run_once(&config).unwrap() {
            writforge_queue::CycleResult::Idle => break,
            _ => continue,
        }
    }
    orch.tick().unwrap();
}

#[test]
fn golden_path_with_a_tolerated_enrichment_failure() {
    let store = Arc::new(InMemoryJobStore::new());
    let orch = Arc::new(BatchOrchestrator::new(store.clone()));

    let hook_orch = orch.clone();
    let mut executor = Executor::new(store.clone())
        .with_terminal_hook(move |job| hook_orch.observe_terminal(job));
    executor.register_handler(JobKind::EntityResolve, |_job| JobOutcome::Success);
    executor.register_handler(JobKind::CreateJudgment, |_job| JobOutcome::Success);
    executor.register_handler(JobKind::Enrich, |job| {
        // One row has no matching credit header; enrichment is best-effort.
        if job.payload["row_ref"] == "row-3" {
            JobOutcome::Discard("no enrichment source for debtor".to_string())
        } else {
            JobOutcome::Success
        }
    });

    let batch_id = orch
        .intake("courtlink", "2026-08-01", rows(3))
        .unwrap()
        .batch_id();

    drain(&orch, &executor, JobKind::EntityResolve);
    assert_eq!(
        orch.status(batch_id).unwrap().stage,
        BatchStage::JudgmentCreating
    );

    drain(&orch, &executor, JobKind::CreateJudgment);
    drain(&orch, &executor, JobKind::Enrich);

    let batch = orch.status(batch_id).unwrap();
    assert_eq!(batch.stage, BatchStage::Complete);
    assert_eq!(batch.jobs_completed, 2);
    assert_eq!(batch.jobs_failed, 1);
    assert!(batch.error_message.is_none());
    assert!(batch.completed_at.is_some());
}

#[test]
fn transient_failures_exhaust_the_retry_budget_and_fail_the_batch() {
    // Zero backoff so retries are immediately claimable.
    let store = Arc::new(InMemoryJobStore::with_retry_policy(RetryPolicy {
        base_delay: std::time::Duration::ZERO,
        max_delay: std::time::Duration::ZERO,
    }));
    let orch = Arc::new(BatchOrchestrator::new(store.clone()));

    let hook_orch = orch.clone();
    let mut executor = Executor::new(store.clone())
        .with_terminal_hook(move |job| hook_orch.observe_terminal(job));
    executor.register_handler(JobKind::EntityResolve, |_job| {
        JobOutcome::Retry("registry lookup timed out".to_string())
    });

    let batch_id = orch
        .intake("courtlink", "2026-08-02", rows(1))
        .unwrap()
        .batch_id();

    let config = ExecutorConfig::new(JobKind::EntityResolve, WorkerId::new("it-worker"));
    let mut attempts = 0;
    loop {
        match executor.run_once(&config).unwrap() {
            writforge_queue::CycleResult::Idle => break,
            _ => attempts += 1,
        }
    }
    assert_eq!(attempts, 3);

    let batch = orch.status(batch_id).unwrap();
    assert_eq!(batch.stage, BatchStage::Failed);
    assert!(batch.error_message.unwrap().contains("entity_resolving"));

    let dead = store.dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].status, JobStatus::Failed);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].last_error.as_deref().unwrap().contains("timed out"));
}

#[test]
fn resubmitting_a_finished_import_returns_the_prior_batch() {
    let store = Arc::new(InMemoryJobStore::new());
    let orch = Arc::new(BatchOrchestrator::new(store.clone()));

    let hook_orch = orch.clone();
    let mut executor = Executor::new(store.clone())
        .with_terminal_hook(move |job| hook_orch.observe_terminal(job));
    for kind in [JobKind::EntityResolve, JobKind::CreateJudgment, JobKind::Enrich] {
        executor.register_handler(kind, |_job| JobOutcome::Success);
    }

    let first = orch.intake("courtlink", "2026-08-03", rows(2)).unwrap();
    let batch_id = first.batch_id();
    for kind in [JobKind::EntityResolve, JobKind::CreateJudgment, JobKind::Enrich] {
        drain(&orch, &executor, kind);
    }
    assert_eq!(orch.status(batch_id).unwrap().stage, BatchStage::Complete);

    let again = orch.intake("courtlink", "2026-08-03", rows(2)).unwrap();
    assert_eq!(again, IntakeOutcome::Duplicate(batch_id));
    // No second cohort appeared in the queue.
    let counts = store.stats(&JobKind::EntityResolve).unwrap();
    assert_eq!(counts.pending, 0);
}
