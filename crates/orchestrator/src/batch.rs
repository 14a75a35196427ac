//! Batch pipeline model: stages, per-stage policy, and the batch record.
//!
//! The happy path walks `validated -> entity_resolving -> entity_resolved ->
//! judgment_creating -> judgment_created -> enriching -> enriched ->
//! complete`. `failed` is reachable from any non-terminal stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use writforge_core::BatchId;
use writforge_queue::JobKind;

/// Pipeline stage of an import batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    Validated,
    EntityResolving,
    EntityResolved,
    JudgmentCreating,
    JudgmentCreated,
    Enriching,
    Enriched,
    Complete,
    Failed,
}

impl BatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStage::Validated => "validated",
            BatchStage::EntityResolving => "entity_resolving",
            BatchStage::EntityResolved => "entity_resolved",
            BatchStage::JudgmentCreating => "judgment_creating",
            BatchStage::JudgmentCreated => "judgment_created",
            BatchStage::Enriching => "enriching",
            BatchStage::Enriched => "enriched",
            BatchStage::Complete => "complete",
            BatchStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStage::Complete | BatchStage::Failed)
    }
}

impl std::fmt::Display for BatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of an import, carried through every stage's job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRow {
    /// Stable reference within the source file (row number, case number).
    pub row_ref: String,
    pub payload: serde_json::Value,
}

impl ImportRow {
    pub fn new(row_ref: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            row_ref: row_ref.into(),
            payload,
        }
    }
}

/// How one pipeline stage runs: which job kind it fans out, which stages
/// bracket it, and how failures are judged.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    pub kind: JobKind,
    /// Stage the batch sits in while the cohort runs.
    pub working: BatchStage,
    /// Stage reached once the cohort settles acceptably.
    pub done: BatchStage,
    /// A required stage fails the whole batch when tolerance is exceeded;
    /// a non-required stage records the failures and moves on.
    pub required: bool,
    /// Number of failed jobs the stage absorbs before it counts as exceeded.
    pub failure_tolerance: usize,
}

/// Ordered stage policies for a pipeline.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    pub stages: Vec<StagePolicy>,
}

impl PipelinePolicy {
    /// Policy index for a batch currently in `stage`, if it is a working
    /// stage.
    pub fn position(&self, stage: BatchStage) -> Option<usize> {
        self.stages.iter().position(|s| s.working == stage)
    }
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            stages: vec![
                StagePolicy {
                    kind: JobKind::EntityResolve,
                    working: BatchStage::EntityResolving,
                    done: BatchStage::EntityResolved,
                    required: true,
                    failure_tolerance: 0,
                },
                StagePolicy {
                    kind: JobKind::CreateJudgment,
                    working: BatchStage::JudgmentCreating,
                    done: BatchStage::JudgmentCreated,
                    required: true,
                    failure_tolerance: 0,
                },
                StagePolicy {
                    kind: JobKind::Enrich,
                    working: BatchStage::Enriching,
                    done: BatchStage::Enriched,
                    required: false,
                    failure_tolerance: 0,
                },
            ],
        }
    }
}

/// An import batch moving through the pipeline.
///
/// `jobs_total`/`jobs_completed`/`jobs_failed` count the current stage's
/// cohort only and reset when a new cohort is fanned out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub source_system: String,
    pub source_batch_id: String,
    pub stage: BatchStage,
    pub jobs_total: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub rows: Vec<ImportRow>,
}

impl Batch {
    pub fn new(
        source_system: impl Into<String>,
        source_batch_id: impl Into<String>,
        rows: Vec<ImportRow>,
    ) -> Self {
        Self {
            batch_id: BatchId::new(),
            source_system: source_system.into(),
            source_batch_id: source_batch_id.into(),
            stage: BatchStage::Validated,
            jobs_total: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            rows,
        }
    }

    /// True once every job of the current cohort has reported in.
    pub fn cohort_settled(&self) -> bool {
        self.jobs_total > 0 && self.jobs_completed + self.jobs_failed == self.jobs_total
    }

    /// Idempotency-key prefix shared by the current stage's cohort.
    pub fn cohort_prefix(&self) -> String {
        format!("{}:{}:", self.batch_id, self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_walks_the_golden_path() {
        let policy = PipelinePolicy::default();
        assert_eq!(policy.stages.len(), 3);
        assert_eq!(policy.stages[0].working, BatchStage::EntityResolving);
        assert_eq!(policy.stages[1].done, BatchStage::JudgmentCreated);
        assert!(!policy.stages[2].required);
        assert_eq!(policy.position(BatchStage::JudgmentCreating), Some(1));
        assert_eq!(policy.position(BatchStage::Validated), None);
    }

    #[test]
    fn terminal_stages() {
        assert!(BatchStage::Complete.is_terminal());
        assert!(BatchStage::Failed.is_terminal());
        assert!(!BatchStage::Enriching.is_terminal());
    }

    #[test]
    fn cohort_settlement_needs_every_job() {
        let mut batch = Batch::new("courtlink", "2026-08-01", vec![]);
        batch.jobs_total = 3;
        batch.jobs_completed = 2;
        assert!(!batch.cohort_settled());
        batch.jobs_failed = 1;
        assert!(batch.cohort_settled());
    }

    #[test]
    fn stage_names_round_trip_through_serde() {
        let json = serde_json::to_string(&BatchStage::EntityResolving).unwrap();
        assert_eq!(json, "\"entity_resolving\"");
        let back: BatchStage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BatchStage::EntityResolving);
    }
}
