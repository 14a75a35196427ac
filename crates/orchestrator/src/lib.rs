//! Batch pipeline orchestration for judgment imports.
//!
//! An accepted import becomes a [`batch::Batch`] that walks the pipeline
//! stage by stage; each stage fans out one queue job per row and advances
//! when the cohort settles. The [`ledger::ImportLedger`] makes whole-import
//! resubmission idempotent.

pub mod batch;
pub mod error;
pub mod ledger;
pub mod orchestrator;

pub use batch::{Batch, BatchStage, ImportRow, PipelinePolicy, StagePolicy};
pub use error::{OrchestratorError, OrchestratorResult};
pub use ledger::{content_fingerprint, ImportKey, ImportLedger};
pub use orchestrator::{BatchOrchestrator, IntakeOutcome, TickHandle};
