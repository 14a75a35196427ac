use writforge_core::BatchId;
use writforge_queue::JobStoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),

    #[error("import rejected: {0}")]
    InvalidImport(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
