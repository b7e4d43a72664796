use crate::db::StoreError;
use crate::services::inference::InferenceError;
use crate::services::recorder::RecordError;
use crate::services::storage::StorageError;

/// Why one pipeline run over a claimed job stopped short of `completed`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("generation failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("recording result failed: {0}")]
    Record(#[from] RecordError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Inference(e) => e.is_retryable(),
            PipelineError::Storage(e) => e.is_retryable(),
            PipelineError::Record(e) => e.is_retryable(),
            PipelineError::Store(e) => e.is_retryable(),
        }
    }

    /// The run no longer owns the job, so nothing may be written for it.
    pub fn lost_claim(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(StoreError::LostClaim { .. })
                | PipelineError::Record(RecordError::Record(StoreError::LostClaim { .. }))
        )
    }
}
