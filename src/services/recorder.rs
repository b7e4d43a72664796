use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::job::ClaimedJob;
use crate::models::result::{GenerationResult, ResultMetadata};

/// Writes the permanent result record, then flips the job to completed.
pub struct ResultRecorder {
    store: Arc<dyn JobStore>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Record first, status flip second. A failed flip leaves a result record
    /// with a non-completed owner, which reconciliation picks up.
    pub async fn finalize(
        &self,
        claimed: &ClaimedJob,
        metadata: ResultMetadata,
    ) -> Result<Uuid, RecordError> {
        let job = &claimed.job;
        let record = GenerationResult {
            id: Uuid::new_v4(),
            job_id: job.id,
            user_id: job.user_id,
            prompt: job.prompt.clone(),
            model: job.model.clone(),
            parameters: metadata.parameters,
            artifact_path: metadata.artifact_path,
            artifact_url: metadata.artifact_url,
            byte_len: i64::try_from(metadata.byte_len).unwrap_or(i64::MAX),
            content_type: metadata.content_type,
            is_public: job.is_public,
            needs_review: false,
            created_at: Utc::now(),
        };

        let result_id = match self.store.insert_result(&record, claimed.token).await {
            Ok(()) => record.id,
            Err(StoreError::Conflict(detail)) => {
                // An earlier attempt committed its record but never saw the
                // commit. Complete the job with that record instead.
                let existing = self
                    .store
                    .result_for_job(job.id)
                    .await
                    .map_err(RecordError::Record)?
                    .ok_or(RecordError::Record(StoreError::Conflict(detail)))?;
                tracing::warn!(
                    job_id = %job.id,
                    result_id = %existing.id,
                    "Result already recorded by an earlier attempt; reusing it"
                );
                existing.id
            }
            Err(e) => return Err(RecordError::Record(e)),
        };

        if let Err(source) = self.store.complete(job.id, claimed.token, result_id).await {
            tracing::error!(
                job_id = %job.id,
                result_id = %result_id,
                error = %source,
                "Result recorded but job not marked completed; leaving for reconciliation"
            );
            return Err(RecordError::Unreconciled { result_id, source });
        }

        Ok(result_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("writing result record failed: {0}")]
    Record(#[source] StoreError),

    #[error("result {result_id} written but completing the job failed: {source}")]
    Unreconciled {
        result_id: Uuid,
        #[source]
        source: StoreError,
    },
}

impl RecordError {
    /// An unreconciled result must not be requeued; retrying would upload a
    /// second artifact for the same job.
    pub fn is_retryable(&self) -> bool {
        match self {
            RecordError::Record(e) => e.is_retryable(),
            RecordError::Unreconciled { .. } => false,
        }
    }
}
