use crate::db::{JobStore, StoreError};
use crate::error::PipelineError;
use crate::models::job::{ClaimedJob, GenerationJob, JobStatus};

pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// What a failed attempt turns into.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub next: JobStatus,
    /// `retry_count` after this failure is written.
    pub retry_count: i32,
    pub last_error: String,
}

/// Requeue-or-fail policy for failed pipeline runs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32) -> Self {
        Self {
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Decide the next status from the job and the failure alone. Every
    /// failure counts against the budget; fatal ones end the job regardless.
    pub fn next_status(&self, job: &GenerationJob, retryable: bool, error: &str) -> RetryDecision {
        let retry_count = job.retry_count + 1;
        let next = if retryable && retry_count < self.max_retries {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };

        let last_error = if next == JobStatus::Failed && retryable {
            format!("retries exhausted after {retry_count} attempts: {error}")
        } else {
            error.to_string()
        };

        RetryDecision {
            next,
            retry_count,
            last_error,
        }
    }

    /// Apply the decision for `error` with a single conditional write.
    pub async fn handle_failure(
        &self,
        store: &dyn JobStore,
        claimed: &ClaimedJob,
        error: &PipelineError,
    ) -> Result<GenerationJob, StoreError> {
        let decision = self.next_status(&claimed.job, error.is_retryable(), &error.to_string());

        let updated = store
            .record_failure(
                claimed.job.id,
                claimed.token,
                decision.next,
                &decision.last_error,
            )
            .await?;

        match updated.status {
            JobStatus::Pending => {
                metrics::counter!("generation_jobs_requeued").increment(1);
                tracing::info!(
                    job_id = %updated.id,
                    retry_count = updated.retry_count,
                    error = %error,
                    "Job re-queued for retry"
                );
            }
            _ => {
                metrics::counter!("generation_jobs_failed").increment(1);
                tracing::warn!(
                    job_id = %updated.id,
                    retry_count = updated.retry_count,
                    retryable = error.is_retryable(),
                    error = %error,
                    "Job failed"
                );
            }
        }

        Ok(updated)
    }
}
