use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{ClaimToken, GenerationJob, JobStatus, NewJob};
use crate::models::result::GenerationResult;

/// A job the reaper pulled out of an expired lease.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub retry_count: i32,
}

/// A result record whose owning job never reached `completed`.
#[derive(Debug, Clone)]
pub struct OrphanedResult {
    pub result: GenerationResult,
    pub job_status: JobStatus,
}

/// Persistent job table plus result records.
///
/// Every method that mutates a claimed job takes the claim token and only
/// applies when the row is still `processing` under that token; otherwise it
/// returns [`StoreError::LostClaim`] without writing.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job. Used by local seeding and tests.
    async fn insert_job(&self, job: &NewJob) -> Result<GenerationJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>, StoreError>;

    /// Atomically move the highest-priority, oldest pending job to
    /// `processing` under `token`. Performs no write when the queue is empty.
    async fn claim_next(
        &self,
        token: ClaimToken,
        worker_id: &str,
    ) -> Result<Option<GenerationJob>, StoreError>;

    /// Refresh the lease of a claimed job.
    async fn heartbeat(&self, job_id: Uuid, token: ClaimToken) -> Result<(), StoreError>;

    /// Write the outcome of a failed attempt: bumps `retry_count`, records
    /// `last_error`, releases the claim, and moves the job to `next`
    /// (`pending` or `failed`).
    async fn record_failure(
        &self,
        job_id: Uuid,
        token: ClaimToken,
        next: JobStatus,
        error: &str,
    ) -> Result<GenerationJob, StoreError>;

    /// Insert the result record for a job still claimed under `token`.
    async fn insert_result(
        &self,
        result: &GenerationResult,
        token: ClaimToken,
    ) -> Result<(), StoreError>;

    /// The result record already written for `job_id`, if any.
    async fn result_for_job(&self, job_id: Uuid) -> Result<Option<GenerationResult>, StoreError>;

    /// Flip a claimed job to `completed` pointing at `result_id`.
    async fn complete(
        &self,
        job_id: Uuid,
        token: ClaimToken,
        result_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Requeue (or fail, once `max_retries` is spent) every processing job
    /// whose last progress mark is older than `cutoff` and which owns no
    /// result record.
    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<ReapedJob>, StoreError>;

    /// Result records created before `older_than` whose job is not completed
    /// and which are not already flagged.
    async fn orphaned_results(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<OrphanedResult>, StoreError>;

    /// Complete a `pending` or `processing` job with an existing result,
    /// dropping any claim on it. Returns false when the job was not in a state
    /// that allows it.
    async fn reattach(&self, job_id: Uuid, result_id: Uuid) -> Result<bool, StoreError>;

    async fn flag_for_review(&self, result_id: Uuid) -> Result<(), StoreError>;

    /// Connectivity check for health endpoints.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    #[error("Claim on job {job_id} is no longer held")]
    LostClaim { job_id: Uuid },

    #[error("Constraint violation: {0}")]
    Conflict(String),

    #[error("Malformed row: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// Infrastructure failures are worth another tick; data errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(err.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}
