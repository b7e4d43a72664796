use std::sync::Arc;

use crate::db::{JobStore, StoreError};
use crate::models::job::{ClaimToken, ClaimedJob};

/// Hands out exclusive ownership of the next eligible job.
pub struct Claimer {
    store: Arc<dyn JobStore>,
}

impl Claimer {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Claim the highest-priority, oldest pending job for `worker_id`.
    ///
    /// `Ok(None)` means the queue was empty and nothing was written. On error
    /// no row was touched.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, ClaimError> {
        let token = ClaimToken::mint();
        let Some(job) = self.store.claim_next(token, worker_id).await? else {
            return Ok(None);
        };

        metrics::counter!("generation_jobs_claimed").increment(1);
        tracing::info!(
            job_id = %job.id,
            worker_id = %worker_id,
            model = %job.model,
            priority = job.priority,
            retry_count = job.retry_count,
            "Job claimed"
        );

        Ok(Some(ClaimedJob { job, token }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("job store unavailable during claim: {0}")]
    Unavailable(String),

    #[error("claim failed: {0}")]
    Store(StoreError),
}

impl ClaimError {
    /// Transient errors mean "back off this tick and try again".
    pub fn is_transient(&self) -> bool {
        matches!(self, ClaimError::Unavailable(_))
    }
}

impl From<StoreError> for ClaimError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ClaimError::Unavailable(msg),
            other => ClaimError::Store(other),
        }
    }
}
