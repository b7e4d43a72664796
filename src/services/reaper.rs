use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::db::store::ReapedJob;
use crate::db::{JobStore, StoreError};
use crate::models::job::JobStatus;

/// Returns jobs stranded in `processing` by a dead or wedged worker to the
/// queue once their lease runs out.
pub struct Reaper {
    store: Arc<dyn JobStore>,
    lease: Duration,
    max_retries: i32,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, lease: Duration, max_retries: i32) -> Self {
        Self {
            store,
            lease,
            max_retries,
        }
    }

    pub async fn reap(&self) -> Result<Vec<ReapedJob>, StoreError> {
        let cutoff = lease_cutoff(Utc::now(), self.lease);
        let reaped = self.store.reap_expired(cutoff, self.max_retries).await?;

        for job in &reaped {
            metrics::counter!("generation_jobs_reaped").increment(1);
            if job.status == JobStatus::Failed {
                metrics::counter!("generation_jobs_failed").increment(1);
            }
            tracing::warn!(
                job_id = %job.id,
                status = %job.status,
                retry_count = job.retry_count,
                lease_secs = self.lease.as_secs(),
                "Reaped job with expired lease"
            );
        }

        Ok(reaped)
    }
}

/// `now - lease`, saturating at the earliest representable instant.
pub(crate) fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
