use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::reaper::lease_cutoff;
use crate::db::{JobStore, StoreError};
use crate::models::job::JobStatus;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub reattached: usize,
    pub flagged: usize,
}

/// Finds result records whose job never reached `completed` and either
/// completes the job with them or flags them for manual review.
///
/// A `pending` or `processing` owner is completed with the record, which also
/// voids any claim a later attempt holds. A `failed` owner is left alone and
/// the record is flagged.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    /// Records younger than this may still be mid-finalize.
    grace: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JobStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let older_than = lease_cutoff(Utc::now(), self.grace);
        let orphans = self.store.orphaned_results(older_than).await?;
        let mut report = ReconcileReport::default();

        for orphan in orphans {
            let result = &orphan.result;
            let reattachable =
                matches!(orphan.job_status, JobStatus::Pending | JobStatus::Processing);
            let reattached = reattachable && self.store.reattach(result.job_id, result.id).await?;

            if reattached {
                report.reattached += 1;
                metrics::counter!("generation_jobs_completed").increment(1);
                tracing::info!(
                    job_id = %result.job_id,
                    result_id = %result.id,
                    "Re-attached orphaned result to its job"
                );
            } else {
                self.store.flag_for_review(result.id).await?;
                report.flagged += 1;
                tracing::warn!(
                    job_id = %result.job_id,
                    result_id = %result.id,
                    job_status = %orphan.job_status,
                    artifact = %result.artifact_path,
                    "Orphaned result flagged for manual review"
                );
            }
        }

        Ok(report)
    }
}
