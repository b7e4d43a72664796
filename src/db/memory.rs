//! In-process job store.
//!
//! Mirrors the conditional-write semantics of the PostgreSQL store behind a
//! single mutex, so a claim is atomic with respect to every other call. It
//! keeps an audit log of the writes it applied and can be told to fail the
//! next call of a given operation, which the pipeline tests lean on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::store::{JobStore, OrphanedResult, ReapedJob, StoreError};
use crate::models::job::{ClaimToken, GenerationJob, JobStatus, NewJob};
use crate::models::result::GenerationResult;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Claim,
    Heartbeat,
    RecordFailure,
    InsertResult,
    Complete,
    Reap,
}

/// One applied write, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteEvent {
    Inserted(Uuid),
    Claimed(Uuid),
    Heartbeat(Uuid),
    Failure { job_id: Uuid, status: JobStatus },
    ResultInserted { job_id: Uuid, result_id: Uuid },
    Completed(Uuid),
    Reaped(Uuid),
    Reattached(Uuid),
    Flagged(Uuid),
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, GenerationJob>,
    results: HashMap<Uuid, GenerationResult>,
    audit: Vec<WriteEvent>,
    faults: HashSet<StoreOp>,
}

impl State {
    fn take_fault(&mut self, op: StoreOp) -> Result<(), StoreError> {
        if self.faults.remove(&op) {
            return Err(StoreError::Unavailable(format!("injected fault on {op:?}")));
        }
        Ok(())
    }

    fn owned_mut(&mut self, job_id: Uuid, token: ClaimToken) -> Result<&mut GenerationJob, StoreError> {
        match self.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing && job.claim_token == Some(token.0) => {
                Ok(job)
            }
            _ => Err(StoreError::LostClaim { job_id }),
        }
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with [`StoreError::Unavailable`].
    pub fn inject_fault(&self, op: StoreOp) {
        self.state.lock().faults.insert(op);
    }

    pub fn write_log(&self) -> Vec<WriteEvent> {
        self.state.lock().audit.clone()
    }

    pub fn results(&self) -> Vec<GenerationResult> {
        self.state.lock().results.values().cloned().collect()
    }

    pub fn jobs(&self) -> Vec<GenerationJob> {
        self.state.lock().jobs.values().cloned().collect()
    }

    /// Shift a job's progress marks into the past, as if its worker stalled.
    pub fn backdate(&self, job_id: Uuid, by: chrono::Duration) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.started_at = job.started_at.map(|t| t - by);
            job.heartbeat_at = job.heartbeat_at.map(|t| t - by);
        }
        for result in state.results.values_mut().filter(|r| r.job_id == job_id) {
            result.created_at -= by;
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, new: &NewJob) -> Result<GenerationJob, StoreError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        // Nudge timestamps so insertion order stays visible to the claim order.
        let created_at = state
            .jobs
            .values()
            .map(|j| j.created_at)
            .max()
            .map_or(now, |latest| latest.max(now) + chrono::Duration::microseconds(1));

        let job = GenerationJob {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            prompt: new.prompt.clone(),
            model: new.model.clone(),
            parameters: new.parameters.clone(),
            status: JobStatus::Pending,
            priority: new.priority,
            created_at,
            started_at: None,
            heartbeat_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            last_retry_at: None,
            result_reference: None,
            claim_token: None,
            claimed_by: None,
            is_public: new.is_public,
        };
        state.jobs.insert(job.id, job.clone());
        state.audit.push(WriteEvent::Inserted(job.id));
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        token: ClaimToken,
        worker_id: &str,
    ) -> Result<Option<GenerationJob>, StoreError> {
        let mut state = self.state.lock();
        state.take_fault(StoreOp::Claim)?;

        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let now = Utc::now();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::LostClaim { job_id })?;
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        job.claim_token = Some(token.0);
        job.claimed_by = Some(worker_id.to_string());
        let claimed = job.clone();
        state.audit.push(WriteEvent::Claimed(job_id));
        Ok(Some(claimed))
    }

    async fn heartbeat(&self, job_id: Uuid, token: ClaimToken) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_fault(StoreOp::Heartbeat)?;
        state.owned_mut(job_id, token)?.heartbeat_at = Some(Utc::now());
        state.audit.push(WriteEvent::Heartbeat(job_id));
        Ok(())
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        token: ClaimToken,
        next: JobStatus,
        error: &str,
    ) -> Result<GenerationJob, StoreError> {
        let mut state = self.state.lock();
        state.take_fault(StoreOp::RecordFailure)?;

        let now = Utc::now();
        let job = state.owned_mut(job_id, token)?;
        job.status = next;
        job.retry_count += 1;
        job.last_error = Some(error.to_string());
        if next == JobStatus::Pending {
            job.last_retry_at = Some(now);
            job.completed_at = None;
        } else {
            job.completed_at = Some(now);
        }
        job.result_reference = None;
        job.claim_token = None;
        let updated = job.clone();
        state.audit.push(WriteEvent::Failure { job_id, status: next });
        Ok(updated)
    }

    async fn insert_result(
        &self,
        result: &GenerationResult,
        token: ClaimToken,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_fault(StoreOp::InsertResult)?;
        state.owned_mut(result.job_id, token)?;

        if state.results.values().any(|r| r.job_id == result.job_id) {
            return Err(StoreError::Conflict(format!(
                "job {} already has a result record",
                result.job_id
            )));
        }
        state.results.insert(result.id, result.clone());
        state.audit.push(WriteEvent::ResultInserted {
            job_id: result.job_id,
            result_id: result.id,
        });
        Ok(())
    }

    async fn result_for_job(&self, job_id: Uuid) -> Result<Option<GenerationResult>, StoreError> {
        let state = self.state.lock();
        Ok(state.results.values().find(|r| r.job_id == job_id).cloned())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        token: ClaimToken,
        result_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_fault(StoreOp::Complete)?;

        let job = state.owned_mut(job_id, token)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result_reference = Some(result_id);
        job.claim_token = None;
        state.audit.push(WriteEvent::Completed(job_id));
        Ok(())
    }

    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<ReapedJob>, StoreError> {
        let mut state = self.state.lock();
        state.take_fault(StoreOp::Reap)?;

        let owning: HashSet<Uuid> = state.results.values().map(|r| r.job_id).collect();
        let now = Utc::now();
        let mut reaped = Vec::new();

        for job in state.jobs.values_mut() {
            let last_progress = job.heartbeat_at.or(job.started_at);
            let expired = job.status == JobStatus::Processing
                && last_progress.is_some_and(|t| t < cutoff)
                && !owning.contains(&job.id);
            if !expired {
                continue;
            }

            job.retry_count += 1;
            job.status = if job.retry_count >= max_retries {
                JobStatus::Failed
            } else {
                JobStatus::Pending
            };
            job.last_error = Some("lease expired while processing".to_string());
            job.last_retry_at = Some(now);
            job.completed_at = (job.status == JobStatus::Failed).then_some(now);
            job.claim_token = None;
            reaped.push(ReapedJob {
                id: job.id,
                status: job.status,
                retry_count: job.retry_count,
            });
        }

        for r in &reaped {
            state.audit.push(WriteEvent::Reaped(r.id));
        }
        Ok(reaped)
    }

    async fn orphaned_results(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<OrphanedResult>, StoreError> {
        let state = self.state.lock();
        let mut orphans: Vec<OrphanedResult> = state
            .results
            .values()
            .filter(|r| !r.needs_review && r.created_at < older_than)
            .filter_map(|r| {
                let job = state.jobs.get(&r.job_id)?;
                (job.status != JobStatus::Completed).then(|| OrphanedResult {
                    result: r.clone(),
                    job_status: job.status,
                })
            })
            .collect();
        orphans.sort_by_key(|o| o.result.created_at);
        Ok(orphans)
    }

    async fn reattach(&self, job_id: Uuid, result_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result_reference = Some(result_id);
        job.claim_token = None;
        state.audit.push(WriteEvent::Reattached(job_id));
        Ok(true)
    }

    async fn flag_for_review(&self, result_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(result) = state.results.get_mut(&result_id) {
            result.needs_review = true;
            state.audit.push(WriteEvent::Flagged(result_id));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(prompt: &str, priority: i32) -> NewJob {
        NewJob {
            priority,
            ..NewJob::new(Uuid::new_v4(), prompt, "turbo")
        }
    }

    #[tokio::test]
    async fn claims_highest_priority_then_oldest() {
        let store = InMemoryJobStore::new();
        let low = store.insert_job(&new_job("low", 0)).await.unwrap();
        let high_old = store.insert_job(&new_job("high-old", 5)).await.unwrap();
        let _high_new = store.insert_job(&new_job("high-new", 5)).await.unwrap();

        let first = store.claim_next(ClaimToken::mint(), "w1").await.unwrap().unwrap();
        assert_eq!(first.id, high_old.id);
        assert_eq!(first.status, JobStatus::Processing);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));

        store.claim_next(ClaimToken::mint(), "w1").await.unwrap().unwrap();
        let third = store.claim_next(ClaimToken::mint(), "w1").await.unwrap().unwrap();
        assert_eq!(third.id, low.id);
    }

    #[tokio::test]
    async fn stale_token_cannot_write() {
        let store = InMemoryJobStore::new();
        store.insert_job(&new_job("a cat", 0)).await.unwrap();
        let token = ClaimToken::mint();
        let job = store.claim_next(token, "w1").await.unwrap().unwrap();

        let err = store.complete(job.id, ClaimToken::mint(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::LostClaim { .. }));

        let unchanged = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::Processing);
        assert!(unchanged.result_reference.is_none());
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let store = InMemoryJobStore::new();
        store.insert_job(&new_job("a cat", 0)).await.unwrap();
        store.inject_fault(StoreOp::Claim);

        let err = store.claim_next(ClaimToken::mint(), "w1").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.claim_next(ClaimToken::mint(), "w1").await.unwrap().is_some());
    }
}
