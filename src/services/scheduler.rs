//! Polling loop that drives claimed jobs through generate → upload →
//! finalize.
//!
//! A failure at any step short-circuits into the retry policy; nothing is
//! retried inline. The next poll tick, on this worker or another, is the only
//! retry mechanism.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::claimer::{ClaimError, Claimer};
use super::inference::InferenceClient;
use super::reaper::Reaper;
use super::reconcile::{ReconcileReport, Reconciler};
use super::recorder::{RecordError, ResultRecorder};
use super::retry::RetryPolicy;
use super::storage::ArtifactStore;
use crate::db::{JobStore, StoreError};
use crate::error::PipelineError;
use crate::models::job::{ClaimedJob, JobStatus};
use crate::models::result::ResultMetadata;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub max_retries: i32,
    pub lease: Duration,
    pub reap_interval: Duration,
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            poll_interval: Duration::from_secs(1),
            max_retries: super::retry::DEFAULT_MAX_RETRIES,
            lease: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
            concurrency: 1,
        }
    }
}

/// How one tick ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Queue was empty.
    Idle,
    Completed { job_id: Uuid, result_id: Uuid },
    Requeued { job_id: Uuid, retry_count: i32 },
    Failed { job_id: Uuid, retry_count: i32 },
    /// The run stopped without writing a status: the claim was lost, or the
    /// result is waiting on reconciliation.
    Abandoned { job_id: Uuid },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MaintenanceReport {
    pub reconciled: ReconcileReport,
    pub reaped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error("could not record failure for job {job_id}: {source}")]
    RecordFailure {
        job_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("maintenance failed: {0}")]
    Maintenance(#[source] StoreError),
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    claimer: Claimer,
    inference: Arc<dyn InferenceClient>,
    artifacts: Arc<dyn ArtifactStore>,
    recorder: ResultRecorder,
    retry: RetryPolicy,
    reaper: Reaper,
    reconciler: Reconciler,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        inference: Arc<dyn InferenceClient>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let retry = RetryPolicy::new(config.max_retries);
        Self {
            claimer: Claimer::new(Arc::clone(&store)),
            recorder: ResultRecorder::new(Arc::clone(&store)),
            reaper: Reaper::new(Arc::clone(&store), config.lease, retry.max_retries()),
            reconciler: Reconciler::new(Arc::clone(&store), config.lease),
            store,
            inference,
            artifacts,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Reconcile orphaned results, then reap expired leases. Reconciling
    /// first lets a job that already owns a result complete instead of being
    /// requeued.
    pub async fn maintain(&self) -> Result<MaintenanceReport, SchedulerError> {
        let reconciled = self
            .reconciler
            .reconcile()
            .await
            .map_err(SchedulerError::Maintenance)?;
        let reaped = self.reaper.reap().await.map_err(SchedulerError::Maintenance)?;

        Ok(MaintenanceReport {
            reconciled,
            reaped: reaped.len(),
        })
    }

    /// Run-once shape: maintenance, then at most one job.
    pub async fn run_once(&self) -> Result<TickOutcome, SchedulerError> {
        let report = self.maintain().await?;
        if report != MaintenanceReport::default() {
            tracing::info!(
                reattached = report.reconciled.reattached,
                flagged = report.reconciled.flagged,
                reaped = report.reaped,
                "Maintenance pass complete"
            );
        }
        self.tick(&self.config.worker_id).await
    }

    /// Claim one job and drive it to its next status.
    pub async fn tick(&self, worker_id: &str) -> Result<TickOutcome, SchedulerError> {
        let Some(claimed) = self.claimer.claim_next(worker_id).await? else {
            return Ok(TickOutcome::Idle);
        };
        let job_id = claimed.job.id;

        let error = match self.process(&claimed).await {
            Ok(result_id) => {
                metrics::counter!("generation_jobs_completed").increment(1);
                tracing::info!(job_id = %job_id, result_id = %result_id, "Job completed");
                return Ok(TickOutcome::Completed { job_id, result_id });
            }
            Err(e) => e,
        };

        if error.lost_claim() {
            tracing::warn!(job_id = %job_id, error = %error, "Claim lost mid-run; dropping job");
            return Ok(TickOutcome::Abandoned { job_id });
        }
        if let PipelineError::Record(RecordError::Unreconciled { .. }) = error {
            return Ok(TickOutcome::Abandoned { job_id });
        }

        let updated = match self
            .retry
            .handle_failure(self.store.as_ref(), &claimed, &error)
            .await
        {
            Ok(job) => job,
            Err(StoreError::LostClaim { .. }) => {
                tracing::warn!(job_id = %job_id, "Claim lost before failure could be recorded");
                return Ok(TickOutcome::Abandoned { job_id });
            }
            Err(source) => return Err(SchedulerError::RecordFailure { job_id, source }),
        };

        Ok(match updated.status {
            JobStatus::Pending => TickOutcome::Requeued {
                job_id,
                retry_count: updated.retry_count,
            },
            _ => TickOutcome::Failed {
                job_id,
                retry_count: updated.retry_count,
            },
        })
    }

    async fn process(&self, claimed: &ClaimedJob) -> Result<Uuid, PipelineError> {
        let job = &claimed.job;

        tracing::debug!(job_id = %job.id, model = %job.model, "Generating image");
        let start = Instant::now();
        let image = self.inference.generate(job).await?;
        metrics::histogram!("generation_inference_seconds").record(start.elapsed().as_secs_f64());
        tracing::info!(
            job_id = %job.id,
            inference_ms = start.elapsed().as_millis() as u64,
            bytes = image.bytes.len(),
            "Generation complete"
        );
        self.heartbeat(claimed).await?;

        // Keyed on the job's creation time so a retried run overwrites the
        // same object instead of leaving a second one behind.
        let artifact = self
            .artifacts
            .upload(job.user_id, job.created_at, &image.bytes)
            .await?;
        tracing::debug!(job_id = %job.id, path = %artifact.path, "Artifact stored");
        self.heartbeat(claimed).await?;

        let metadata = ResultMetadata {
            artifact_path: artifact.path,
            artifact_url: artifact.url,
            byte_len: artifact.byte_len,
            content_type: artifact.content_type,
            parameters: image.parameters,
        };
        Ok(self.recorder.finalize(claimed, metadata).await?)
    }

    /// Only a lost claim stops the run; a missed heartbeat is otherwise
    /// harmless while the lease holds.
    async fn heartbeat(&self, claimed: &ClaimedJob) -> Result<(), PipelineError> {
        match self.store.heartbeat(claimed.job.id, claimed.token).await {
            Ok(()) => Ok(()),
            Err(e @ StoreError::LostClaim { .. }) => Err(e.into()),
            Err(e) => {
                tracing::warn!(job_id = %claimed.job.id, error = %e, "Heartbeat failed");
                Ok(())
            }
        }
    }

    /// Continuous shape: `concurrency` worker loops plus a maintenance loop,
    /// all stopping when `cancel` fires. In-flight jobs finish first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        for n in 0..self.config.concurrency.max(1) {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            let worker_id = format!("{}-{}", self.config.worker_id, n);
            tasks.spawn(async move { scheduler.worker_loop(worker_id, cancel).await });
        }

        let scheduler = Arc::clone(&self);
        let maintenance_cancel = cancel.clone();
        tasks.spawn(async move { scheduler.maintenance_loop(maintenance_cancel).await });

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Scheduler task panicked");
                cancel.cancel();
            }
        }
        tracing::info!("Scheduler stopped");
    }

    async fn worker_loop(&self, worker_id: String, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker loop started"
        );

        // Cancellation is only observed between ticks, so a claimed job always
        // reaches its next status before the loop exits.
        while !cancel.is_cancelled() {
            let pause = match self.tick(&worker_id).await {
                Ok(TickOutcome::Idle) => {
                    tracing::trace!(worker_id = %worker_id, "No jobs available, sleeping");
                    true
                }
                // Job processed, check for the next one immediately
                Ok(_) => false,
                Err(e) => {
                    if matches!(&e, SchedulerError::Claim(c) if c.is_transient()) {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Job store unavailable, backing off");
                    } else {
                        tracing::error!(worker_id = %worker_id, error = %e, "Tick failed");
                    }
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::info!(worker_id = %worker_id, "Worker loop stopped");
    }

    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.maintain().await {
                Ok(report) if report != MaintenanceReport::default() => {
                    tracing::info!(
                        reattached = report.reconciled.reattached,
                        flagged = report.reconciled.flagged,
                        reaped = report.reaped,
                        "Maintenance pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Maintenance pass failed"),
            }
        }
    }
}

/// Cancel `cancel` once `signal` resolves. A signal listener that fails to
/// install is logged and never cancels, so the worker keeps running.
pub async fn cancel_on_signal<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("Shutdown requested, finishing in-flight jobs");
            cancel.cancel();
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for shutdown signal; stop the worker externally");
        }
    }
}
