use genqueue::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    services::{
        catalog::ModelCatalog,
        inference::{HttpInferenceClient, InferenceClient},
        key_pool::KeyPool,
        scheduler::{cancel_on_signal, Scheduler, SchedulerConfig, TickOutcome},
        storage::{ArtifactStore, S3ArtifactStore},
    },
    telemetry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    tracing::info!("Starting generation worker");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    config.check_lease()?;

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        telemetry::describe_metrics();
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    tracing::info!("Connecting to PostgreSQL");
    let pool = db::init_pool(&config.database_url, config.worker_concurrency as u32 + 2).await?;
    db::run_migrations(&pool).await?;
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));

    tracing::info!(keys = config.inference_api_tokens.len(), "Initializing services");
    let keys = Arc::new(KeyPool::new(&config.inference_api_tokens, config.key_cooldown())?);
    let inference: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(
        &config.inference_base_url,
        ModelCatalog::default(),
        keys,
        config.inference_timeout(),
    )?);

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(S3ArtifactStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
        &config.artifact_public_base_url,
        config.upload_timeout(),
    )?);

    let scheduler_config = SchedulerConfig {
        worker_id: config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple())),
        poll_interval: config.poll_interval(),
        max_retries: config.max_retries,
        lease: config.lease(),
        reap_interval: config.reap_interval(),
        concurrency: config.worker_concurrency,
    };
    let scheduler = Arc::new(Scheduler::new(scheduler_config, store, inference, artifacts));

    if config.run_once {
        // Externally scheduled: at most one job, then exit. An empty queue
        // and a job that failed on its own terms both count as success.
        let outcome = scheduler.run_once().await?;
        match &outcome {
            TickOutcome::Idle => tracing::info!("Queue empty, nothing to do"),
            other => tracing::info!(outcome = ?other, "Run-once pass finished"),
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown));

    tracing::info!(
        worker_id = %scheduler.config().worker_id,
        concurrency = scheduler.config().concurrency,
        "Worker ready, starting job processing loop"
    );
    scheduler.run(cancel).await;

    Ok(())
}
