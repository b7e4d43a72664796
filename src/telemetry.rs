use tracing_subscriber::EnvFilter;

/// JSON logs filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for the queue metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("generation_jobs_claimed", "Jobs claimed by a worker");
    metrics::describe_counter!(
        "generation_jobs_completed",
        "Jobs that reached completed, including re-attached results"
    );
    metrics::describe_counter!("generation_jobs_failed", "Jobs that ended failed");
    metrics::describe_counter!("generation_jobs_requeued", "Failed attempts put back to pending");
    metrics::describe_counter!(
        "generation_jobs_reaped",
        "Processing jobs whose lease expired"
    );
    metrics::describe_histogram!(
        "generation_inference_seconds",
        "Time spent waiting on the inference endpoint"
    );
}
