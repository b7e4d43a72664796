use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Status API: health, job status, and (when a recorder handle is given)
/// Prometheus metrics.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .with_state(state);

    match prometheus {
        Some(handle) => app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        ),
        None => app,
    }
}
