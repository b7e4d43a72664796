use genqueue::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgJobStore},
    routes, telemetry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::process::ExitCode;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Read-only status server for the generation queue.
#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    match serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Status server exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    tracing::info!("Initializing generation queue status server");

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    telemetry::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let pool = db::init_pool(&config.database_url, 5).await?;

    tracing::info!("Running database migrations");
    db::run_migrations(&pool).await?;

    let state = AppState::new(Arc::new(PgJobStore::new(pool)));

    let app = routes::router(state, Some(prometheus_handle))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Status server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
