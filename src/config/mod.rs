use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Status server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus listener for the worker. Unset disables the exporter.
    #[serde(default)]
    pub metrics_addr: Option<String>,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Inference API bearer tokens, comma-separated. Each one joins the key pool.
    pub inference_api_tokens: Vec<String>,

    /// Base URL that model paths from the catalog are appended to
    #[serde(default = "default_inference_base_url")]
    pub inference_base_url: String,

    /// Object storage bucket name
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// Access key ID (S3-compatible)
    pub s3_access_key: String,

    /// Secret access key (S3-compatible)
    pub s3_secret_key: String,

    /// Public URL prefix that artifact keys resolve under
    pub artifact_public_base_url: String,

    /// Identifies this process in `claimed_by`. Defaults to a random id.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Process at most one job then exit.
    #[serde(default)]
    pub run_once: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// How long a processing job may go without progress before it is reaped
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Number of pipelines run concurrently inside one worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    /// How long a key sits out after the endpoint rate-limited it
    #[serde(default = "default_key_cooldown_secs")]
    pub key_cooldown_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_inference_base_url() -> String {
    "https://api-inference.huggingface.co/models".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> i32 {
    3
}

fn default_lease_secs() -> u64 {
    600
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_inference_timeout_secs() -> u64 {
    120
}

fn default_upload_timeout_secs() -> u64 {
    30
}

fn default_key_cooldown_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn key_cooldown(&self) -> Duration {
        Duration::from_secs(self.key_cooldown_secs)
    }

    /// The lease must outlast one inference call plus one upload; no
    /// heartbeat is written while either is in flight.
    pub fn check_lease(&self) -> Result<(), ConfigError> {
        let required_secs = self
            .inference_timeout_secs
            .saturating_add(self.upload_timeout_secs);
        if self.lease_secs <= required_secs {
            return Err(ConfigError::LeaseTooShort {
                lease_secs: self.lease_secs,
                required_secs,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "LEASE_SECS ({lease_secs}) must exceed INFERENCE_TIMEOUT_SECS + UPLOAD_TIMEOUT_SECS ({required_secs})"
    )]
    LeaseTooShort { lease_secs: u64, required_secs: u64 },
}
