use async_trait::async_trait;
use garde::Validate;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::{ModelCatalog, ResolvedParams};
use super::key_pool::{KeyPool, KeyPoolError};
use super::truncate;
use crate::models::job::{GenerationJob, GenerationParams};

/// Raw image returned by the model endpoint.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Parameters actually sent, with model defaults applied.
    pub parameters: GenerationParams,
}

/// Turns a job into image bytes. Implementations never touch job state.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, job: &GenerationJob) -> Result<GeneratedImage, InferenceError>;
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    parameters: InferenceParameters,
}

#[derive(Serialize)]
struct InferenceParameters {
    seed: i64,
    width: u32,
    height: u32,
    num_inference_steps: u32,
    guidance_scale: f64,
}

impl From<&ResolvedParams> for InferenceParameters {
    fn from(p: &ResolvedParams) -> Self {
        Self {
            seed: p.seed,
            width: p.width,
            height: p.height,
            num_inference_steps: p.steps,
            guidance_scale: p.guidance_scale,
        }
    }
}

/// Client for a hosted text-to-image endpoint that answers with raw image bytes.
pub struct HttpInferenceClient {
    http: Client,
    base_url: String,
    catalog: ModelCatalog,
    keys: Arc<KeyPool>,
}

impl HttpInferenceClient {
    pub fn new(
        base_url: &str,
        catalog: ModelCatalog,
        keys: Arc<KeyPool>,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(InferenceError::Network)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            catalog,
            keys,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn generate(&self, job: &GenerationJob) -> Result<GeneratedImage, InferenceError> {
        job.parameters
            .validate()
            .map_err(|report| InferenceError::InvalidParams(report.to_string()))?;

        let profile = self
            .catalog
            .resolve(&job.model)
            .ok_or_else(|| InferenceError::UnknownModel(job.model.clone()))?;
        let resolved = ModelCatalog::normalize(&profile, &job.parameters);

        let body = InferenceRequest {
            inputs: &job.prompt,
            parameters: InferenceParameters::from(&resolved),
        };

        let lease = self.keys.allocate()?;

        tracing::debug!(
            job_id = %job.id,
            model = %profile.path,
            steps = resolved.steps,
            guidance = resolved.guidance_scale,
            "Calling inference endpoint"
        );

        let response = self
            .http
            .post(self.endpoint(&profile.path))
            .bearer_auth(lease.key())
            .json(&body)
            .send()
            .await
            .map_err(InferenceError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                lease.rate_limited();
            }
            return Err(InferenceError::from_status(status, detail));
        }
        drop(lease);

        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());

        let bytes = response
            .bytes()
            .await
            .map_err(InferenceError::from_transport)?
            .to_vec();

        if bytes.is_empty() {
            return Err(InferenceError::InvalidResponse("empty body".to_string()));
        }

        let content_type = match header_type {
            Some(ct) if ct.starts_with("image/") => ct,
            other => {
                // Some gateways label images as octet-stream; trust the bytes.
                let format = image::guess_format(&bytes).map_err(|_| {
                    InferenceError::InvalidResponse(format!(
                        "expected image bytes, got content type {}",
                        other.as_deref().unwrap_or("none")
                    ))
                })?;
                format.to_mime_type().to_string()
            }
        };

        Ok(GeneratedImage {
            bytes,
            content_type,
            parameters: GenerationParams::from(&resolved),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Rate limited by inference endpoint: {0}")]
    RateLimited(String),

    #[error("Inference endpoint unavailable (HTTP {status}): {detail}")]
    Unavailable { status: u16, detail: String },

    #[error("Inference request timed out")]
    Timeout,

    #[error("Inference transport failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Inference credentials rejected (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("Inference request rejected (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Invalid generation parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid inference response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Keys(#[from] KeyPoolError),
}

impl InferenceError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout
        } else {
            InferenceError::Network(err)
        }
    }

    pub fn from_status(status: StatusCode, detail: String) -> Self {
        let code = status.as_u16();
        let detail = truncate(detail, 500);
        match status {
            StatusCode::TOO_MANY_REQUESTS => InferenceError::RateLimited(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                InferenceError::Unauthorized { status: code }
            }
            s if s.is_server_error() => InferenceError::Unavailable { status: code, detail },
            _ => InferenceError::Rejected { status: code, detail },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::RateLimited(_)
            | InferenceError::Unavailable { .. }
            | InferenceError::Timeout
            | InferenceError::Network(_) => true,
            InferenceError::Keys(KeyPoolError::AllCoolingDown { .. }) => true,
            InferenceError::Keys(KeyPoolError::Empty)
            | InferenceError::Unauthorized { .. }
            | InferenceError::Rejected { .. }
            | InferenceError::UnknownModel(_)
            | InferenceError::InvalidParams(_)
            | InferenceError::InvalidResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let retryable = [429u16, 500, 502, 503, 504];
        for code in retryable {
            let err = InferenceError::from_status(StatusCode::from_u16(code).unwrap(), String::new());
            assert!(err.is_retryable(), "HTTP {code} should be retryable");
        }

        let fatal = [400u16, 401, 403, 404, 413, 422];
        for code in fatal {
            let err = InferenceError::from_status(StatusCode::from_u16(code).unwrap(), String::new());
            assert!(!err.is_retryable(), "HTTP {code} should be fatal");
        }
    }

    #[test]
    fn auth_failures_are_reported_as_unauthorized() {
        let err = InferenceError::from_status(StatusCode::UNAUTHORIZED, "bad token".into());
        assert!(matches!(err, InferenceError::Unauthorized { status: 401 }));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let err = InferenceError::from_status(StatusCode::BAD_REQUEST, "x".repeat(2000));
        match err {
            InferenceError::Rejected { detail, .. } => assert_eq!(detail.len(), 500),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn request_body_matches_wire_contract() {
        let resolved = ResolvedParams {
            seed: 7,
            width: 512,
            height: 512,
            steps: 4,
            guidance_scale: 0.0,
        };
        let body = InferenceRequest {
            inputs: "a cat",
            parameters: InferenceParameters::from(&resolved),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "inputs": "a cat",
                "parameters": {
                    "seed": 7,
                    "width": 512,
                    "height": 512,
                    "num_inference_steps": 4,
                    "guidance_scale": 0.0
                }
            })
        );
    }
}
