use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::GenerationParams;

/// Permanent record of a generated image, read by the gallery layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub prompt: String,
    pub model: String,
    pub parameters: GenerationParams,
    pub artifact_path: String,
    pub artifact_url: String,
    pub byte_len: i64,
    pub content_type: String,
    pub is_public: bool,
    /// Set by reconciliation when the owning job ended failed.
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
}

/// Artifact facts gathered by the pipeline, handed to the result recorder.
#[derive(Debug, Clone)]
pub struct ResultMetadata {
    pub artifact_path: String,
    pub artifact_url: String,
    pub byte_len: usize,
    pub content_type: String,
    /// Parameters after model defaults were applied.
    pub parameters: GenerationParams,
}
