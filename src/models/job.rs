use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a generation job in the queue.
///
/// `Completed` and `Failed` are terminal; the pipeline never moves a job out
/// of either.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 1024;

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

/// Typed generation parameters stored in the job's `parameters` column.
///
/// `steps` and `guidance_scale` stay optional here; the model catalog fills
/// them in right before the inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GenerationParams {
    #[serde(default)]
    #[garde(skip)]
    pub seed: i64,

    #[serde(default = "default_width")]
    #[garde(range(min = 64, max = 2048))]
    pub width: u32,

    #[serde(default = "default_height")]
    #[garde(range(min = 64, max = 2048))]
    pub height: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(range(min = 1, max = 150))]
    pub steps: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(range(min = 0.0, max = 30.0))]
    pub guidance_scale: Option<f64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            seed: 0,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            steps: None,
            guidance_scale: None,
        }
    }
}

/// A queued image generation request and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub prompt: String,
    pub model: String,
    pub parameters: GenerationParams,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub result_reference: Option<Uuid>,
    pub claim_token: Option<Uuid>,
    pub claimed_by: Option<String>,
    pub is_public: bool,
}

/// Fields needed to insert a pending job. Submission belongs to the UI layer;
/// the worker only uses this for local seeding and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: Uuid,
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub parameters: GenerationParams,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub is_public: bool,
}

impl NewJob {
    pub fn new(user_id: Uuid, prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            user_id,
            prompt: prompt.into(),
            model: model.into(),
            parameters: GenerationParams::default(),
            priority: 0,
            is_public: false,
        }
    }
}

/// Opaque proof of ownership over a processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A job together with the token that owns it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: GenerationJob,
    pub token: ClaimToken,
}
