use serde::Serialize;
use uuid::Uuid;

use super::job::{GenerationJob, JobStatus};

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub result_reference: Option<Uuid>,
}

impl From<GenerationJob> for JobStatusResponse {
    fn from(job: GenerationJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            retry_count: job.retry_count,
            last_error: job.last_error,
            result_reference: job.result_reference,
        }
    }
}
