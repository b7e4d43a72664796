use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use super::store::{JobStore, OrphanedResult, ReapedJob, StoreError};
use crate::models::job::{ClaimToken, GenerationJob, GenerationParams, JobStatus, NewJob};
use crate::models::result::GenerationResult;

const JOB_COLUMNS: &str = "id, user_id, prompt, model, parameters, status, priority, created_at, \
     started_at, heartbeat_at, completed_at, retry_count, last_error, last_retry_at, \
     result_reference, claim_token, claimed_by, is_public";

const RESULT_COLUMNS: &str = "r.id, r.job_id, r.user_id, r.prompt, r.model, r.parameters, \
     r.artifact_path, r.artifact_url, r.byte_len, r.content_type, r.is_public, r.needs_review, \
     r.created_at";

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    JobStatus::from_str(raw).map_err(|_| StoreError::Decode(format!("unknown job status '{raw}'")))
}

fn job_from_row(row: &PgRow) -> Result<GenerationJob, StoreError> {
    let status: String = row.try_get("status")?;
    let Json(parameters): Json<GenerationParams> = row.try_get("parameters")?;

    Ok(GenerationJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        prompt: row.try_get("prompt")?,
        model: row.try_get("model")?,
        parameters,
        status: parse_status(&status)?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        completed_at: row.try_get("completed_at")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        last_retry_at: row.try_get("last_retry_at")?,
        result_reference: row.try_get("result_reference")?,
        claim_token: row.try_get("claim_token")?,
        claimed_by: row.try_get("claimed_by")?,
        is_public: row.try_get("is_public")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<GenerationResult, StoreError> {
    let Json(parameters): Json<GenerationParams> = row.try_get("parameters")?;

    Ok(GenerationResult {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        user_id: row.try_get("user_id")?,
        prompt: row.try_get("prompt")?,
        model: row.try_get("model")?,
        parameters,
        artifact_path: row.try_get("artifact_path")?,
        artifact_url: row.try_get("artifact_url")?,
        byte_len: row.try_get("byte_len")?,
        content_type: row.try_get("content_type")?,
        is_public: row.try_get("is_public")?,
        needs_review: row.try_get("needs_review")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: &NewJob) -> Result<GenerationJob, StoreError> {
        let query = format!(
            "INSERT INTO generation_jobs (user_id, prompt, model, parameters, priority, is_public) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(job.user_id)
            .bind(&job.prompt)
            .bind(&job.model)
            .bind(Json(&job.parameters))
            .bind(job.priority)
            .bind(job.is_public)
            .fetch_one(&self.pool)
            .await?;

        job_from_row(&row)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        token: ClaimToken,
        worker_id: &str,
    ) -> Result<Option<GenerationJob>, StoreError> {
        // SKIP LOCKED lets concurrent claimers pass over a row another
        // transaction is already flipping instead of blocking on it.
        let query = format!(
            "UPDATE generation_jobs \
             SET status = 'processing', started_at = NOW(), heartbeat_at = NOW(), \
                 claim_token = $1, claimed_by = $2 \
             WHERE id = ( \
                 SELECT id FROM generation_jobs \
                 WHERE status = 'pending' \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(token.0)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn heartbeat(&self, job_id: Uuid, token: ClaimToken) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET heartbeat_at = NOW()
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LostClaim { job_id });
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        token: ClaimToken,
        next: JobStatus,
        error: &str,
    ) -> Result<GenerationJob, StoreError> {
        let query = format!(
            "UPDATE generation_jobs \
             SET status = $3::text, \
                 retry_count = retry_count + 1, \
                 last_error = $4, \
                 last_retry_at = CASE WHEN $3::text = 'pending' THEN NOW() ELSE last_retry_at END, \
                 completed_at = CASE WHEN $3::text = 'failed' THEN NOW() ELSE NULL END, \
                 result_reference = NULL, \
                 claim_token = NULL \
             WHERE id = $1 AND status = 'processing' AND claim_token = $2 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(job_id)
            .bind(token.0)
            .bind(next.to_string())
            .bind(error)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::LostClaim { job_id }),
        }
    }

    async fn insert_result(
        &self,
        result: &GenerationResult,
        token: ClaimToken,
    ) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO generation_results
                (id, job_id, user_id, prompt, model, parameters, artifact_path, artifact_url,
                 byte_len, content_type, is_public, needs_review, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            WHERE EXISTS (
                SELECT 1 FROM generation_jobs
                WHERE id = $2 AND status = 'processing' AND claim_token = $14
            )
            "#,
        )
        .bind(result.id)
        .bind(result.job_id)
        .bind(result.user_id)
        .bind(&result.prompt)
        .bind(&result.model)
        .bind(Json(&result.parameters))
        .bind(&result.artifact_path)
        .bind(&result.artifact_url)
        .bind(result.byte_len)
        .bind(&result.content_type)
        .bind(result.is_public)
        .bind(result.needs_review)
        .bind(result.created_at)
        .bind(token.0)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::LostClaim {
                job_id: result.job_id,
            });
        }
        Ok(())
    }

    async fn result_for_job(&self, job_id: Uuid) -> Result<Option<GenerationResult>, StoreError> {
        let query = format!("SELECT {RESULT_COLUMNS} FROM generation_results r WHERE r.job_id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(result_from_row).transpose()
    }

    async fn complete(
        &self,
        job_id: Uuid,
        token: ClaimToken,
        result_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'completed',
                completed_at = NOW(),
                result_reference = $3,
                claim_token = NULL
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token.0)
        .bind(result_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LostClaim { job_id });
        }
        Ok(())
    }

    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<ReapedJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE generation_jobs j
            SET status = CASE WHEN j.retry_count + 1 >= $2 THEN 'failed' ELSE 'pending' END,
                retry_count = j.retry_count + 1,
                last_error = 'lease expired while processing',
                last_retry_at = NOW(),
                completed_at = CASE WHEN j.retry_count + 1 >= $2 THEN NOW() ELSE NULL END,
                claim_token = NULL
            WHERE j.status = 'processing'
              AND COALESCE(j.heartbeat_at, j.started_at) < $1
              AND NOT EXISTS (SELECT 1 FROM generation_results r WHERE r.job_id = j.id)
            RETURNING j.id, j.status, j.retry_count
            "#,
        )
        .bind(cutoff)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<ReapedJob, StoreError> {
                let status: String = r.try_get("status")?;
                Ok(ReapedJob {
                    id: r.try_get("id")?,
                    status: parse_status(&status)?,
                    retry_count: r.try_get("retry_count")?,
                })
            })
            .collect()
    }

    async fn orphaned_results(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<OrphanedResult>, StoreError> {
        let query = format!(
            "SELECT {RESULT_COLUMNS}, j.status AS job_status \
             FROM generation_results r \
             JOIN generation_jobs j ON j.id = r.job_id \
             WHERE j.status <> 'completed' AND NOT r.needs_review AND r.created_at < $1 \
             ORDER BY r.created_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| -> Result<OrphanedResult, StoreError> {
                let job_status: String = r.try_get("job_status")?;
                Ok(OrphanedResult {
                    result: result_from_row(r)?,
                    job_status: parse_status(&job_status)?,
                })
            })
            .collect()
    }

    async fn reattach(&self, job_id: Uuid, result_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'completed',
                completed_at = NOW(),
                result_reference = $2,
                claim_token = NULL
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job_id)
        .bind(result_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn flag_for_review(&self, result_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE generation_results SET needs_review = TRUE WHERE id = $1")
            .bind(result_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
