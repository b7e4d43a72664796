//! Job store tests against a real PostgreSQL database.
//!
//! These tests require a disposable PostgreSQL database reachable through
//! DATABASE_URL. Migrations are applied on connect. They share the claim
//! order, so run them on one thread.
//!
//! Run with: cargo test --test postgres_test -- --ignored --test-threads=1

use chrono::Utc;
use futures::future::join_all;
use genqueue::{
    db::{self, JobStore, PgJobStore, StoreError},
    models::job::{ClaimToken, GenerationParams, JobStatus, NewJob},
    models::result::GenerationResult,
};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

async fn connect() -> PgJobStore {
    PgJobStore::new(connect_pool().await)
}

async fn connect_pool() -> PgPool {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::init_pool(&url, 10)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    // Leftovers from an earlier run would outrank the jobs inserted here.
    sqlx::query(
        "UPDATE generation_jobs SET status = 'failed', claim_token = NULL
         WHERE priority = $1 AND status IN ('pending', 'processing')",
    )
    .bind(i32::MAX)
    .execute(&pool)
    .await
    .expect("Failed to clear leftover test jobs");

    pool
}

/// Push a job's progress marks an hour into the past, as if its worker died.
async fn stall(pool: &PgPool, job_id: Uuid) {
    sqlx::query(
        "UPDATE generation_jobs
         SET heartbeat_at = NOW() - interval '1 hour', started_at = NOW() - interval '1 hour'
         WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .expect("Failed to backdate job");
}

async fn claim(store: &PgJobStore, job_id: Uuid) -> ClaimToken {
    let token = ClaimToken::mint();
    let claimed = store
        .claim_next(token, "pg-worker")
        .await
        .expect("claim")
        .expect("queue empty");
    assert_eq!(claimed.id, job_id);
    token
}

fn reap_cutoff() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(10)
}

/// Highest priority in the table so these tests win the claim order.
fn urgent_job(prompt: &str) -> NewJob {
    NewJob {
        priority: i32::MAX,
        ..NewJob::new(Uuid::new_v4(), prompt, "turbo")
    }
}

fn result_for(job_id: Uuid, user_id: Uuid) -> GenerationResult {
    GenerationResult {
        id: Uuid::new_v4(),
        job_id,
        user_id,
        prompt: "a cat".to_string(),
        model: "turbo".to_string(),
        parameters: GenerationParams::default(),
        artifact_path: format!("{user_id}/{}.png", Utc::now().timestamp_micros()),
        artifact_url: "https://cdn.test/cat.png".to_string(),
        byte_len: 16,
        content_type: "image/png".to_string(),
        is_public: false,
        needs_review: false,
        created_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_concurrent_claims_are_exclusive() {
    let store = Arc::new(connect().await);
    let job = store.insert_job(&urgent_job("race")).await.expect("insert");

    let claims = (0..8).map(|n| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .claim_next(ClaimToken::mint(), &format!("pg-worker-{n}"))
                .await
        })
    });
    let winners = join_all(claims)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("claim failed"))
        .flatten()
        .filter(|claimed| claimed.id == job.id)
        .count();

    assert_eq!(winners, 1, "exactly one worker must own the job");
    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert!(stored.claim_token.is_some());
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_finalize_requires_claim_token() {
    let store = connect().await;
    let job = store.insert_job(&urgent_job("finalize")).await.expect("insert");

    let token = ClaimToken::mint();
    let claimed = store
        .claim_next(token, "pg-worker")
        .await
        .expect("claim")
        .expect("queue empty");
    assert_eq!(claimed.id, job.id);

    store.heartbeat(job.id, token).await.expect("heartbeat");

    let record = result_for(job.id, job.user_id);
    let err = store
        .insert_result(&record, ClaimToken::mint())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LostClaim { .. }), "got {err:?}");

    store.insert_result(&record, token).await.expect("insert result");
    store.complete(job.id, token, record.id).await.expect("complete");

    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result_reference, Some(record.id));
    assert!(done.completed_at.is_some());

    // Completed jobs reject further writes.
    let err = store
        .record_failure(job.id, token, JobStatus::Pending, "late failure")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LostClaim { .. }), "got {err:?}");
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_failure_requeues_and_counts() {
    let store = connect().await;
    let job = store.insert_job(&urgent_job("requeue")).await.expect("insert");

    let token = ClaimToken::mint();
    store.claim_next(token, "pg-worker").await.expect("claim");

    let updated = store
        .record_failure(job.id, token, JobStatus::Pending, "HTTP 503")
        .await
        .expect("record failure");
    assert_eq!(updated.status, JobStatus::Pending);
    assert_eq!(updated.retry_count, 1);
    assert_eq!(updated.last_error.as_deref(), Some("HTTP 503"));
    assert!(updated.last_retry_at.is_some());
    assert!(updated.claim_token.is_none());
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_store_ping() {
    let store = connect().await;
    store.ping().await.expect("ping");
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_reaper_requeues_stalled_job() {
    let pool = connect_pool().await;
    let store = PgJobStore::new(pool.clone());
    let job = store.insert_job(&urgent_job("stalled")).await.expect("insert");
    claim(&store, job.id).await;
    stall(&pool, job.id).await;

    let reaped = store.reap_expired(reap_cutoff(), 3).await.expect("reap");
    let ours = reaped
        .iter()
        .find(|r| r.id == job.id)
        .expect("stalled job was not reaped");
    assert_eq!(ours.status, JobStatus::Pending);
    assert_eq!(ours.retry_count, 1);

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.claim_token.is_none());
    assert_eq!(
        stored.last_error.as_deref(),
        Some("lease expired while processing")
    );
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_reaper_fails_job_out_of_retries() {
    let pool = connect_pool().await;
    let store = PgJobStore::new(pool.clone());
    let job = store.insert_job(&urgent_job("exhausted")).await.expect("insert");
    claim(&store, job.id).await;
    sqlx::query("UPDATE generation_jobs SET retry_count = 2 WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .expect("set retry count");
    stall(&pool, job.id).await;

    store.reap_expired(reap_cutoff(), 3).await.expect("reap");

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_reaper_skips_job_with_result() {
    let pool = connect_pool().await;
    let store = PgJobStore::new(pool.clone());
    let job = store.insert_job(&urgent_job("has result")).await.expect("insert");
    let token = claim(&store, job.id).await;
    store
        .insert_result(&result_for(job.id, job.user_id), token)
        .await
        .expect("insert result");
    stall(&pool, job.id).await;

    let reaped = store.reap_expired(reap_cutoff(), 3).await.expect("reap");
    assert!(reaped.iter().all(|r| r.id != job.id));

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_orphaned_result_is_listed_and_reattached() {
    let store = connect().await;
    let job = store.insert_job(&urgent_job("orphan")).await.expect("insert");
    let token = claim(&store, job.id).await;
    let record = result_for(job.id, job.user_id);
    store.insert_result(&record, token).await.expect("insert result");

    let found = store
        .result_for_job(job.id)
        .await
        .expect("lookup")
        .expect("result missing");
    assert_eq!(found.id, record.id);
    assert_eq!(found.artifact_path, record.artifact_path);

    let later = Utc::now() + chrono::Duration::minutes(1);
    let orphans = store.orphaned_results(later).await.expect("orphans");
    let ours = orphans
        .iter()
        .find(|o| o.result.id == record.id)
        .expect("orphan not listed");
    assert_eq!(ours.job_status, JobStatus::Processing);
    assert_eq!(ours.result.job_id, job.id);

    assert!(store.reattach(job.id, record.id).await.expect("reattach"));
    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result_reference, Some(record.id));
    assert!(done.claim_token.is_none());

    // The stale claim can no longer write.
    let err = store.complete(job.id, token, record.id).await.unwrap_err();
    assert!(matches!(err, StoreError::LostClaim { .. }), "got {err:?}");

    let orphans = store.orphaned_results(later).await.expect("orphans");
    assert!(orphans.iter().all(|o| o.result.id != record.id));
    assert!(!store.reattach(job.id, record.id).await.expect("reattach"));
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_requeued_job_is_reattached() {
    let store = connect().await;
    let job = store.insert_job(&urgent_job("requeued orphan")).await.expect("insert");
    let token = claim(&store, job.id).await;
    let record = result_for(job.id, job.user_id);
    store.insert_result(&record, token).await.expect("insert result");
    store
        .record_failure(job.id, token, JobStatus::Pending, "job store unavailable")
        .await
        .expect("record failure");

    assert!(store.reattach(job.id, record.id).await.expect("reattach"));
    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result_reference, Some(record.id));
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_flagged_result_leaves_orphan_listing() {
    let store = connect().await;
    let job = store.insert_job(&urgent_job("failed orphan")).await.expect("insert");
    let token = claim(&store, job.id).await;
    let record = result_for(job.id, job.user_id);
    store.insert_result(&record, token).await.expect("insert result");
    store
        .record_failure(job.id, token, JobStatus::Failed, "HTTP 401")
        .await
        .expect("record failure");

    let later = Utc::now() + chrono::Duration::minutes(1);
    let orphans = store.orphaned_results(later).await.expect("orphans");
    let ours = orphans
        .iter()
        .find(|o| o.result.id == record.id)
        .expect("orphan not listed");
    assert_eq!(ours.job_status, JobStatus::Failed);
    assert!(!store.reattach(job.id, record.id).await.expect("reattach"));

    store.flag_for_review(record.id).await.expect("flag");
    let orphans = store.orphaned_results(later).await.expect("orphans");
    assert!(orphans.iter().all(|o| o.result.id != record.id));
    let flagged = store.result_for_job(job.id).await.unwrap().unwrap();
    assert!(flagged.needs_review);
}
