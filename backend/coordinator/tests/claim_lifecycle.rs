//! Claim lifecycle integration tests
//!
//! These run against a real PostgreSQL instance and are skipped when
//! DATABASE_URL is not set.

use coordinator::db::{job_repo, video_repo};
use media_core::{JobStep, QualityStatus};
use sqlx::PgPool;
use uuid::Uuid;
use worker_protocol::QualityProgressUpdate;

async fn test_pool() -> Option<PgPool> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set, skipping integration test");
            return None;
        }
    };
    let pool = PgPool::connect(&url).await.expect("connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Some(pool)
}

async fn seed_video(pool: &PgPool) -> (i64, i64) {
    let slug = format!("clip-{}", Uuid::new_v4());
    let (video, job) = video_repo::create_with_job(pool, "Test clip", &slug, None, 1)
        .await
        .expect("create video with job");
    (video.id, job.id)
}

#[tokio::test]
async fn test_claim_is_exclusive_between_workers() {
    let Some(pool) = test_pool().await else { return };
    let (video_id, job_id) = seed_video(&pool).await;

    let first = job_repo::claim_specific(&pool, "worker-a", job_id, 1800)
        .await
        .unwrap();
    assert!(first.is_some(), "first claim should win");
    let claimed = first.unwrap();
    assert_eq!(claimed.video.id, video_id);
    assert_eq!(claimed.video.status, "processing");
    assert_eq!(claimed.job.worker_id.as_deref(), Some("worker-a"));

    // Duplicate dispatch: the CAS must refuse the second worker
    let second = job_repo::claim_specific(&pool, "worker-b", job_id, 1800)
        .await
        .unwrap();
    assert!(second.is_none(), "second claim must come back empty");

    video_repo::purge(&pool, video_id).await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_can_be_reclaimed() {
    let Some(pool) = test_pool().await else { return };
    let (video_id, job_id) = seed_video(&pool).await;

    job_repo::claim_specific(&pool, "worker-a", job_id, 1800)
        .await
        .unwrap()
        .expect("initial claim");

    // Fast-forward the lease into the past
    sqlx::query("UPDATE transcoding_jobs SET claim_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    let reclaimed = job_repo::claim_specific(&pool, "worker-b", job_id, 1800)
        .await
        .unwrap()
        .expect("expired claim is up for grabs");
    assert_eq!(reclaimed.job.worker_id.as_deref(), Some("worker-b"));

    // The original worker's progress reports now hit the ownership guard
    let expires = job_repo::record_progress(&pool, job_id, "worker-a", JobStep::Transcode, 50.0, 1800)
        .await
        .unwrap();
    assert!(expires.is_none(), "stale owner must get a conflict");

    video_repo::purge(&pool, video_id).await.unwrap();
}

#[tokio::test]
async fn test_quality_progress_upsert_is_idempotent() {
    let Some(pool) = test_pool().await else { return };
    let (video_id, job_id) = seed_video(&pool).await;

    job_repo::claim_specific(&pool, "worker-a", job_id, 1800)
        .await
        .unwrap()
        .expect("claim");

    let update = QualityProgressUpdate {
        name: "720p".to_string(),
        status: QualityStatus::InProgress,
        progress: 40,
    };
    for _ in 0..3 {
        job_repo::upsert_quality_progress(&pool, job_id, &update)
            .await
            .unwrap();
    }

    let rows = job_repo::quality_progress(&pool, job_id).await.unwrap();
    assert_eq!(rows.len(), 1, "repeated upserts leave exactly one row");
    assert_eq!(rows[0].quality, "720p");
    assert_eq!(rows[0].status, "in_progress");
    assert_eq!(rows[0].progress_percent, 40.0);

    // Last payload wins
    let done = QualityProgressUpdate {
        name: "720p".to_string(),
        status: QualityStatus::Uploaded,
        progress: 100,
    };
    job_repo::upsert_quality_progress(&pool, job_id, &done)
        .await
        .unwrap();
    let rows = job_repo::quality_progress(&pool, job_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "uploaded");

    video_repo::purge(&pool, video_id).await.unwrap();
}

#[tokio::test]
async fn test_retries_exhaust_to_failed_video() {
    let Some(pool) = test_pool().await else { return };
    let (video_id, job_id) = seed_video(&pool).await;

    // Three attempts at max_attempts=3: two retryable failures, then final
    for attempt in 1..=3 {
        let worker = format!("worker-{attempt}");
        job_repo::claim_specific(&pool, &worker, job_id, 1800)
            .await
            .unwrap()
            .expect("claim for attempt");

        let outcome = job_repo::fail(&pool, job_id, &worker, "encoder exploded", true)
            .await
            .unwrap();

        if attempt < 3 {
            assert!(outcome.will_retry, "attempt {attempt} should retry");
            assert_eq!(outcome.video.status, "pending");
            assert_eq!(outcome.job.attempt_number, attempt + 1);
        } else {
            assert!(!outcome.will_retry, "final attempt must not retry");
            assert_eq!(outcome.video.status, "failed");
            assert!(outcome.job.completed_at.is_some());
        }
    }

    let video = video_repo::get_required(&pool, video_id).await.unwrap();
    assert_eq!(video.status, "failed");
    assert_eq!(video.error_message.as_deref(), Some("encoder exploded"));

    video_repo::purge(&pool, video_id).await.unwrap();
}

#[tokio::test]
async fn test_error_messages_truncate_to_500_chars() {
    let Some(pool) = test_pool().await else { return };
    let (video_id, job_id) = seed_video(&pool).await;

    job_repo::claim_specific(&pool, "worker-a", job_id, 1800)
        .await
        .unwrap()
        .expect("claim");

    let huge_error = "x".repeat(5000);
    let outcome = job_repo::fail(&pool, job_id, "worker-a", &huge_error, false)
        .await
        .unwrap();
    assert_eq!(outcome.job.last_error.as_ref().unwrap().len(), 500);
    assert_eq!(outcome.video.error_message.as_ref().unwrap().len(), 500);

    video_repo::purge(&pool, video_id).await.unwrap();
}

#[tokio::test]
async fn test_complete_records_qualities_and_readiness() {
    let Some(pool) = test_pool().await else { return };
    let (video_id, job_id) = seed_video(&pool).await;

    job_repo::claim_specific(&pool, "worker-a", job_id, 1800)
        .await
        .unwrap()
        .expect("claim");

    let qualities = vec![
        worker_protocol::QualityInfo {
            name: "720p".into(),
            width: 1280,
            height: 720,
            bitrate: 2500,
        },
        worker_protocol::QualityInfo {
            name: "original".into(),
            width: 1920,
            height: 1080,
            bitrate: 8421,
        },
    ];

    let job = job_repo::complete(
        &pool,
        job_id,
        "worker-a",
        &qualities,
        Some(30.0),
        Some(1920),
        Some(1080),
    )
    .await
    .unwrap();

    assert!(job.completed_at.is_some());
    assert!(job.worker_id.is_none());
    assert_eq!(job.progress_percent, 100.0);

    let video = video_repo::get_required(&pool, video_id).await.unwrap();
    assert_eq!(video.status, "ready");
    assert!(video.published_at.is_some());
    assert_eq!(video.duration, Some(30.0));

    let names = video_repo::quality_names(&pool, video_id).await.unwrap();
    assert_eq!(names, vec!["720p", "original"]);

    // A completed job is not claimable again
    let again = job_repo::claim_specific(&pool, "worker-b", job_id, 1800)
        .await
        .unwrap();
    assert!(again.is_none());

    video_repo::purge(&pool, video_id).await.unwrap();
}

#[tokio::test]
async fn test_stale_recovery_increments_attempts()
{
    let Some(pool) = test_pool().await else { return };
    let (video_id, job_id) = seed_video(&pool).await;

    job_repo::claim_specific(&pool, "worker-a", job_id, 1800)
        .await
        .unwrap()
        .expect("claim");

    sqlx::query("UPDATE transcoding_jobs SET claim_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

    let stale = job_repo::find_stale(&pool, 10).await.unwrap();
    assert!(stale.iter().any(|s| s.job.id == job_id));

    let outcome = job_repo::recover_stale(&pool, job_id)
        .await
        .unwrap()
        .expect("stale job is recoverable");
    assert!(outcome.will_retry);
    assert_eq!(outcome.job.attempt_number, 2);
    assert!(outcome.job.worker_id.is_none());
    assert_eq!(outcome.video.status, "pending");

    // A second recovery pass finds nothing
    let again = job_repo::recover_stale(&pool, job_id).await.unwrap();
    assert!(again.is_none());

    video_repo::purge(&pool, video_id).await.unwrap();
}
