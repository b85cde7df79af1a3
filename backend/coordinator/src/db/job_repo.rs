//! Transcoding job persistence: the claim CAS, progress upserts, completion
//! and failure transitions, and stale-claim recovery.
//!
//! Claim uniqueness is enforced only here, by a compare-and-set inside a
//! single transaction. Every job-scoped mutation re-verifies
//! `worker_id = caller AND claim_expires_at > NOW()` in its WHERE clause, so
//! a worker whose lease lapsed can never mutate a row.

use crate::error::{ApiError, Result};
use crate::models::{ClaimedJob, JobRow, QualityProgressRow, VideoRow};
use chrono::{DateTime, Utc};
use media_core::{JobStep, QualityStatus};
use sqlx::{PgPool, Postgres, Transaction};
use worker_protocol::{QualityInfo, QualityProgressUpdate};

const JOB_COLUMNS: &str = "id, video_id, priority, worker_id, current_step, progress_percent, \
                           attempt_number, max_attempts, claimed_at, claim_expires_at, started_at, \
                           last_checkpoint, completed_at, last_error, created_at, updated_at";

const VIDEO_COLUMNS: &str = "id, title, slug, description, category_id, duration, source_width, \
                             source_height, status, error_message, published_at, deleted_at, \
                             created_at, updated_at";

/// A job is claimable when its video is live and either nobody holds it or
/// the previous holder's lease lapsed.
const CLAIMABLE: &str = r#"
    v.deleted_at IS NULL
    AND j.completed_at IS NULL
    AND (
        (j.worker_id IS NULL AND v.status = 'pending')
        OR (j.claim_expires_at IS NOT NULL AND j.claim_expires_at <= NOW()
            AND v.status IN ('pending', 'processing'))
    )
"#;

/// Atomically claim the oldest pending job for `worker_id`.
pub async fn claim_next(
    pool: &PgPool,
    worker_id: &str,
    lease_secs: u64,
) -> Result<Option<ClaimedJob>> {
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        WITH candidate AS (
            SELECT j.id
            FROM transcoding_jobs j
            JOIN videos v ON v.id = j.video_id
            WHERE {CLAIMABLE}
            ORDER BY j.priority DESC, j.created_at ASC
            FOR UPDATE OF j SKIP LOCKED
            LIMIT 1
        )
        UPDATE transcoding_jobs j
        SET worker_id = $1,
            claimed_at = NOW(),
            claim_expires_at = NOW() + $2 * INTERVAL '1 second',
            started_at = COALESCE(j.started_at, NOW()),
            current_step = 'pending',
            updated_at = NOW()
        FROM candidate
        WHERE j.id = candidate.id
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .bind(lease_secs as i64)
    .fetch_optional(&mut *tx)
    .await?;

    finish_claim(tx, job).await
}

/// Atomically claim one specific job (queue-dispatched path). Returns None
/// when the job is already owned, completed, or gone; duplicate dispatches
/// resolve here.
pub async fn claim_specific(
    pool: &PgPool,
    worker_id: &str,
    job_id: i64,
    lease_secs: u64,
) -> Result<Option<ClaimedJob>> {
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        WITH candidate AS (
            SELECT j.id
            FROM transcoding_jobs j
            JOIN videos v ON v.id = j.video_id
            WHERE j.id = $3 AND {CLAIMABLE}
            FOR UPDATE OF j SKIP LOCKED
        )
        UPDATE transcoding_jobs j
        SET worker_id = $1,
            claimed_at = NOW(),
            claim_expires_at = NOW() + $2 * INTERVAL '1 second',
            started_at = COALESCE(j.started_at, NOW()),
            current_step = 'pending',
            updated_at = NOW()
        FROM candidate
        WHERE j.id = candidate.id
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .bind(lease_secs as i64)
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    finish_claim(tx, job).await
}

/// Shared tail of both claim paths: move the video to processing, load the
/// envelope, commit.
async fn finish_claim(
    mut tx: Transaction<'_, Postgres>,
    job: Option<JobRow>,
) -> Result<Option<ClaimedJob>> {
    let Some(job) = job else {
        tx.rollback().await?;
        return Ok(None);
    };

    let video = sqlx::query_as::<_, VideoRow>(&format!(
        r#"
        UPDATE videos
        SET status = 'processing', updated_at = NOW()
        WHERE id = $1
        RETURNING {VIDEO_COLUMNS}
        "#
    ))
    .bind(job.video_id)
    .fetch_one(&mut *tx)
    .await?;

    let existing_qualities = sqlx::query_scalar::<_, String>(
        "SELECT quality FROM video_qualities WHERE video_id = $1 ORDER BY quality",
    )
    .bind(job.video_id)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(ClaimedJob {
        job,
        video,
        existing_qualities,
    }))
}

/// Progress checkpoint: updates the step, extends the lease, and returns the
/// new expiry. None means the caller no longer owns the job (409).
pub async fn record_progress(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    step: JobStep,
    percent: f32,
    lease_secs: u64,
) -> Result<Option<DateTime<Utc>>> {
    let expires = sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        UPDATE transcoding_jobs
        SET current_step = $3,
            progress_percent = $4,
            last_checkpoint = NOW(),
            claim_expires_at = NOW() + $5 * INTERVAL '1 second',
            updated_at = NOW()
        WHERE id = $1 AND worker_id = $2 AND claim_expires_at > NOW()
        RETURNING claim_expires_at
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(step.as_str())
    .bind(percent.clamp(0.0, 100.0))
    .bind(lease_secs as i64)
    .fetch_optional(pool)
    .await?;
    Ok(expires)
}

/// Extend the lease without touching step or progress (upload paths).
/// None means the caller no longer owns the job.
pub async fn extend_lease(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    lease_secs: u64,
) -> Result<Option<DateTime<Utc>>> {
    let expires = sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        UPDATE transcoding_jobs
        SET claim_expires_at = NOW() + $3 * INTERVAL '1 second',
            last_checkpoint = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND worker_id = $2 AND claim_expires_at > NOW()
        RETURNING claim_expires_at
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(lease_secs as i64)
    .fetch_optional(pool)
    .await?;
    Ok(expires)
}

/// Idempotent per-quality progress upsert. Repeated calls with the same
/// payload leave exactly one row equal to the last payload.
pub async fn upsert_quality_progress(
    pool: &PgPool,
    job_id: i64,
    update: &QualityProgressUpdate,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO quality_progress (job_id, quality, status, progress_percent)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (job_id, quality)
        DO UPDATE SET status = EXCLUDED.status,
                      progress_percent = EXCLUDED.progress_percent,
                      updated_at = NOW()
        "#,
    )
    .bind(job_id)
    .bind(&update.name)
    .bind(update.status.as_str())
    .bind((update.progress.clamp(0, 100)) as f32)
    .execute(pool)
    .await?;
    Ok(())
}

/// Patch still-NULL video metadata from the first probe.
pub async fn patch_video_metadata(
    pool: &PgPool,
    video_id: i64,
    duration: Option<f64>,
    source_width: Option<i32>,
    source_height: Option<i32>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE videos
        SET duration = COALESCE(duration, $2),
            source_width = COALESCE(source_width, $3),
            source_height = COALESCE(source_height, $4),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(video_id)
    .bind(duration)
    .bind(source_width)
    .bind(source_height)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record an uploaded artifact for a quality.
pub async fn mark_quality_uploaded(pool: &PgPool, job_id: i64, quality: &str) -> Result<()> {
    upsert_quality_progress(
        pool,
        job_id,
        &QualityProgressUpdate {
            name: quality.to_string(),
            status: QualityStatus::Uploaded,
            progress: 100,
        },
    )
    .await
}

/// Load the job owned by `worker_id` for a video under a live lease.
/// Used by the transfer endpoints; expired or foreign claims yield 409.
pub async fn require_live_claim(pool: &PgPool, video_id: i64, worker_id: &str) -> Result<JobRow> {
    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM transcoding_jobs
        WHERE video_id = $1 AND worker_id = $2 AND claim_expires_at > NOW()
        "#
    ))
    .bind(video_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| {
        ApiError::Conflict("claim expired or job reassigned to another worker".to_string())
    })?;
    Ok(job)
}

/// Same check keyed by job id.
pub async fn require_live_claim_by_job(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
) -> Result<JobRow> {
    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM transcoding_jobs
        WHERE id = $1 AND worker_id = $2 AND claim_expires_at > NOW()
        "#
    ))
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| {
        ApiError::Conflict("claim expired or job reassigned to another worker".to_string())
    })?;
    Ok(job)
}

/// Finish a job: record quality rows, mark the video ready, clear the claim.
/// The happens-before edge from "all uploads acknowledged" to "video READY"
/// is this transaction.
pub async fn complete(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    qualities: &[QualityInfo],
    duration: Option<f64>,
    source_width: Option<i32>,
    source_height: Option<i32>,
) -> Result<JobRow> {
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM transcoding_jobs
        WHERE id = $1 AND worker_id = $2 AND claim_expires_at > NOW()
        FOR UPDATE
        "#
    ))
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| {
        ApiError::Conflict("claim expired or job reassigned to another worker".to_string())
    })?;

    for quality in qualities {
        sqlx::query(
            r#"
            INSERT INTO video_qualities (video_id, quality, width, height, bitrate_kbps)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (video_id, quality)
            DO UPDATE SET width = EXCLUDED.width,
                          height = EXCLUDED.height,
                          bitrate_kbps = EXCLUDED.bitrate_kbps
            "#,
        )
        .bind(job.video_id)
        .bind(&quality.name)
        .bind(quality.width)
        .bind(quality.height)
        .bind(quality.bitrate)
        .execute(&mut *tx)
        .await?;
    }

    // READY implies at least one quality row; an empty completion is only
    // legal when a previous run already recorded them
    let quality_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM video_qualities WHERE video_id = $1",
    )
    .bind(job.video_id)
    .fetch_one(&mut *tx)
    .await?;
    if quality_count == 0 {
        return Err(ApiError::BadRequest(
            "cannot complete a job with no recorded qualities".to_string(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE videos
        SET status = 'ready',
            published_at = COALESCE(published_at, NOW()),
            duration = COALESCE($2, duration),
            source_width = COALESCE($3, source_width),
            source_height = COALESCE($4, source_height),
            error_message = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job.video_id)
    .bind(duration)
    .bind(source_width)
    .bind(source_height)
    .execute(&mut *tx)
    .await?;

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        UPDATE transcoding_jobs
        SET completed_at = NOW(),
            progress_percent = 100,
            current_step = 'finalize',
            worker_id = NULL,
            claim_expires_at = NULL,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(job)
}

/// Outcome of a failure report.
#[derive(Debug, Clone)]
pub struct FailOutcome {
    pub job: JobRow,
    pub video: VideoRow,
    pub will_retry: bool,
}

/// Report a job failure. While attempts remain (and the caller asked for a
/// retry) the job is released and the video returns to pending; otherwise
/// both are finalized as failed.
pub async fn fail(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    error: &str,
    retry: bool,
) -> Result<FailOutcome> {
    let error = worker_protocol::truncate_error(error);
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM transcoding_jobs
        WHERE id = $1 AND worker_id = $2 AND claim_expires_at > NOW()
        FOR UPDATE
        "#
    ))
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| {
        ApiError::Conflict("claim expired or job reassigned to another worker".to_string())
    })?;

    let will_retry = retry && job.attempt_number < job.max_attempts;

    let (job, video) = if will_retry {
        let job = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE transcoding_jobs
            SET attempt_number = attempt_number + 1,
                worker_id = NULL,
                claimed_at = NULL,
                claim_expires_at = NULL,
                current_step = 'pending',
                progress_percent = 0,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(&error)
        .fetch_one(&mut *tx)
        .await?;

        let video = sqlx::query_as::<_, VideoRow>(&format!(
            r#"
            UPDATE videos
            SET status = 'pending', updated_at = NOW()
            WHERE id = $1
            RETURNING {VIDEO_COLUMNS}
            "#
        ))
        .bind(job.video_id)
        .fetch_one(&mut *tx)
        .await?;

        (job, video)
    } else {
        let job = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE transcoding_jobs
            SET completed_at = NOW(),
                worker_id = NULL,
                claim_expires_at = NULL,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(&error)
        .fetch_one(&mut *tx)
        .await?;

        let video = sqlx::query_as::<_, VideoRow>(&format!(
            r#"
            UPDATE videos
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {VIDEO_COLUMNS}
            "#
        ))
        .bind(job.video_id)
        .bind(&error)
        .fetch_one(&mut *tx)
        .await?;

        (job, video)
    };

    tx.commit().await?;

    Ok(FailOutcome {
        job,
        video,
        will_retry,
    })
}

/// A stale job together with its video, as found by the janitor.
#[derive(Debug, Clone)]
pub struct StaleJob {
    pub job: JobRow,
    pub video: VideoRow,
}

/// Jobs whose lease lapsed without completion or release.
pub async fn find_stale(pool: &PgPool, limit: i64) -> Result<Vec<StaleJob>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM transcoding_jobs
        WHERE worker_id IS NOT NULL
          AND completed_at IS NULL
          AND claim_expires_at IS NOT NULL
          AND claim_expires_at < NOW()
        ORDER BY claim_expires_at ASC
        LIMIT $1
        "#
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut stale = Vec::with_capacity(rows.len());
    for job in rows {
        let video = sqlx::query_as::<_, VideoRow>(&format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE id = $1"
        ))
        .bind(job.video_id)
        .fetch_one(pool)
        .await?;
        stale.push(StaleJob { job, video });
    }
    Ok(stale)
}

/// Recover one stale claim as a failed attempt. Guarded by the same CAS
/// predicate, so a worker that revived in the meantime keeps its job.
/// Returns the outcome, or None when the row changed under us.
pub async fn recover_stale(pool: &PgPool, job_id: i64) -> Result<Option<FailOutcome>> {
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM transcoding_jobs
        WHERE id = $1
          AND worker_id IS NOT NULL
          AND completed_at IS NULL
          AND claim_expires_at IS NOT NULL
          AND claim_expires_at < NOW()
        FOR UPDATE SKIP LOCKED
        "#
    ))
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(job) = job else {
        tx.rollback().await?;
        return Ok(None);
    };

    let will_retry = job.attempt_number < job.max_attempts;

    let (job, video) = if will_retry {
        let job = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE transcoding_jobs
            SET attempt_number = attempt_number + 1,
                worker_id = NULL,
                claimed_at = NULL,
                claim_expires_at = NULL,
                current_step = 'pending',
                progress_percent = 0,
                last_error = 'claim expired: worker did not complete or release the job',
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .fetch_one(&mut *tx)
        .await?;

        let video = sqlx::query_as::<_, VideoRow>(&format!(
            r#"
            UPDATE videos
            SET status = 'pending', updated_at = NOW()
            WHERE id = $1
            RETURNING {VIDEO_COLUMNS}
            "#
        ))
        .bind(job.video_id)
        .fetch_one(&mut *tx)
        .await?;

        (job, video)
    } else {
        let job = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE transcoding_jobs
            SET completed_at = NOW(),
                worker_id = NULL,
                claim_expires_at = NULL,
                last_error = 'claim expired after final attempt',
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .fetch_one(&mut *tx)
        .await?;

        let video = sqlx::query_as::<_, VideoRow>(&format!(
            r#"
            UPDATE videos
            SET status = 'failed',
                error_message = 'transcoding abandoned: retry attempts exhausted',
                updated_at = NOW()
            WHERE id = $1
            RETURNING {VIDEO_COLUMNS}
            "#
        ))
        .bind(job.video_id)
        .fetch_one(&mut *tx)
        .await?;

        (job, video)
    };

    tx.commit().await?;

    Ok(Some(FailOutcome {
        job,
        video,
        will_retry,
    }))
}

/// Per-quality progress rows for a job (admin surface).
pub async fn quality_progress(pool: &PgPool, job_id: i64) -> Result<Vec<QualityProgressRow>> {
    let rows = sqlx::query_as::<_, QualityProgressRow>(
        r#"
        SELECT id, job_id, quality, status, progress_percent, error_message,
               created_at, updated_at
        FROM quality_progress
        WHERE job_id = $1
        ORDER BY quality
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
