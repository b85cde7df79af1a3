//! Job lifecycle endpoints: claim, progress, complete, fail
//!
//! Every job-scoped operation verifies claim ownership and lease liveness in
//! its SQL predicate; a mismatch surfaces as 409 and mutates nothing. The
//! worker must treat 409 as "abort, someone else may own this".

use crate::config::Config;
use crate::db::job_repo;
use crate::error::{with_db_retry, ApiError, Result};
use actix_web::{web, HttpResponse};
use alerts::AlertSender;
use job_queue::{JobDispatch, JobPriority, JobQueue};
use sqlx::PgPool;
use worker_protocol::{
    ClaimRequest, ClaimResponse, CompleteRequest, CompleteResponse, FailRequest, FailResponse,
    ProgressRequest, ProgressResponse,
};

use crate::auth::AuthedWorker;

/// Claim a job. With `job_id` this confirms a queue dispatch; without it the
/// oldest pending job wins. Either way the database CAS is authoritative and
/// an empty response means "nothing for you".
pub async fn claim(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    worker: AuthedWorker,
    body: web::Json<ClaimRequest>,
) -> Result<HttpResponse> {
    let lease_secs = config.worker.claim_duration_secs;
    let worker_id = worker.0.worker_id.clone();
    let job_id = body.job_id;

    let claimed = with_db_retry(|| {
        let pool = pool.clone();
        let worker_id = worker_id.clone();
        async move {
            match job_id {
                Some(id) => job_repo::claim_specific(pool.get_ref(), &worker_id, id, lease_secs).await,
                None => job_repo::claim_next(pool.get_ref(), &worker_id, lease_secs).await,
            }
        }
    })
    .await?;

    let Some(claimed) = claimed else {
        return Ok(HttpResponse::Ok().json(ClaimResponse::empty()));
    };

    tracing::info!(
        job_id = claimed.job.id,
        video_id = claimed.video.id,
        slug = %claimed.video.slug,
        worker_id = %worker_id,
        attempt = claimed.job.attempt_number,
        "Job claimed"
    );

    let source_filename =
        super::transfer::resolve_source_file(&config.storage.uploads_dir, claimed.video.id)
            .await
            .map(|(_, name)| name)
            .unwrap_or_else(|| format!("{}.mp4", claimed.video.id));

    Ok(HttpResponse::Ok().json(ClaimResponse {
        job_id: Some(claimed.job.id),
        video_id: Some(claimed.video.id),
        video_slug: Some(claimed.video.slug.clone()),
        duration: claimed.video.duration,
        source_width: claimed.video.source_width,
        source_height: claimed.video.source_height,
        source_filename: Some(source_filename),
        claim_expires_at: claimed.job.claim_expires_at,
        existing_qualities: claimed.existing_qualities,
        message: "Job claimed".to_string(),
    }))
}

/// Progress checkpoint. Extends the lease, upserts per-quality rows, and
/// patches video metadata the first time the probe reports it.
pub async fn progress(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    worker: AuthedWorker,
    path: web::Path<i64>,
    body: web::Json<ProgressRequest>,
) -> Result<HttpResponse> {
    let job_id = path.into_inner();
    let body = body.into_inner();
    let worker_id = worker.0.worker_id.clone();
    let lease_secs = config.worker.claim_duration_secs;

    let expires = with_db_retry(|| {
        let pool = pool.clone();
        let worker_id = worker_id.clone();
        async move {
            job_repo::record_progress(
                pool.get_ref(),
                job_id,
                &worker_id,
                body.current_step,
                body.progress_percent,
                lease_secs,
            )
            .await
        }
    })
    .await?
    .ok_or_else(|| {
        ApiError::Conflict("claim expired or job reassigned to another worker".to_string())
    })?;

    let job = job_repo::require_live_claim_by_job(pool.get_ref(), job_id, &worker_id).await?;

    for update in &body.quality_progress {
        job_repo::upsert_quality_progress(pool.get_ref(), job_id, update).await?;
    }

    if body.duration.is_some() || body.source_width.is_some() || body.source_height.is_some() {
        job_repo::patch_video_metadata(
            pool.get_ref(),
            job.video_id,
            body.duration,
            body.source_width,
            body.source_height,
        )
        .await?;
    }

    Ok(HttpResponse::Ok().json(ProgressResponse {
        status: "ok".to_string(),
        claim_expires_at: expires,
    }))
}

/// Complete a job: record qualities, flip the video to READY, release the
/// claim, and acknowledge nothing less than a fully uploaded artifact set.
pub async fn complete(
    pool: web::Data<PgPool>,
    worker: AuthedWorker,
    path: web::Path<i64>,
    body: web::Json<CompleteRequest>,
) -> Result<HttpResponse> {
    let job_id = path.into_inner();
    let body = body.into_inner();
    let worker_id = worker.0.worker_id.clone();

    for quality in &body.qualities {
        if media_core::preset_by_name(&quality.name).is_none()
            && quality.name != media_core::ORIGINAL_QUALITY
        {
            return Err(ApiError::BadRequest(format!(
                "unknown quality: {}",
                quality.name
            )));
        }
    }

    let job = with_db_retry(|| {
        let pool = pool.clone();
        let worker_id = worker_id.clone();
        let body = body.clone();
        async move {
            job_repo::complete(
                pool.get_ref(),
                job_id,
                &worker_id,
                &body.qualities,
                body.duration,
                body.source_width,
                body.source_height,
            )
            .await
        }
    })
    .await?;

    tracing::info!(
        job_id,
        video_id = job.video_id,
        qualities = body.qualities.len(),
        "Job completed, video ready"
    );

    Ok(HttpResponse::Ok().json(CompleteResponse {
        status: "ok".to_string(),
        message: "Video is ready".to_string(),
    }))
}

/// Report a job failure. Retryable failures release the job for another
/// attempt; exhausted ones finalize the video as failed and feed the
/// dead-letter sink.
pub async fn fail(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    worker: AuthedWorker,
    queue: web::Data<JobQueue>,
    alert_sender: web::Data<AlertSender>,
    path: web::Path<i64>,
    body: web::Json<FailRequest>,
) -> Result<HttpResponse> {
    let job_id = path.into_inner();
    let body = body.into_inner();
    let worker_id = worker.0.worker_id.clone();

    let outcome = with_db_retry(|| {
        let pool = pool.clone();
        let worker_id = worker_id.clone();
        let error = body.error_message.clone();
        async move { job_repo::fail(pool.get_ref(), job_id, &worker_id, &error, body.retry).await }
    })
    .await?;

    alert_sender.job_failed(
        outcome.video.id,
        &outcome.video.slug,
        outcome.job.attempt_number,
        &body.error_message,
        outcome.will_retry,
    );

    if outcome.will_retry {
        tracing::warn!(
            job_id,
            video_id = outcome.video.id,
            attempt = outcome.job.attempt_number,
            max_attempts = outcome.job.max_attempts,
            "Job failed, will retry"
        );

        // Re-dispatch so an idle worker picks the retry up immediately
        let mut dispatch = JobDispatch::new(
            outcome.job.id,
            outcome.video.id,
            &outcome.video.slug,
            JobPriority::from_rank(outcome.job.priority),
        );
        dispatch.duration = outcome.video.duration;
        dispatch.source_width = outcome.video.source_width;
        dispatch.source_height = outcome.video.source_height;
        if let Err(e) = queue.publish(&dispatch).await {
            tracing::warn!("Failed to publish retry dispatch for job {job_id}: {e}");
        }
    } else {
        tracing::error!(
            job_id,
            video_id = outcome.video.id,
            error = %body.error_message,
            "Job failed permanently"
        );

        let dispatch = JobDispatch::new(
            outcome.job.id,
            outcome.video.id,
            &outcome.video.slug,
            JobPriority::from_rank(outcome.job.priority),
        );
        if let Err(e) = queue.dead_letter(&dispatch, &body.error_message).await {
            tracing::warn!("Failed to dead-letter job {job_id}: {e}");
        }

        alert_sender.max_retries_exceeded(
            outcome.video.id,
            &outcome.video.slug,
            outcome.job.max_attempts,
            outcome.job.last_error.as_deref(),
        );

        if config.worker.cleanup_source_on_failure {
            if let Some((path, name)) = super::transfer::resolve_source_file(
                &config.storage.uploads_dir,
                outcome.video.id,
            )
            .await
            {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => tracing::info!(
                        video_id = outcome.video.id,
                        file = %name,
                        "Removed source after permanent failure"
                    ),
                    Err(e) => tracing::warn!("Failed to remove source {name}: {e}"),
                }
            }
        }
    }

    Ok(HttpResponse::Ok().json(FailResponse {
        status: "ok".to_string(),
        will_retry: outcome.will_retry,
        attempt_number: outcome.job.attempt_number,
    }))
}
