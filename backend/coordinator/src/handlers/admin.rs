//! Admin surface: upload, inspect, archive, restore, re-enqueue
//!
//! Upload creates the video record and its pending job in one transaction,
//! writes the source into the uploads area, and publishes a dispatch so an
//! idle worker starts immediately.

use crate::config::{Config, SOURCE_EXTENSIONS};
use crate::db::{job_repo, video_repo};
use crate::error::{ApiError, Result};
use crate::services::archive;
use actix_web::{web, HttpResponse};
use futures::{StreamExt, TryStreamExt};
use job_queue::{JobDispatch, JobPriority, JobQueue};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// POST /api/admin/videos: multipart upload of a new source video.
pub async fn create_video(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    queue: web::Data<JobQueue>,
    mut payload: actix_multipart::Multipart,
) -> Result<HttpResponse> {
    tokio::fs::create_dir_all(&config.storage.tmp_dir).await?;
    tokio::fs::create_dir_all(&config.storage.uploads_dir).await?;

    let mut title: Option<String> = None;
    let mut description: Option<String> = None;
    let mut priority = JobPriority::Normal;
    let mut spooled: Option<(std::path::PathBuf, String)> = None;

    while let Some(field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let mut field = field;
        match field.name() {
            Some("title") => title = Some(read_text_field(&mut field).await?),
            Some("description") => description = Some(read_text_field(&mut field).await?),
            Some("priority") => {
                let raw = read_text_field(&mut field).await?;
                priority = JobPriority::parse(raw.trim()).ok_or_else(|| {
                    ApiError::BadRequest(format!("invalid priority: {raw}"))
                })?;
            }
            Some("file") => {
                let filename = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename())
                    .unwrap_or("upload.mp4")
                    .to_string();
                let extension = filename
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_ascii_lowercase())
                    .unwrap_or_default();
                if !SOURCE_EXTENSIONS.contains(&extension.as_str()) {
                    return Err(ApiError::BadRequest(format!(
                        "unsupported source format: {filename}"
                    )));
                }

                let spool_path = config
                    .storage
                    .tmp_dir
                    .join(format!("source-{}.{extension}", Uuid::new_v4()));
                let mut spool = tokio::fs::File::create(&spool_path).await?;
                let mut received: u64 = 0;
                while let Some(chunk) = field.next().await {
                    let chunk = chunk
                        .map_err(|e| ApiError::BadRequest(format!("upload read error: {e}")))?;
                    received += chunk.len() as u64;
                    if received > config.limits.max_upload_bytes {
                        let _ = tokio::fs::remove_file(&spool_path).await;
                        return Err(ApiError::BadRequest(format!(
                            "upload exceeds cap of {} bytes",
                            config.limits.max_upload_bytes
                        )));
                    }
                    spool.write_all(&chunk).await?;
                }
                spool.flush().await?;
                if received == 0 {
                    let _ = tokio::fs::remove_file(&spool_path).await;
                    return Err(ApiError::BadRequest("empty source file".to_string()));
                }
                spooled = Some((spool_path, extension));
            }
            _ => {
                // Drain unknown fields
                while field.next().await.is_some() {}
            }
        }
    }

    let (spool_path, extension) = spooled
        .ok_or_else(|| ApiError::BadRequest("missing file field in upload".to_string()))?;
    let title = title
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing title field".to_string()))?;
    let slug = video_repo::slugify(&title);

    let (video, job) = match video_repo::create_with_job(
        pool.get_ref(),
        title.trim(),
        &slug,
        description.as_deref(),
        priority.rank(),
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            let _ = tokio::fs::remove_file(&spool_path).await;
            return Err(e);
        }
    };

    let final_path = config
        .storage
        .uploads_dir
        .join(format!("{}.{extension}", video.id));
    if let Err(e) = tokio::fs::rename(&spool_path, &final_path).await {
        // Undo the record so no job points at a missing source
        let _ = video_repo::purge(pool.get_ref(), video.id).await;
        let _ = tokio::fs::remove_file(&spool_path).await;
        return Err(e.into());
    }

    let mut dispatch = JobDispatch::new(job.id, video.id, &video.slug, priority);
    dispatch.source_filename = Some(format!("{}.{extension}", video.id));
    if let Err(e) = queue.publish(&dispatch).await {
        tracing::warn!("Failed to publish dispatch for job {}: {e}", job.id);
    }

    tracing::info!(
        video_id = video.id,
        slug = %video.slug,
        job_id = job.id,
        priority = %priority,
        "Video uploaded and queued"
    );

    Ok(HttpResponse::Created().json(serde_json::json!({
        "video": video,
        "job": job,
    })))
}

async fn read_text_field(field: &mut actix_multipart::Field) -> Result<String> {
    let mut data = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("field read error: {e}")))?;
        data.extend_from_slice(&chunk);
        if data.len() > 64 * 1024 {
            return Err(ApiError::BadRequest("text field too large".to_string()));
        }
    }
    String::from_utf8(data).map_err(|_| ApiError::BadRequest("field is not UTF-8".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
}

/// GET /api/admin/videos: paginated listing with optional status filter.
pub async fn list_videos(
    pool: web::Data<PgPool>,
    params: web::Query<ListParams>,
) -> Result<HttpResponse> {
    if let Some(status) = params.status.as_deref() {
        if status.parse::<media_core::VideoStatus>().is_err() {
            return Err(ApiError::BadRequest(format!("invalid status: {status}")));
        }
    }

    let page = crate::pagination::PageParams {
        page: params.page,
        page_size: params.page_size,
    };
    let (videos, total) = video_repo::list(
        pool.get_ref(),
        params.status.as_deref(),
        params.include_deleted,
        page.page_size(),
        page.offset(),
    )
    .await?;

    Ok(HttpResponse::Ok().json(crate::pagination::Page::new(videos, &page, total)))
}

/// GET /api/admin/videos/{id}: video with job and per-quality progress.
pub async fn get_video(
    pool: web::Data<PgPool>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let video_id = path.into_inner();
    let video = video_repo::get_required(pool.get_ref(), video_id).await?;

    let job = sqlx::query_as::<_, crate::models::JobRow>(
        r#"
        SELECT id, video_id, priority, worker_id, current_step, progress_percent,
               attempt_number, max_attempts, claimed_at, claim_expires_at, started_at,
               last_checkpoint, completed_at, last_error, created_at, updated_at
        FROM transcoding_jobs WHERE video_id = $1
        "#,
    )
    .bind(video_id)
    .fetch_optional(pool.get_ref())
    .await?;

    let quality_progress = match &job {
        Some(job) => job_repo::quality_progress(pool.get_ref(), job.id).await?,
        None => Vec::new(),
    };
    let qualities = video_repo::quality_names(pool.get_ref(), video_id).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "video": video,
        "job": job,
        "qualities": qualities,
        "quality_progress": quality_progress,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub permanent: bool,
}

/// DELETE /api/admin/videos/{id}: soft delete by default (tree moves to the
/// archive area), permanent with `?permanent=true` (rows removed in FK
/// order, all files deleted).
pub async fn delete_video(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    path: web::Path<i64>,
    params: web::Query<DeleteParams>,
) -> Result<HttpResponse> {
    let video_id = path.into_inner();

    if params.permanent {
        let video = video_repo::get_required(pool.get_ref(), video_id).await?;
        video_repo::purge(pool.get_ref(), video_id).await?;
        archive::remove_video_files(
            &config.storage.videos_dir,
            &config.storage.archive_dir,
            &config.storage.uploads_dir,
            &video.slug,
            video_id,
            SOURCE_EXTENSIONS,
        )
        .await;

        tracing::info!(video_id, slug = %video.slug, "Video permanently deleted");
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "status": "deleted",
            "permanent": true,
        })));
    }

    let video = video_repo::soft_delete(pool.get_ref(), video_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("video {video_id} not found or already deleted"))
        })?;

    archive::archive_video_dir(
        &config.storage.videos_dir,
        &config.storage.archive_dir,
        &video.slug,
    )
    .await?;

    tracing::info!(video_id, slug = %video.slug, "Video archived");
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "deleted",
        "permanent": false,
    })))
}

/// POST /api/admin/videos/{id}/restore: undo a soft delete.
pub async fn restore_video(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let video_id = path.into_inner();

    let video = video_repo::restore(pool.get_ref(), video_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("video {video_id} is not archived")))?;

    archive::restore_video_dir(
        &config.storage.videos_dir,
        &config.storage.archive_dir,
        &video.slug,
    )
    .await?;

    tracing::info!(video_id, slug = %video.slug, "Video restored from archive");
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "restored",
        "video": video,
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct RetranscodeRequest {
    pub priority: Option<String>,
    /// Qualities to keep on disk and skip on the next run.
    #[serde(default)]
    pub keep_qualities: Vec<String>,
}

/// POST /api/admin/videos/{id}/retranscode: re-enqueue, optionally keeping
/// existing qualities for a selective re-transcode.
pub async fn retranscode_video(
    pool: web::Data<PgPool>,
    queue: web::Data<JobQueue>,
    path: web::Path<i64>,
    body: Option<web::Json<RetranscodeRequest>>,
) -> Result<HttpResponse> {
    let video_id = path.into_inner();
    let body = body.map(|b| b.into_inner()).unwrap_or_default();

    let priority = match body.priority.as_deref() {
        Some(raw) => JobPriority::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid priority: {raw}")))?,
        None => JobPriority::High,
    };

    for quality in &body.keep_qualities {
        if !media_core::canonical_quality_names().contains(&quality.as_str()) {
            return Err(ApiError::BadRequest(format!("unknown quality: {quality}")));
        }
    }

    let video = video_repo::get_required(pool.get_ref(), video_id).await?;
    if video.deleted_at.is_some() {
        return Err(ApiError::BadRequest(
            "cannot re-transcode an archived video".to_string(),
        ));
    }

    let job = video_repo::reenqueue(
        pool.get_ref(),
        video_id,
        priority.rank(),
        &body.keep_qualities,
    )
    .await?;

    let mut dispatch = JobDispatch::new(job.id, video.id, &video.slug, priority);
    dispatch.duration = video.duration;
    dispatch.source_width = video.source_width;
    dispatch.source_height = video.source_height;
    if let Err(e) = queue.publish(&dispatch).await {
        tracing::warn!("Failed to publish re-transcode dispatch: {e}");
    }

    tracing::info!(
        video_id,
        keep = body.keep_qualities.len(),
        "Video re-enqueued for transcoding"
    );

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "queued",
        "job": job,
        "keep_qualities": body.keep_qualities,
    })))
}

/// GET /api/worker/queue/stats: stream depths for the admin UI.
pub async fn queue_stats(queue: web::Data<JobQueue>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(queue.stats().await))
}
