//! Video persistence
//!
//! Creation is always paired with a transcoding job in one transaction so a
//! video can never exist without its job, and vice versa.

use crate::error::{ApiError, Result};
use crate::models::{JobRow, VideoRow};
use sqlx::PgPool;

const VIDEO_COLUMNS: &str = "id, title, slug, description, category_id, duration, source_width, \
                             source_height, status, error_message, published_at, deleted_at, \
                             created_at, updated_at";

const JOB_COLUMNS: &str = "id, video_id, priority, worker_id, current_step, progress_percent, \
                           attempt_number, max_attempts, claimed_at, claim_expires_at, started_at, \
                           last_checkpoint, completed_at, last_error, created_at, updated_at";

/// Create a video and its pending transcoding job atomically.
pub async fn create_with_job(
    pool: &PgPool,
    title: &str,
    slug: &str,
    description: Option<&str>,
    priority: i16,
) -> Result<(VideoRow, JobRow)> {
    let mut tx = pool.begin().await?;

    let video = sqlx::query_as::<_, VideoRow>(&format!(
        r#"
        INSERT INTO videos (title, slug, description, status)
        VALUES ($1, $2, $3, 'pending')
        RETURNING {VIDEO_COLUMNS}
        "#
    ))
    .bind(title)
    .bind(slug)
    .bind(description)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            ApiError::Conflict(format!("slug already in use: {slug}"))
        }
        _ => e.into(),
    })?;

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        INSERT INTO transcoding_jobs (video_id, priority)
        VALUES ($1, $2)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(video.id)
    .bind(priority)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok((video, job))
}

pub async fn get(pool: &PgPool, video_id: i64) -> Result<Option<VideoRow>> {
    let video = sqlx::query_as::<_, VideoRow>(&format!(
        "SELECT {VIDEO_COLUMNS} FROM videos WHERE id = $1"
    ))
    .bind(video_id)
    .fetch_optional(pool)
    .await?;
    Ok(video)
}

pub async fn get_required(pool: &PgPool, video_id: i64) -> Result<VideoRow> {
    get(pool, video_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("video {video_id} not found")))
}

/// Mark a video failed with a reason.
pub async fn set_failed(pool: &PgPool, video_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE videos
        SET status = 'failed', error_message = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(video_id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Soft delete: set the tombstone. Returns the video as it was, or None when
/// already deleted / missing.
pub async fn soft_delete(pool: &PgPool, video_id: i64) -> Result<Option<VideoRow>> {
    let video = sqlx::query_as::<_, VideoRow>(&format!(
        r#"
        UPDATE videos
        SET deleted_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING {VIDEO_COLUMNS}
        "#
    ))
    .bind(video_id)
    .fetch_optional(pool)
    .await?;
    Ok(video)
}

/// Restore a soft-deleted video.
pub async fn restore(pool: &PgPool, video_id: i64) -> Result<Option<VideoRow>> {
    let video = sqlx::query_as::<_, VideoRow>(&format!(
        r#"
        UPDATE videos
        SET deleted_at = NULL, updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NOT NULL
        RETURNING {VIDEO_COLUMNS}
        "#
    ))
    .bind(video_id)
    .fetch_optional(pool)
    .await?;
    Ok(video)
}

/// Permanently delete a video and its dependents in foreign-key order.
pub async fn purge(pool: &PgPool, video_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        DELETE FROM quality_progress
        WHERE job_id IN (SELECT id FROM transcoding_jobs WHERE video_id = $1)
        "#,
    )
    .bind(video_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM transcoding_jobs WHERE video_id = $1")
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM video_qualities WHERE video_id = $1")
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM videos WHERE id = $1")
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Soft-deleted videos past the retention window, due for permanent removal.
pub async fn expired_archive(pool: &PgPool, retention_secs: u64) -> Result<Vec<VideoRow>> {
    let videos = sqlx::query_as::<_, VideoRow>(&format!(
        r#"
        SELECT {VIDEO_COLUMNS} FROM videos
        WHERE deleted_at IS NOT NULL
          AND deleted_at < NOW() - $1 * INTERVAL '1 second'
        ORDER BY deleted_at ASC
        LIMIT 100
        "#
    ))
    .bind(retention_secs as i64)
    .fetch_all(pool)
    .await?;
    Ok(videos)
}

/// List videos for the admin surface with optional status filter.
/// Soft-deleted videos appear only when `include_deleted` is set.
pub async fn list(
    pool: &PgPool,
    status: Option<&str>,
    include_deleted: bool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<VideoRow>, i64)> {
    let total = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM videos
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2 OR deleted_at IS NULL)
        "#,
    )
    .bind(status)
    .bind(include_deleted)
    .fetch_one(pool)
    .await?;

    let videos = sqlx::query_as::<_, VideoRow>(&format!(
        r#"
        SELECT {VIDEO_COLUMNS} FROM videos
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2 OR deleted_at IS NULL)
        ORDER BY created_at DESC
        LIMIT $3 OFFSET $4
        "#
    ))
    .bind(status)
    .bind(include_deleted)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok((videos, total))
}

/// Quality names recorded for a video.
pub async fn quality_names(pool: &PgPool, video_id: i64) -> Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT quality FROM video_qualities WHERE video_id = $1 ORDER BY quality",
    )
    .bind(video_id)
    .fetch_all(pool)
    .await?;
    Ok(names)
}

/// Slugs that still own a quality directory on disk (used by orphan cleanup).
pub async fn slug_has_quality(pool: &PgPool, slug: &str, quality: &str) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM video_qualities vq
            JOIN videos v ON v.id = vq.video_id
            WHERE v.slug = $1 AND vq.quality = $2
        )
        "#,
    )
    .bind(slug)
    .bind(quality)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Whether a slug has a live (unfinished) transcoding job.
pub async fn slug_has_active_job(pool: &PgPool, slug: &str) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM transcoding_jobs j
            JOIN videos v ON v.id = j.video_id
            WHERE v.slug = $1 AND j.completed_at IS NULL
        )
        "#,
    )
    .bind(slug)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Re-enqueue a video for transcoding. Clears job state, bumps priority, and
/// resets the video to pending; `keep_qualities` survive as rows so the next
/// claim advertises them for selective re-transcode.
pub async fn reenqueue(
    pool: &PgPool,
    video_id: i64,
    priority: i16,
    keep_qualities: &[String],
) -> Result<JobRow> {
    let mut tx = pool.begin().await?;

    if keep_qualities.is_empty() {
        sqlx::query("DELETE FROM video_qualities WHERE video_id = $1")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
    } else {
        sqlx::query("DELETE FROM video_qualities WHERE video_id = $1 AND quality <> ALL($2)")
            .bind(video_id)
            .bind(keep_qualities)
            .execute(&mut *tx)
            .await?;
    }

    let job = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        UPDATE transcoding_jobs
        SET priority = $2, worker_id = NULL, current_step = 'pending', progress_percent = 0,
            attempt_number = 1, claimed_at = NULL, claim_expires_at = NULL,
            completed_at = NULL, last_error = NULL, updated_at = NOW()
        WHERE video_id = $1
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(video_id)
    .bind(priority)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE videos SET status = 'pending', error_message = NULL, updated_at = NOW() WHERE id = $1",
    )
    .bind(video_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(job)
}

/// Derive a URL-safe slug from a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "video".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Spring Hike 2024"), "spring-hike-2024");
        assert_eq!(slugify("  Hello,   World!  "), "hello-world");
        assert_eq!(slugify("Ünicode Tïtle"), "nicode-t-tle");
    }

    #[test]
    fn test_slugify_never_empty() {
        assert_eq!(slugify("!!!"), "video");
        assert_eq!(slugify(""), "video");
    }
}
