//! Source download and artifact upload endpoints
//!
//! Both directions require a live claim on the job for the video. Source
//! files stream out in chunks; artifact archives stream into a spill file
//! under the storage tmp area, are extracted under the tar safety rules into
//! a staging directory, and only then move into the published tree.

use crate::auth::AuthedWorker;
use crate::config::{Config, SOURCE_EXTENSIONS};
use crate::db::{job_repo, video_repo};
use crate::error::{ApiError, Result};
use crate::services::tar_extract::{self, ExtractError, ExtractLimits, UploadKind};
use actix_web::{web, HttpResponse};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use media_core::canonical_quality_names;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Locate the uploaded source for a video by probing the extension
/// allow-list. Everything outside `UPLOADS_DIR/{video_id}.{ext}` is
/// unreachable by construction.
pub async fn resolve_source_file(uploads_dir: &Path, video_id: i64) -> Option<(PathBuf, String)> {
    for ext in SOURCE_EXTENSIONS {
        let name = format!("{video_id}.{ext}");
        let path = uploads_dir.join(&name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Some((path, name));
        }
    }
    None
}

/// GET /source/{video_id}: stream the source file to the claiming worker.
pub async fn download_source(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    worker: AuthedWorker,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let video_id = path.into_inner();

    job_repo::require_live_claim(pool.get_ref(), video_id, &worker.0.worker_id).await?;

    let Some((source_path, name)) =
        resolve_source_file(&config.storage.uploads_dir, video_id).await
    else {
        return Err(ApiError::NotFound(format!(
            "source file for video {video_id} not found"
        )));
    };

    let file = tokio::fs::File::open(&source_path).await?;
    let stream = futures::stream::unfold(file, |mut file| async move {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<_, std::io::Error>(Bytes::from(buf)), file))
            }
            Err(e) => Some((Err(e), file)),
        }
    });

    tracing::debug!(video_id, file = %name, "Streaming source to worker");

    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{name}\""),
        ))
        .streaming(stream))
}

/// POST /upload/{video_id}/quality/{quality}: receive one variant's
/// artifacts and publish them under the video directory.
pub async fn upload_quality(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    worker: AuthedWorker,
    path: web::Path<(i64, String)>,
    payload: actix_multipart::Multipart,
) -> Result<HttpResponse> {
    let (video_id, quality) = path.into_inner();

    if !canonical_quality_names().contains(&quality.as_str()) {
        return Err(ApiError::BadRequest(format!("unknown quality: {quality}")));
    }

    let job = job_repo::require_live_claim(pool.get_ref(), video_id, &worker.0.worker_id).await?;
    let video = video_repo::get_required(pool.get_ref(), video_id).await?;

    let extracted = receive_and_extract(&config, payload, UploadKind::Quality).await?;

    // CMAF variants carry their own per-quality directory
    let is_cmaf = extracted
        .files
        .iter()
        .any(|f| f.to_string_lossy() == "stream.m3u8");
    let dest_dir = if is_cmaf {
        config.storage.videos_dir.join(&video.slug).join(&quality)
    } else {
        config.storage.videos_dir.join(&video.slug)
    };

    publish_staged(&extracted, &dest_dir, &config.storage.tmp_dir).await?;

    job_repo::mark_quality_uploaded(pool.get_ref(), job.id, &quality).await?;
    job_repo::extend_lease(
        pool.get_ref(),
        job.id,
        &worker.0.worker_id,
        config.worker.claim_duration_secs,
    )
    .await?;

    tracing::info!(
        video_id,
        quality = %quality,
        files = extracted.files.len(),
        "Quality artifacts uploaded"
    );

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "quality": quality,
        "files": extracted.files.len(),
    })))
}

/// POST /upload/{video_id}/finalize: receive master playlist + thumbnail.
pub async fn upload_finalize(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    worker: AuthedWorker,
    path: web::Path<i64>,
    payload: actix_multipart::Multipart,
) -> Result<HttpResponse> {
    let video_id = path.into_inner();

    let job = job_repo::require_live_claim(pool.get_ref(), video_id, &worker.0.worker_id).await?;
    let video = video_repo::get_required(pool.get_ref(), video_id).await?;

    let extracted = receive_and_extract(&config, payload, UploadKind::Finalize).await?;

    let dest_dir = config.storage.videos_dir.join(&video.slug);
    publish_staged(&extracted, &dest_dir, &config.storage.tmp_dir).await?;

    job_repo::extend_lease(
        pool.get_ref(),
        job.id,
        &worker.0.worker_id,
        config.worker.claim_duration_secs,
    )
    .await?;

    tracing::info!(video_id, files = extracted.files.len(), "Finalize artifacts uploaded");

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "files": extracted.files.len(),
    })))
}

/// Result of a streamed-and-extracted upload: staging directory plus the
/// validated file names inside it.
struct StagedUpload {
    staging_dir: PathBuf,
    files: Vec<PathBuf>,
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        // Staging leftovers are garbage after publish or on any error path
        let _ = std::fs::remove_dir_all(&self.staging_dir);
    }
}

/// Stream the multipart body to a spill file, then extract it under the tar
/// safety rules with a wall-clock budget.
async fn receive_and_extract(
    config: &Config,
    mut payload: actix_multipart::Multipart,
    kind: UploadKind,
) -> Result<StagedUpload> {
    tokio::fs::create_dir_all(&config.storage.tmp_dir).await?;

    let upload_id = Uuid::new_v4();
    let archive_path = config
        .storage
        .tmp_dir
        .join(format!("upload-{upload_id}.tar.gz"));
    let staging_dir = config.storage.tmp_dir.join(format!("staging-{upload_id}"));
    tokio::fs::create_dir_all(&staging_dir).await?;

    // Ensure the spill file is removed on every path out of this function
    let _spill_guard = SpillGuard(archive_path.clone());

    let mut received: u64 = 0;
    let mut wrote_any = false;
    {
        let mut spill = tokio::fs::File::create(&archive_path).await?;

        while let Some(field) = payload.try_next().await.map_err(|e| {
            ApiError::BadRequest(format!("malformed multipart body: {e}"))
        })? {
            let mut field = field;
            while let Some(chunk) = field.next().await {
                let chunk =
                    chunk.map_err(|e| ApiError::BadRequest(format!("upload read error: {e}")))?;
                received += chunk.len() as u64;
                if received > config.limits.max_archive_bytes {
                    return Err(ApiError::BadRequest(format!(
                        "archive exceeds upload cap of {} bytes",
                        config.limits.max_archive_bytes
                    )));
                }
                spill.write_all(&chunk).await?;
                wrote_any = true;
            }
        }
        spill.flush().await?;
    }

    if !wrote_any {
        return Err(ApiError::BadRequest("empty upload body".to_string()));
    }

    let limits = ExtractLimits {
        max_file_bytes: config.limits.max_archive_file_bytes,
        max_total_bytes: config.limits.max_archive_bytes,
    };
    let archive = archive_path.clone();
    let staging = staging_dir.clone();

    let extraction = tokio::time::timeout(
        Duration::from_secs(config.limits.extract_timeout_secs),
        tokio::task::spawn_blocking(move || {
            tar_extract::extract_archive(&archive, &staging, kind, limits)
        }),
    )
    .await;

    let files = match extraction {
        Err(_) => {
            let _ = tokio::fs::remove_dir_all(&staging_dir).await;
            return Err(ApiError::Internal(format!(
                "archive extraction exceeded {}s budget",
                config.limits.extract_timeout_secs
            )));
        }
        Ok(Err(join_err)) => {
            let _ = tokio::fs::remove_dir_all(&staging_dir).await;
            return Err(ApiError::Internal(format!(
                "extraction task failed: {join_err}"
            )));
        }
        Ok(Ok(Err(extract_err))) => {
            let _ = tokio::fs::remove_dir_all(&staging_dir).await;
            return Err(match extract_err {
                ExtractError::Io(e) => ApiError::Io(e.to_string()),
                violation => ApiError::BadRequest(violation.to_string()),
            });
        }
        Ok(Ok(Ok(files))) => files,
    };

    if files.is_empty() {
        let _ = tokio::fs::remove_dir_all(&staging_dir).await;
        return Err(ApiError::BadRequest("archive contains no files".to_string()));
    }

    Ok(StagedUpload { staging_dir, files })
}

/// Publish the staging directory with a single whole-directory rename.
///
/// A fresh destination is simply the staging directory renamed into place.
/// When the destination already holds earlier artifacts (other qualities,
/// the master playlist), those are first hard-linked into the staging tree
/// so it becomes a superset, and the swap is still one rename; the replaced
/// tree is parked under the tmp area and discarded afterwards. The live
/// directory only ever changes by whole-directory rename, so no failure can
/// leave it partially written.
async fn publish_staged(staged: &StagedUpload, dest_dir: &Path, tmp_dir: &Path) -> Result<()> {
    if let Some(parent) = dest_dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if !tokio::fs::try_exists(dest_dir).await.unwrap_or(false) {
        tokio::fs::rename(&staged.staging_dir, dest_dir).await?;
        return Ok(());
    }

    // Merge: clone the published tree into staging as hard links, keeping
    // the freshly uploaded files on name collisions
    {
        let dest = dest_dir.to_path_buf();
        let staging = staged.staging_dir.clone();
        tokio::task::spawn_blocking(move || link_tree(&dest, &staging))
            .await
            .map_err(|e| ApiError::Internal(format!("publish task failed: {e}")))??;
    }

    let parked = tmp_dir.join(format!("replaced-{}", Uuid::new_v4()));
    tokio::fs::rename(dest_dir, &parked).await?;
    if let Err(e) = tokio::fs::rename(&staged.staging_dir, dest_dir).await {
        // Put the previous tree back so the video keeps serving
        if let Err(rollback) = tokio::fs::rename(&parked, dest_dir).await {
            tracing::error!(
                "Publish rollback failed, tree parked at {}: {rollback}",
                parked.display()
            );
        }
        return Err(e.into());
    }
    let _ = tokio::fs::remove_dir_all(&parked).await;

    Ok(())
}

/// Recursively hard-link `src` into `dst`, skipping names `dst` already has.
fn link_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            link_tree(&entry.path(), &target)?;
        } else if !target.exists() {
            std::fs::hard_link(entry.path(), &target)?;
        }
    }
    Ok(())
}

struct SpillGuard(PathBuf);

impl Drop for SpillGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn stage(root: &Path, files: &[(&str, &str)]) -> StagedUpload {
        let staging_dir = root.join(format!("staging-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging_dir).await.unwrap();
        let mut names = Vec::new();
        for (name, content) in files {
            tokio::fs::write(staging_dir.join(name), content).await.unwrap();
            names.push(PathBuf::from(name));
        }
        StagedUpload {
            staging_dir,
            files: names,
        }
    }

    #[tokio::test]
    async fn test_publish_into_fresh_dir_is_one_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("videos").join("clip");
        let staged = stage(tmp.path(), &[("720p.m3u8", "#EXTM3U"), ("720p_0000.ts", "seg")]).await;
        let staging_dir = staged.staging_dir.clone();

        publish_staged(&staged, &dest, tmp.path()).await.unwrap();

        assert!(dest.join("720p.m3u8").is_file());
        assert!(dest.join("720p_0000.ts").is_file());
        assert!(!staging_dir.exists(), "staging dir was moved, not copied");
    }

    #[tokio::test]
    async fn test_publish_merges_and_new_files_win() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("videos").join("clip");

        // An earlier quality and a stale copy of the playlist being replaced
        tokio::fs::create_dir_all(&dest).await.unwrap();
        tokio::fs::write(dest.join("480p.m3u8"), "existing-480p").await.unwrap();
        tokio::fs::write(dest.join("720p.m3u8"), "stale-720p").await.unwrap();

        let staged = stage(tmp.path(), &[("720p.m3u8", "fresh-720p"), ("720p_0000.ts", "seg")]).await;
        publish_staged(&staged, &dest, tmp.path()).await.unwrap();

        // Earlier artifacts survive, collisions take the fresh upload
        let survived = tokio::fs::read_to_string(dest.join("480p.m3u8")).await.unwrap();
        assert_eq!(survived, "existing-480p");
        let replaced = tokio::fs::read_to_string(dest.join("720p.m3u8")).await.unwrap();
        assert_eq!(replaced, "fresh-720p");
        assert!(dest.join("720p_0000.ts").is_file());

        // The swapped-out tree does not linger in the tmp area
        let mut leftovers = tokio::fs::read_dir(tmp.path()).await.unwrap();
        while let Ok(Some(entry)) = leftovers.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.starts_with("replaced-"), "parked tree was not removed");
        }
    }

    #[tokio::test]
    async fn test_publish_merge_preserves_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("videos").join("clip");

        // A CMAF variant already published under its own directory
        tokio::fs::create_dir_all(dest.join("1080p")).await.unwrap();
        tokio::fs::write(dest.join("1080p").join("stream.m3u8"), "#EXTM3U").await.unwrap();
        tokio::fs::write(dest.join("1080p").join("init.mp4"), "init").await.unwrap();

        let staged = stage(tmp.path(), &[("master.m3u8", "#EXTM3U"), ("thumbnail.jpg", "jpg")]).await;
        publish_staged(&staged, &dest, tmp.path()).await.unwrap();

        assert!(dest.join("master.m3u8").is_file());
        assert!(dest.join("1080p").join("stream.m3u8").is_file());
        assert!(dest.join("1080p").join("init.mp4").is_file());
    }
}
