//! Archive area management for soft-deleted videos
//!
//! Soft delete moves the published tree `VIDEOS_DIR/{slug}` to
//! `ARCHIVE_DIR/{slug}`; restore moves it back. Both areas live on the same
//! filesystem, so moves are directory renames and the round trip leaves the
//! tree byte-identical.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Move a video's published directory into the archive.
pub async fn archive_video_dir(
    videos_dir: &Path,
    archive_dir: &Path,
    slug: &str,
) -> io::Result<Option<PathBuf>> {
    let source = videos_dir.join(slug);
    if !source.is_dir() {
        return Ok(None);
    }

    tokio::fs::create_dir_all(archive_dir).await?;
    let target = archive_dir.join(slug);
    if target.exists() {
        // A stale archive copy would shadow the fresh one
        tokio::fs::remove_dir_all(&target).await?;
    }

    tokio::fs::rename(&source, &target).await?;
    info!("Archived video directory {slug}");
    Ok(Some(target))
}

/// Move an archived directory back into the published area.
pub async fn restore_video_dir(
    videos_dir: &Path,
    archive_dir: &Path,
    slug: &str,
) -> io::Result<Option<PathBuf>> {
    let source = archive_dir.join(slug);
    if !source.is_dir() {
        return Ok(None);
    }

    tokio::fs::create_dir_all(videos_dir).await?;
    let target = videos_dir.join(slug);
    if target.exists() {
        tokio::fs::remove_dir_all(&target).await?;
    }

    tokio::fs::rename(&source, &target).await?;
    info!("Restored video directory {slug}");
    Ok(Some(target))
}

/// Remove every on-disk trace of a video: published tree, archived tree, and
/// the uploaded source file.
pub async fn remove_video_files(
    videos_dir: &Path,
    archive_dir: &Path,
    uploads_dir: &Path,
    slug: &str,
    video_id: i64,
    source_extensions: &[&str],
) {
    for dir in [videos_dir.join(slug), archive_dir.join(slug)] {
        if dir.is_dir() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove {}: {e}", dir.display());
            }
        }
    }

    for ext in source_extensions {
        let source = uploads_dir.join(format!("{video_id}.{ext}"));
        if source.is_file() {
            if let Err(e) = tokio::fs::remove_file(&source).await {
                warn!("Failed to remove {}: {e}", source.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_tree(root: &Path, slug: &str) -> PathBuf {
        let dir = root.join(slug);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("master.m3u8"), "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n720p.m3u8\n")
            .await
            .unwrap();
        tokio::fs::write(dir.join("720p.m3u8"), "#EXTM3U\n").await.unwrap();
        tokio::fs::write(dir.join("thumbnail.jpg"), [0xffu8, 0xd8])
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_archive_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let videos = tmp.path().join("videos");
        let archive = tmp.path().join("archive");
        seed_tree(&videos, "clip").await;

        let archived = archive_video_dir(&videos, &archive, "clip")
            .await
            .unwrap()
            .unwrap();
        assert!(!videos.join("clip").exists());
        assert!(archived.join("master.m3u8").is_file());

        let restored = restore_video_dir(&videos, &archive, "clip")
            .await
            .unwrap()
            .unwrap();
        assert!(!archive.join("clip").exists());
        assert!(restored.join("master.m3u8").is_file());
        assert!(restored.join("720p.m3u8").is_file());
        assert!(restored.join("thumbnail.jpg").is_file());

        let master = tokio::fs::read_to_string(restored.join("master.m3u8"))
            .await
            .unwrap();
        assert!(master.contains("#EXT-X-STREAM-INF"));
    }

    #[tokio::test]
    async fn test_archive_missing_dir_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let videos = tmp.path().join("videos");
        let archive = tmp.path().join("archive");
        tokio::fs::create_dir_all(&videos).await.unwrap();

        let result = archive_video_dir(&videos, &archive, "ghost").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_remove_video_files_clears_all_areas() {
        let tmp = tempfile::tempdir().unwrap();
        let videos = tmp.path().join("videos");
        let archive = tmp.path().join("archive");
        let uploads = tmp.path().join("uploads");
        seed_tree(&videos, "clip").await;
        tokio::fs::create_dir_all(&uploads).await.unwrap();
        tokio::fs::write(uploads.join("9.mp4"), b"source").await.unwrap();

        remove_video_files(&videos, &archive, &uploads, "clip", 9, &["mp4", "mkv"]).await;

        assert!(!videos.join("clip").exists());
        assert!(!uploads.join("9.mp4").exists());
    }
}
