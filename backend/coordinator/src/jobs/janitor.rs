//! Periodic maintenance task
//!
//! Each cycle, bounded in time and count:
//! - recover stale claims (lapsed leases become failed attempts)
//! - mark silent workers offline
//! - remove orphaned quality directories
//! - purge soft-deleted videos past retention
//! - trim the dead-letter stream

use crate::config::{Config, SOURCE_EXTENSIONS};
use crate::db::{job_repo, video_repo, worker_repo};
use crate::handlers::transfer::resolve_source_file;
use crate::services::archive;
use alerts::AlertSender;
use job_queue::{JobDispatch, JobPriority, JobQueue};
use media_core::canonical_quality_names;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STALE_BATCH: i64 = 50;

pub struct Janitor {
    pool: PgPool,
    config: Arc<Config>,
    queue: JobQueue,
    alert_sender: AlertSender,
    started_at: Instant,
}

impl Janitor {
    pub fn new(
        pool: PgPool,
        config: Arc<Config>,
        queue: JobQueue,
        alert_sender: AlertSender,
    ) -> Self {
        Self {
            pool,
            config,
            queue,
            alert_sender,
            started_at: Instant::now(),
        }
    }

    /// Start the periodic loop. Returns a handle the binary can abort on
    /// shutdown.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                self.config.worker.janitor_interval_secs,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                "Janitor started (interval: {}s)",
                self.config.worker.janitor_interval_secs
            );

            loop {
                interval.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// One full maintenance pass. Failures in one responsibility never block
    /// the others.
    pub async fn run_cycle(&self) {
        if let Err(e) = self.recover_stale_claims().await {
            error!("Stale claim recovery failed: {e}");
        }
        if let Err(e) = worker_repo::mark_stale_offline(
            &self.pool,
            self.config.worker.offline_threshold_secs,
        )
        .await
        .map(|n| {
            if n > 0 {
                info!("Marked {n} workers offline");
            }
        }) {
            error!("Worker liveness sweep failed: {e}");
        }
        if let Err(e) = self.cleanup_orphan_outputs().await {
            error!("Orphan cleanup failed: {e}");
        }
        if let Err(e) = self.purge_expired_archive().await {
            error!("Archive expiry failed: {e}");
        }
        if let Err(e) = self.queue.trim_dead_letter().await {
            warn!("Dead-letter trim failed: {e}");
        }
    }

    /// Jobs whose lease lapsed are treated as failed attempts: released for
    /// retry while attempts remain, escalated to permanent failure after.
    async fn recover_stale_claims(&self) -> crate::error::Result<()> {
        let stale = job_repo::find_stale(&self.pool, STALE_BATCH).await?;

        for entry in stale {
            let previous_worker = entry.job.worker_id.clone();
            let Some(outcome) = job_repo::recover_stale(&self.pool, entry.job.id).await? else {
                continue;
            };

            if outcome.will_retry {
                warn!(
                    job_id = outcome.job.id,
                    video_id = outcome.video.id,
                    attempt = outcome.job.attempt_number,
                    previous_worker = previous_worker.as_deref().unwrap_or("unknown"),
                    "Recovered stale claim, job re-queued"
                );

                self.alert_sender.stale_job_recovered(
                    outcome.video.id,
                    &outcome.video.slug,
                    outcome.job.attempt_number - 1,
                    previous_worker.as_deref(),
                );

                let mut dispatch = JobDispatch::new(
                    outcome.job.id,
                    outcome.video.id,
                    &outcome.video.slug,
                    JobPriority::from_rank(outcome.job.priority),
                );
                dispatch.duration = outcome.video.duration;
                dispatch.source_width = outcome.video.source_width;
                dispatch.source_height = outcome.video.source_height;
                if let Err(e) = self.queue.publish(&dispatch).await {
                    warn!("Failed to re-dispatch recovered job {}: {e}", outcome.job.id);
                }
            } else {
                error!(
                    job_id = outcome.job.id,
                    video_id = outcome.video.id,
                    "Stale claim exceeded retry budget, video failed"
                );

                let dispatch = JobDispatch::new(
                    outcome.job.id,
                    outcome.video.id,
                    &outcome.video.slug,
                    JobPriority::from_rank(outcome.job.priority),
                );
                let reason = outcome
                    .job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "claim expired after final attempt".to_string());
                if let Err(e) = self.queue.dead_letter(&dispatch, &reason).await {
                    warn!("Failed to dead-letter job {}: {e}", outcome.job.id);
                }

                self.alert_sender.max_retries_exceeded(
                    outcome.video.id,
                    &outcome.video.slug,
                    outcome.job.max_attempts,
                    outcome.job.last_error.as_deref(),
                );

                if self.config.worker.cleanup_source_on_failure {
                    self.remove_source(outcome.video.id).await;
                }
            }
        }

        Ok(())
    }

    async fn remove_source(&self, video_id: i64) {
        if let Some((path, name)) =
            resolve_source_file(&self.config.storage.uploads_dir, video_id).await
        {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(video_id, file = %name, "Removed source after permanent failure"),
                Err(e) => warn!(video_id, "Failed to remove source {name}: {e}"),
            }
        }
    }

    /// Quality directories on disk with no database row, no live job, and an
    /// mtime past the grace period are leftovers from crashed uploads.
    async fn cleanup_orphan_outputs(&self) -> crate::error::Result<()> {
        if self.started_at.elapsed()
            < Duration::from_secs(self.config.worker.startup_grace_secs)
        {
            debug!("Within startup grace period, skipping orphan cleanup");
            return Ok(());
        }

        let videos_dir = &self.config.storage.videos_dir;
        let mut slugs = match tokio::fs::read_dir(videos_dir).await {
            Ok(rd) => rd,
            Err(_) => return Ok(()),
        };

        let grace = Duration::from_secs(self.config.worker.orphan_grace_secs);
        let quality_names = canonical_quality_names();

        while let Ok(Some(slug_entry)) = slugs.next_entry().await {
            let slug_path = slug_entry.path();
            if !slug_path.is_dir() {
                continue;
            }
            let Some(slug) = slug_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            for quality in &quality_names {
                let quality_dir = slug_path.join(quality);
                let Ok(meta) = tokio::fs::metadata(&quality_dir).await else {
                    continue;
                };
                if !meta.is_dir() {
                    continue;
                }

                let old_enough = meta
                    .modified()
                    .ok()
                    .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                    .map(|age| age > grace)
                    .unwrap_or(false);
                if !old_enough {
                    continue;
                }

                if video_repo::slug_has_quality(&self.pool, &slug, quality).await?
                    || video_repo::slug_has_active_job(&self.pool, &slug).await?
                {
                    continue;
                }

                match tokio::fs::remove_dir_all(&quality_dir).await {
                    Ok(()) => info!(slug = %slug, quality = %quality, "Removed orphaned quality directory"),
                    Err(e) => warn!(slug = %slug, quality = %quality, "Orphan removal failed: {e}"),
                }
            }
        }

        Ok(())
    }

    /// Permanently delete soft-deleted videos past the retention window.
    async fn purge_expired_archive(&self) -> crate::error::Result<()> {
        let expired =
            video_repo::expired_archive(&self.pool, self.config.worker.archive_retention_secs)
                .await?;

        for video in expired {
            info!(video_id = video.id, slug = %video.slug, "Purging expired archived video");
            video_repo::purge(&self.pool, video.id).await?;
            archive::remove_video_files(
                &self.config.storage.videos_dir,
                &self.config.storage.archive_dir,
                &self.config.storage.uploads_dir,
                &video.slug,
                video.id,
                SOURCE_EXTENSIONS,
            )
            .await;
        }

        Ok(())
    }
}
