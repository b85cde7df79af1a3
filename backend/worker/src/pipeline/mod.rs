//! Transcoding pipeline
//!
//! Drives one claimed job end to end: download, probe, thumbnail,
//! per-quality encode with bounded concurrency, per-quality upload as soon
//! as a variant finishes (to free disk), master playlist, finalize, and
//! completion. Every coordinator call can answer 409; that surfaces as
//! `WorkerError::ClaimExpired`, which aborts the pipeline without reporting
//! failure since the job may already be running elsewhere.

pub mod probe;
pub mod thumbnail;
pub mod transcode;

use crate::api_client::WorkerApiClient;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::hwaccel::{self, GpuCapabilities, VideoCodec};
use futures::stream::{FuturesUnordered, StreamExt};
use media_core::hls::{self, MasterVariant};
use media_core::{applicable_qualities, JobStep, QualityPreset, QualityStatus, ORIGINAL_QUALITY};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};
use worker_protocol::{ClaimResponse, QualityInfo, QualityProgressUpdate};

/// Final outcome of one job.
#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    /// 409 received: stop quietly, the job may belong to someone else now.
    ClaimExpired,
    Failed(String),
}

pub struct Pipeline {
    pub client: Arc<WorkerApiClient>,
    pub config: Arc<WorkerConfig>,
    pub gpu_caps: Option<Arc<GpuCapabilities>>,
    pub shutdown: Arc<AtomicBool>,
}

/// Shared per-job progress state: the quality list reported to the
/// coordinator plus a flag flipped when any call comes back 409.
struct JobProgress {
    qualities: Mutex<Vec<QualityProgressUpdate>>,
    claim_lost: AtomicBool,
}

impl JobProgress {
    fn new() -> Self {
        Self {
            qualities: Mutex::new(Vec::new()),
            claim_lost: AtomicBool::new(false),
        }
    }

    async fn set(&self, name: &str, status: QualityStatus, progress: i32) {
        let mut list = self.qualities.lock().await;
        match list.iter_mut().find(|q| q.name == name) {
            Some(entry) => {
                entry.status = status;
                entry.progress = progress;
            }
            None => list.push(QualityProgressUpdate {
                name: name.to_string(),
                status,
                progress,
            }),
        }
    }

    async fn snapshot(&self) -> Vec<QualityProgressUpdate> {
        self.qualities.lock().await.clone()
    }
}

impl Pipeline {
    /// Process one claimed job. Never panics; every path resolves to an
    /// outcome the runtime can act on.
    pub async fn process_job(&self, job: &ClaimResponse) -> JobOutcome {
        let job_id = match job.job_id {
            Some(id) => id,
            None => return JobOutcome::Failed("claim envelope without job id".to_string()),
        };
        let slug = job.video_slug.clone().unwrap_or_default();

        info!(job_id, slug = %slug, "Processing job");

        let work_dir = self.config.work_dir.join(job_id.to_string());
        let mut completion_verified = false;

        let result = self.run_job(job_id, job, &work_dir).await;

        let outcome = match result {
            Ok(()) => {
                completion_verified = true;
                info!(job_id, slug = %slug, "Job done, video is ready");
                JobOutcome::Completed
            }
            Err(WorkerError::ClaimExpired) => {
                warn!(job_id, "Claim expired, abandoning job without reporting");
                // Safe to clean up: this worker no longer owns the job
                completion_verified = true;
                JobOutcome::ClaimExpired
            }
            Err(e) => {
                let message = worker_protocol::truncate_error(&e.to_string());
                warn!(job_id, error = %message, "Job failed, reporting to coordinator");
                match self.client.fail(job_id, &message, true).await {
                    Ok(resp) => {
                        info!(
                            job_id,
                            will_retry = resp.will_retry,
                            attempt = resp.attempt_number,
                            "Failure reported"
                        );
                    }
                    Err(WorkerError::ClaimExpired) => {
                        completion_verified = true;
                    }
                    Err(report_err) => {
                        warn!(job_id, "Failed to report job failure: {report_err}");
                    }
                }
                JobOutcome::Failed(message)
            }
        };

        // Work files are kept on unverified failure for manual recovery,
        // unless the operator opted out of keeping partial output
        let keep_partial = self.config.keep_completed_qualities;
        if (completion_verified || !keep_partial) && work_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                warn!("Failed to remove work dir {}: {e}", work_dir.display());
            }
        } else if work_dir.exists() {
            info!(
                "Work directory preserved at {} (completion not verified)",
                work_dir.display()
            );
        }

        outcome
    }

    async fn run_job(&self, job_id: i64, job: &ClaimResponse, work_dir: &Path) -> Result<()> {
        let video_id = job
            .video_id
            .ok_or_else(|| WorkerError::InvalidMedia("claim envelope without video id".into()))?;
        let source_name = job
            .source_filename
            .clone()
            .unwrap_or_else(|| format!("{video_id}.mp4"));

        let output_dir = work_dir.join("output");
        tokio::fs::create_dir_all(&output_dir).await?;

        let progress = Arc::new(JobProgress::new());

        // download: 0-5
        self.report(job_id, JobStep::Download, 0.0, &progress, None).await?;
        let source_path = work_dir.join(&source_name);
        let bytes = self.client.download_source(video_id, &source_path).await?;
        info!(job_id, bytes, "Source downloaded");
        self.report(job_id, JobStep::Download, 5.0, &progress, None).await?;

        // probe: 5-8
        let media_info = probe::get_video_info(
            &source_path,
            self.config.probe_timeout,
            self.config.max_duration_secs,
        )
        .await?;
        info!(
            job_id,
            width = media_info.width,
            height = media_info.height,
            duration = media_info.duration,
            codec = %media_info.codec,
            "Source probed"
        );
        // Report metadata immediately so it survives a worker crash
        self.report(job_id, JobStep::Probe, 8.0, &progress, Some(&media_info)).await?;

        // thumbnail: 8-15
        self.report(job_id, JobStep::Thumbnail, 10.0, &progress, None).await?;
        let thumb_path = output_dir.join("thumbnail.jpg");
        thumbnail::generate_thumbnail(
            &source_path,
            &thumb_path,
            thumbnail::thumbnail_timestamp(media_info.duration),
            self.config.probe_timeout,
        )
        .await?;

        // transcode: 15-90
        let presets = applicable_qualities(media_info.height);
        let existing: HashSet<String> = job.existing_qualities.iter().cloned().collect();
        if !existing.is_empty() {
            info!(job_id, existing = ?existing, "Selective re-transcode, skipping existing qualities");
        }

        for preset in &presets {
            let status = if existing.contains(preset.name) {
                QualityStatus::Skipped
            } else {
                QualityStatus::Pending
            };
            progress.set(preset.name, status, 0).await;
        }
        let original_status = if existing.contains(ORIGINAL_QUALITY) {
            QualityStatus::Skipped
        } else {
            QualityStatus::Pending
        };
        progress.set(ORIGINAL_QUALITY, original_status, 0).await;

        self.report(job_id, JobStep::Transcode, 15.0, &progress, None).await?;

        let parallel = hwaccel::recommended_parallel_qualities(
            self.gpu_caps.as_deref(),
            self.config.parallel_qualities,
        );
        let semaphore = Arc::new(Semaphore::new(parallel));

        let mut tasks: FuturesUnordered<_> = FuturesUnordered::new();

        if !existing.contains(ORIGINAL_QUALITY) {
            tasks.push(self.encode_and_upload(
                job_id,
                video_id,
                None,
                source_path.clone(),
                output_dir.clone(),
                media_info.clone(),
                progress.clone(),
                semaphore.clone(),
            ));
        }
        for preset in &presets {
            if existing.contains(preset.name) {
                continue;
            }
            tasks.push(self.encode_and_upload(
                job_id,
                video_id,
                Some(**preset),
                source_path.clone(),
                output_dir.clone(),
                media_info.clone(),
                progress.clone(),
                semaphore.clone(),
            ));
        }

        let mut successful: Vec<(QualityInfo, String)> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        while let Some(result) = tasks.next().await {
            match result {
                Ok(done) => successful.push(done),
                Err(WorkerError::ClaimExpired) => return Err(WorkerError::ClaimExpired),
                Err(e) => {
                    warn!(job_id, "Quality variant failed: {e}");
                    failed.push(e.to_string());
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(WorkerError::InvalidMedia("shutdown requested".into()));
            }
        }
        drop(tasks);

        let nothing_to_do = successful.is_empty() && failed.is_empty();
        if successful.is_empty() && !nothing_to_do {
            return Err(WorkerError::Ffmpeg(format!(
                "all quality variants failed: {}",
                failed.join("; ")
            )));
        }

        let selective = !existing.is_empty();
        let mut finalize_files = vec![thumb_path.clone()];

        if selective {
            // The existing master playlist already references every variant
            info!(job_id, "Keeping existing master playlist");
        } else {
            // master_playlist: 95
            self.report(job_id, JobStep::MasterPlaylist, 95.0, &progress, None).await?;

            let variants: Vec<MasterVariant> = successful
                .iter()
                .map(|(quality, playlist)| MasterVariant {
                    name: quality.name.clone(),
                    width: quality.width,
                    height: quality.height,
                    bandwidth_bps: quality.bitrate as i64 * 1000,
                    playlist: playlist.clone(),
                })
                .collect();

            let master = hls::build_master_playlist(&variants);
            hls::validate_master_playlist(&master)?;
            let master_path = output_dir.join("master.m3u8");
            tokio::fs::write(&master_path, master).await?;
            finalize_files.push(master_path);
        }

        // finalize: 98
        self.report(job_id, JobStep::Finalize, 98.0, &progress, None).await?;
        self.client.upload_finalize(video_id, finalize_files).await?;

        // complete: 100, with retries so a transient coordinator error does
        // not waste a finished transcode
        let qualities: Vec<QualityInfo> = successful.into_iter().map(|(q, _)| q).collect();
        let mut last_err: Option<WorkerError> = None;
        for attempt in 0..3 {
            match self
                .client
                .complete(
                    job_id,
                    qualities.clone(),
                    Some(media_info.duration),
                    Some(media_info.width),
                    Some(media_info.height),
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(WorkerError::ClaimExpired) => return Err(WorkerError::ClaimExpired),
                Err(e) => {
                    warn!(job_id, attempt, "Completion failed: {e}");
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| WorkerError::InvalidMedia("completion failed".into())))
    }

    /// Encode one variant (or remux the original), validate its playlist,
    /// upload it, and free the local files. Returns the recorded quality and
    /// its playlist name for the master.
    #[allow(clippy::too_many_arguments)]
    async fn encode_and_upload(
        &self,
        job_id: i64,
        video_id: i64,
        preset: Option<QualityPreset>,
        source_path: PathBuf,
        output_dir: PathBuf,
        media_info: probe::VideoInfo,
        progress: Arc<JobProgress>,
        semaphore: Arc<Semaphore>,
    ) -> Result<(QualityInfo, String)> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| WorkerError::InvalidMedia("encode pool closed".into()))?;

        let quality_name = preset.map(|p| p.name).unwrap_or(ORIGINAL_QUALITY);
        let format = self.config.streaming_format;

        progress.set(quality_name, QualityStatus::InProgress, 0).await;

        let (args, timeout) = match &preset {
            Some(preset) => {
                let codec = VideoCodec::parse(&self.config.preferred_codec);
                let selection = hwaccel::select_encoder(self.gpu_caps.as_deref(), codec, preset.height);
                info!(
                    job_id,
                    quality = quality_name,
                    encoder = %selection.encoder.name,
                    "Encoding variant"
                );
                (
                    transcode::build_transcode_args(
                        &source_path,
                        &output_dir,
                        preset,
                        &selection,
                        self.config.hls_segment_duration,
                        format,
                    ),
                    transcode::encode_timeout(&self.config, media_info.duration, preset.height),
                )
            }
            None => {
                info!(job_id, "Remuxing original");
                (
                    transcode::build_remux_args(
                        &source_path,
                        &output_dir,
                        self.config.hls_segment_duration,
                        format,
                    ),
                    transcode::encode_timeout(&self.config, media_info.duration, 0),
                )
            }
        };

        if format == hls::StreamingFormat::Cmaf {
            tokio::fs::create_dir_all(output_dir.join(quality_name)).await?;
        }

        if let Err(e) = self
            .run_encode_with_reporting(job_id, quality_name, &args, &media_info, timeout, &progress)
            .await
        {
            progress.set(quality_name, QualityStatus::Failed, 0).await;
            return Err(e);
        }

        // Validate before anything is uploaded
        let playlist_rel = format.variant_playlist(quality_name);
        let playlist_path = output_dir.join(&playlist_rel);
        if let Err(e) = hls::validate_variant_playlist(&playlist_path, false) {
            warn!(job_id, quality = quality_name, "Playlist validation failed: {e}");
            progress.set(quality_name, QualityStatus::Failed, 0).await;
            return Err(e.into());
        }

        // Record actual output dimensions; presets lie about aspect ratios
        let first_segment = output_dir.join(format.first_segment(quality_name));
        let (width, height) = match preset {
            Some(preset) => probe::get_output_dimensions(&first_segment, self.config.probe_timeout)
                .await
                .unwrap_or_else(|| {
                    let height = preset.height;
                    let mut width =
                        (height as i64 * media_info.width as i64 / media_info.height.max(1) as i64) as i32;
                    width += width % 2;
                    (width, height)
                }),
            None => (media_info.width, media_info.height),
        };

        let artifacts = transcode::quality_artifacts(&output_dir, quality_name, format)?;
        let bitrate = match preset {
            Some(preset) => preset.bitrate_kbps,
            None => transcode::estimate_bitrate_kbps(&artifacts, media_info.duration),
        };

        // Upload immediately to free disk
        progress.set(quality_name, QualityStatus::Uploading, 0).await;
        self.push_progress(job_id, JobStep::Upload, 90.0, &progress).await?;

        self.client
            .upload_quality(video_id, quality_name, artifacts.clone())
            .await?;

        progress.set(quality_name, QualityStatus::Uploaded, 100).await;
        self.push_progress(job_id, JobStep::Transcode, 60.0, &progress).await?;

        for file in &artifacts {
            let _ = tokio::fs::remove_file(file).await;
        }
        info!(job_id, quality = quality_name, "Variant uploaded and local files freed");

        Ok((
            QualityInfo {
                name: quality_name.to_string(),
                width,
                height,
                bitrate,
            },
            playlist_rel,
        ))
    }

    /// Run one encode while a sidecar task reports progress to the
    /// coordinator at the configured interval. A 409 from any report flips
    /// `claim_lost`, which cancels the encode from its progress callback.
    async fn run_encode_with_reporting(
        &self,
        job_id: i64,
        quality_name: &str,
        args: &[String],
        media_info: &probe::VideoInfo,
        timeout: std::time::Duration,
        progress: &Arc<JobProgress>,
    ) -> Result<()> {
        let percent = Arc::new(AtomicI32::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let reporter = {
            let client = self.client.clone();
            let progress = progress.clone();
            let percent = percent.clone();
            let stop = stop.clone();
            let interval = self.config.progress_interval;
            let quality_name = quality_name.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }

                    progress
                        .set(
                            &quality_name,
                            QualityStatus::InProgress,
                            percent.load(Ordering::SeqCst),
                        )
                        .await;

                    let request = worker_protocol::ProgressRequest {
                        current_step: JobStep::Transcode,
                        progress_percent: 60.0,
                        quality_progress: progress.snapshot().await,
                        duration: None,
                        source_width: None,
                        source_height: None,
                    };
                    match client.progress(job_id, &request).await {
                        Ok(_) => {}
                        Err(WorkerError::ClaimExpired) => {
                            progress.claim_lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            // Transient report failures never kill an encode
                            warn!(job_id, "Progress update failed: {e}");
                        }
                    }
                }
            })
        };

        let claim_lost = &progress.claim_lost;
        let shutdown = self.shutdown.clone();
        let percent_cb = percent.clone();

        let encode_result = transcode::run_ffmpeg_with_progress(
            args,
            media_info.duration,
            timeout,
            move |pct| {
                percent_cb.store(pct, Ordering::SeqCst);
                // Returning false makes ffmpeg die promptly
                !(claim_lost.load(Ordering::SeqCst)
                    || shutdown.load(Ordering::SeqCst))
            },
        )
        .await;

        stop.store(true, Ordering::SeqCst);
        reporter.abort();

        if progress.claim_lost.load(Ordering::SeqCst) {
            return Err(WorkerError::ClaimExpired);
        }
        encode_result
    }

    /// One full progress report, optionally carrying probe metadata.
    async fn report(
        &self,
        job_id: i64,
        step: JobStep,
        percent: f32,
        progress: &Arc<JobProgress>,
        media_info: Option<&probe::VideoInfo>,
    ) -> Result<()> {
        let request = worker_protocol::ProgressRequest {
            current_step: step,
            progress_percent: percent,
            quality_progress: progress.snapshot().await,
            duration: media_info.map(|i| i.duration),
            source_width: media_info.map(|i| i.width),
            source_height: media_info.map(|i| i.height),
        };
        self.client.progress(job_id, &request).await?;
        Ok(())
    }

    /// Progress push that tolerates transient errors but honors 409.
    async fn push_progress(
        &self,
        job_id: i64,
        step: JobStep,
        percent: f32,
        progress: &Arc<JobProgress>,
    ) -> Result<()> {
        match self.report(job_id, step, percent, progress, None).await {
            Ok(()) => Ok(()),
            Err(WorkerError::ClaimExpired) => Err(WorkerError::ClaimExpired),
            Err(e) => {
                warn!(job_id, "Progress update failed: {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_progress_set_updates_in_place() {
        let progress = JobProgress::new();
        progress.set("720p", QualityStatus::Pending, 0).await;
        progress.set("720p", QualityStatus::InProgress, 40).await;
        progress.set("480p", QualityStatus::Pending, 0).await;

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        let entry = snapshot.iter().find(|q| q.name == "720p").unwrap();
        assert_eq!(entry.status, QualityStatus::InProgress);
        assert_eq!(entry.progress, 40);
    }

    #[test]
    fn test_claim_expired_short_circuits_outcome() {
        // The pipeline maps ClaimExpired to an outcome that neither reports
        // failure nor retries locally
        let outcome = match Err::<(), _>(WorkerError::ClaimExpired) {
            Err(WorkerError::ClaimExpired) => JobOutcome::ClaimExpired,
            Err(e) => JobOutcome::Failed(e.to_string()),
            Ok(()) => JobOutcome::Completed,
        };
        assert!(matches!(outcome, JobOutcome::ClaimExpired));
    }
}
