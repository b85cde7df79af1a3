//! FFmpeg transcode execution
//!
//! Builds the HLS (or CMAF) encode command from an encoder selection and a
//! quality preset, runs it with a duration-scaled wall-clock timeout, and
//! feeds percentage updates parsed from `-progress pipe:1` to a callback.

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::hwaccel::EncoderSelection;
use media_core::hls::StreamingFormat;
use media_core::QualityPreset;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Encode timeout: duration x multiplier x resolution factor, clamped to
/// the configured window. High resolutions get more headroom because the
/// encoder is the bottleneck, not the clock.
pub fn encode_timeout(config: &WorkerConfig, duration: f64, target_height: i32) -> Duration {
    let resolution_mult = match target_height {
        h if h >= 2160 => 3.0,
        h if h >= 1440 => 2.0,
        h if h >= 1080 => 1.5,
        _ => 1.0,
    };
    let secs = duration * config.ffmpeg_timeout_multiplier * resolution_mult;
    let clamped = secs.clamp(
        config.ffmpeg_timeout_min.as_secs_f64(),
        config.ffmpeg_timeout_max.as_secs_f64(),
    );
    Duration::from_secs_f64(clamped)
}

/// Build the full FFmpeg argument list for one quality variant.
pub fn build_transcode_args(
    input: &Path,
    output_dir: &Path,
    quality: &QualityPreset,
    selection: &EncoderSelection,
    segment_duration: u32,
    format: StreamingFormat,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into()];
    args.extend(selection.input_args.iter().cloned());
    args.extend(["-i".into(), input.to_string_lossy().into_owned()]);
    args.extend(selection.output_args.iter().cloned());

    // Rate control
    args.extend([
        "-b:v".into(),
        quality.bitrate_arg(),
        "-maxrate".into(),
        quality.bitrate_arg(),
        "-bufsize".into(),
        format!("{}k", quality.bitrate_kbps * 2),
    ]);

    args.extend(["-vf".into(), selection.scale_filter.clone()]);

    // Stereo AAC for every variant
    args.extend([
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        quality.audio_bitrate_arg(),
        "-ac".into(),
        "2".into(),
    ]);

    let playlist = output_dir.join(format.variant_playlist(quality.name));
    let segments = output_dir.join(format.segment_pattern(quality.name));

    args.extend(["-hls_time".into(), segment_duration.to_string()]);
    args.extend(["-hls_list_size".into(), "0".into()]);
    if format == StreamingFormat::Cmaf {
        args.extend([
            "-hls_segment_type".into(),
            "fmp4".into(),
            "-hls_fmp4_init_filename".into(),
            "init.mp4".into(),
        ]);
        args.extend(["-movflags".into(), "+cmaf+faststart".into()]);
    }
    args.extend([
        "-hls_segment_filename".into(),
        segments.to_string_lossy().into_owned(),
    ]);
    args.extend(["-progress".into(), "pipe:1".into()]);
    args.extend(["-f".into(), "hls".into()]);
    args.push(playlist.to_string_lossy().into_owned());

    args
}

/// Remux arguments for the `original` pseudo-quality: same streams, HLS
/// container, no re-encode.
pub fn build_remux_args(
    input: &Path,
    output_dir: &Path,
    segment_duration: u32,
    format: StreamingFormat,
) -> Vec<String> {
    let playlist = output_dir.join(format.variant_playlist(media_core::ORIGINAL_QUALITY));
    let segments = output_dir.join(format.segment_pattern(media_core::ORIGINAL_QUALITY));

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-hls_time".into(),
        segment_duration.to_string(),
        "-hls_list_size".into(),
        "0".into(),
    ];
    if format == StreamingFormat::Cmaf {
        args.extend([
            "-hls_segment_type".into(),
            "fmp4".into(),
            "-hls_fmp4_init_filename".into(),
            "init.mp4".into(),
        ]);
    }
    args.extend([
        "-hls_segment_filename".into(),
        segments.to_string_lossy().into_owned(),
        "-progress".into(),
        "pipe:1".into(),
        "-f".into(),
        "hls".into(),
        playlist.to_string_lossy().into_owned(),
    ]);
    args
}

/// Parse one `-progress pipe:1` line into elapsed output microseconds.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let value = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    value.trim().parse::<u64>().ok()
}

/// Convert elapsed output time to a 0-100 percentage of the source.
pub fn progress_percent(out_time_us: u64, duration: f64) -> i32 {
    if duration <= 0.0 {
        return 0;
    }
    let elapsed = out_time_us as f64 / 1_000_000.0;
    ((elapsed / duration) * 100.0).clamp(0.0, 100.0) as i32
}

/// Run an FFmpeg command, reporting progress through `on_progress`. The
/// callback returns false to request cancellation (claim lost, shutdown).
pub async fn run_ffmpeg_with_progress<F>(
    args: &[String],
    duration: f64,
    timeout: Duration,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(i32) -> bool,
{
    debug!("ffmpeg {}", args.join(" "));

    let mut child = Command::new("ffmpeg")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    // Drain stderr concurrently; FFmpeg blocks when the pipe fills up
    let stderr_task = tokio::spawn(async move {
        let mut tail = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tail = line;
        }
        tail
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut cancelled = false;

    let wait = async {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(out_time_us) = parse_progress_line(&line) {
                if !on_progress(progress_percent(out_time_us, duration)) {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            let _ = child.kill().await;
        }
        child.wait().await
    };

    let status = match tokio::time::timeout(timeout, wait).await {
        Ok(status) => status?,
        Err(_) => {
            warn!("Encode exceeded {}s budget, killing ffmpeg", timeout.as_secs());
            return Err(WorkerError::Timeout {
                what: "ffmpeg encode".to_string(),
                secs: timeout.as_secs(),
            });
        }
    };

    let stderr_tail = stderr_task.await.unwrap_or_default();

    if cancelled {
        return Err(WorkerError::ClaimExpired);
    }
    if !status.success() {
        return Err(WorkerError::Ffmpeg(format!(
            "ffmpeg exited with {status}: {stderr_tail}"
        )));
    }
    Ok(())
}

/// Files produced for a quality under a format, as paths in `output_dir`.
pub fn quality_artifacts(
    output_dir: &Path,
    quality: &str,
    format: StreamingFormat,
) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    match format {
        StreamingFormat::HlsTs => {
            let playlist = output_dir.join(format!("{quality}.m3u8"));
            if playlist.is_file() {
                files.push(playlist);
            }
            let prefix = format!("{quality}_");
            for entry in std::fs::read_dir(output_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(&prefix) && name.ends_with(".ts") {
                    files.push(entry.path());
                }
            }
        }
        StreamingFormat::Cmaf => {
            let quality_dir = output_dir.join(quality);
            for entry in std::fs::read_dir(&quality_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == "stream.m3u8" || name == "init.mp4" || name.ends_with(".m4s") {
                    files.push(entry.path());
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Approximate bitrate of produced artifacts in kbps, from bytes on disk
/// over source duration. Used for the `original` remux, whose bitrate is
/// whatever the source had.
pub fn estimate_bitrate_kbps(files: &[PathBuf], duration: f64) -> i32 {
    if duration <= 0.0 {
        return 0;
    }
    let total_bytes: u64 = files
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();
    ((total_bytes as f64 * 8.0) / duration / 1000.0) as i32
}
