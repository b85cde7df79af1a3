//! Media probing via ffprobe

use crate::error::{Result, WorkerError};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Source metadata extracted before transcoding.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: i32,
    pub height: i32,
    pub duration: f64,
    pub codec: String,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<i32>,
    #[serde(default)]
    height: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

/// Parse ffprobe's JSON output into a `VideoInfo`.
pub fn parse_probe_output(json: &str) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_str(json)?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| WorkerError::InvalidMedia("no video stream found".to_string()))?;

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(VideoInfo {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        duration,
        codec: stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Reject sources whose duration cannot drive the pipeline: non-finite,
/// non-positive, or beyond the configured ceiling.
pub fn validate_duration(duration: f64, max_duration_secs: f64) -> Result<()> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(WorkerError::InvalidMedia(format!(
            "invalid duration: {duration}"
        )));
    }
    if duration > max_duration_secs {
        return Err(WorkerError::InvalidMedia(format!(
            "duration {duration:.0}s exceeds maximum {max_duration_secs:.0}s"
        )));
    }
    Ok(())
}

/// Probe a source file.
pub async fn get_video_info(
    input: &Path,
    timeout: Duration,
    max_duration_secs: f64,
) -> Result<VideoInfo> {
    let output = run_ffprobe(
        &[
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            &input.to_string_lossy(),
        ],
        timeout,
    )
    .await?;

    let info = parse_probe_output(&output)?;
    validate_duration(info.duration, max_duration_secs)?;
    if info.width <= 0 || info.height <= 0 {
        return Err(WorkerError::InvalidMedia(format!(
            "invalid source dimensions: {}x{}",
            info.width, info.height
        )));
    }
    Ok(info)
}

/// Dimensions of a produced segment. The master playlist needs the real
/// output size because aspect ratios drift from the preset table.
pub async fn get_output_dimensions(segment: &Path, timeout: Duration) -> Option<(i32, i32)> {
    let output = run_ffprobe(
        &[
            "-v",
            "quiet",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
            &segment.to_string_lossy(),
        ],
        timeout,
    )
    .await
    .ok()?;

    let probe: ProbeOutput = serde_json::from_str(&output).ok()?;
    let stream = probe.streams.first()?;
    match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
        _ => None,
    }
}

async fn run_ffprobe(args: &[&str], timeout: Duration) -> Result<String> {
    let child = Command::new("ffprobe")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| WorkerError::Timeout {
            what: "ffprobe".to_string(),
            secs: timeout.as_secs(),
        })??;

    if !output.status.success() {
        return Err(WorkerError::Ffmpeg(format!(
            "ffprobe failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "audio", "codec_name": "aac"},
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080}
        ],
        "format": {"duration": "30.500000"}
    }"#;

    #[test]
    fn test_parse_probe_output() {
        let info = parse_probe_output(SAMPLE).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.duration, 30.5);
        assert_eq!(info.codec, "h264");
    }

    #[test]
    fn test_parse_requires_video_stream() {
        let audio_only = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "5"}}"#;
        assert!(matches!(
            parse_probe_output(audio_only),
            Err(WorkerError::InvalidMedia(_))
        ));
    }

    #[test]
    fn test_validate_duration_bounds() {
        assert!(validate_duration(30.0, 604_800.0).is_ok());
        assert!(validate_duration(0.0, 604_800.0).is_err());
        assert!(validate_duration(-5.0, 604_800.0).is_err());
        assert!(validate_duration(f64::NAN, 604_800.0).is_err());
        assert!(validate_duration(f64::INFINITY, 604_800.0).is_err());
        assert!(validate_duration(700_000.0, 604_800.0).is_err());
    }

    #[test]
    fn test_parse_tolerates_missing_duration() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 640, "height": 360}]}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration, 0.0);
        assert!(validate_duration(info.duration, 604_800.0).is_err());
    }
}
