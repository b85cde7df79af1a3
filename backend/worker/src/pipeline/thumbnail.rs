//! Thumbnail extraction

use crate::error::{Result, WorkerError};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Grab the frame early in the video but clear of black lead-ins: five
/// seconds in, or a quarter of the way through for short clips.
pub fn thumbnail_timestamp(duration: f64) -> f64 {
    (duration / 4.0).min(5.0).max(0.0)
}

/// Extract a single ~640px-wide JPEG frame.
pub async fn generate_thumbnail(
    input: &Path,
    output: &Path,
    timestamp: f64,
    timeout: Duration,
) -> Result<()> {
    let ts = format!("{timestamp:.3}");
    let child = Command::new("ffmpeg")
        .args([
            "-y",
            "-ss",
            &ts,
            "-i",
            &input.to_string_lossy(),
            "-vframes",
            "1",
            "-vf",
            "scale=640:-2",
            &output.to_string_lossy(),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let result = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| WorkerError::Timeout {
            what: "thumbnail extraction".to_string(),
            secs: timeout.as_secs(),
        })??;

    if !result.status.success() {
        return Err(WorkerError::Ffmpeg(format!(
            "thumbnail extraction failed: {}",
            String::from_utf8_lossy(&result.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_for_long_videos_caps_at_five_seconds() {
        assert_eq!(thumbnail_timestamp(300.0), 5.0);
        assert_eq!(thumbnail_timestamp(30.0), 5.0);
    }

    #[test]
    fn test_timestamp_for_short_clips_is_quarter_point() {
        assert_eq!(thumbnail_timestamp(8.0), 2.0);
        assert_eq!(thumbnail_timestamp(2.0), 0.5);
    }

    #[test]
    fn test_timestamp_never_negative() {
        assert_eq!(thumbnail_timestamp(0.0), 0.0);
    }
}
