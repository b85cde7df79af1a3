//! Status enumerations shared across the coordinator and workers
//!
//! All enums serialize to the lowercase/snake_case strings stored in the
//! database CHECK constraints and carried on the worker wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Video lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
        }
    }
}

impl FromStr for VideoStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VideoStatus::Pending),
            "processing" => Ok(VideoStatus::Processing),
            "ready" => Ok(VideoStatus::Ready),
            "failed" => Ok(VideoStatus::Failed),
            other => Err(ParseStatusError::new("video status", other)),
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline step currently executed by the worker owning a job.
///
/// Step names are a contract observed by the admin UI; they arrive in
/// pipeline order for any single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    Pending,
    Download,
    Probe,
    Thumbnail,
    Transcode,
    MasterPlaylist,
    Upload,
    Finalize,
}

impl JobStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStep::Pending => "pending",
            JobStep::Download => "download",
            JobStep::Probe => "probe",
            JobStep::Thumbnail => "thumbnail",
            JobStep::Transcode => "transcode",
            JobStep::MasterPlaylist => "master_playlist",
            JobStep::Upload => "upload",
            JobStep::Finalize => "finalize",
        }
    }
}

impl FromStr for JobStep {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStep::Pending),
            "download" => Ok(JobStep::Download),
            "probe" => Ok(JobStep::Probe),
            "thumbnail" => Ok(JobStep::Thumbnail),
            "transcode" => Ok(JobStep::Transcode),
            "master_playlist" => Ok(JobStep::MasterPlaylist),
            "upload" => Ok(JobStep::Upload),
            "finalize" => Ok(JobStep::Finalize),
            other => Err(ParseStatusError::new("job step", other)),
        }
    }
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-quality transcode/upload status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Pending,
    InProgress,
    Uploading,
    Uploaded,
    Completed,
    Failed,
    Skipped,
}

impl QualityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Pending => "pending",
            QualityStatus::InProgress => "in_progress",
            QualityStatus::Uploading => "uploading",
            QualityStatus::Uploaded => "uploaded",
            QualityStatus::Completed => "completed",
            QualityStatus::Failed => "failed",
            QualityStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for QualityStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QualityStatus::Pending),
            "in_progress" => Ok(QualityStatus::InProgress),
            "uploading" => Ok(QualityStatus::Uploading),
            "uploaded" => Ok(QualityStatus::Uploaded),
            "completed" => Ok(QualityStatus::Completed),
            "failed" => Ok(QualityStatus::Failed),
            "skipped" => Ok(QualityStatus::Skipped),
            other => Err(ParseStatusError::new("quality status", other)),
        }
    }
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Offline,
    Disabled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "offline" => Ok(WorkerStatus::Offline),
            "disabled" => Ok(WorkerStatus::Disabled),
            other => Err(ParseStatusError::new("worker status", other)),
        }
    }
}

/// Error for unrecognized status strings coming off the wire or the database.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unrecognized {kind}: {value}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

impl ParseStatusError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_status_round_trip() {
        for s in ["pending", "processing", "ready", "failed"] {
            assert_eq!(s.parse::<VideoStatus>().unwrap().as_str(), s);
        }
        assert!("deleted".parse::<VideoStatus>().is_err());
    }

    #[test]
    fn test_job_step_round_trip() {
        for s in [
            "pending",
            "download",
            "probe",
            "thumbnail",
            "transcode",
            "master_playlist",
            "upload",
            "finalize",
        ] {
            assert_eq!(s.parse::<JobStep>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_quality_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&QualityStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
