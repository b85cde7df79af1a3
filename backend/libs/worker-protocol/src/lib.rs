//! Wire protocol for the worker HTTP surface
//!
//! Request and response bodies exchanged between transcoding workers and the
//! coordinator. Every body is an explicitly-typed struct; both sides depend
//! on this crate so the shapes cannot drift apart.

use chrono::{DateTime, Utc};
use media_core::{JobStep, QualityStatus};
use serde::{Deserialize, Serialize};

/// Header carrying the raw worker API key.
pub const API_KEY_HEADER: &str = "X-Worker-API-Key";

/// Maximum stored length for error messages, enforced on every path that
/// persists one.
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate an error message to the storable length on a char boundary.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

// Worker registration

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub worker_name: Option<String>,
    /// "local" or "remote"
    #[serde(default = "default_worker_type")]
    pub worker_type: String,
    /// Free-form capability tags (codecs, encoders, hwaccel type, GPU name).
    #[serde(default)]
    pub capabilities: Option<serde_json::Value>,
}

fn default_worker_type() -> String {
    "remote".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: String,
    /// Returned exactly once; only the hash is stored.
    pub api_key: String,
    pub message: String,
}

// Heartbeat

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// "idle" or "busy"
    #[serde(default = "default_heartbeat_status")]
    pub status: String,
    #[serde(default)]
    pub capabilities: Option<serde_json::Value>,
}

fn default_heartbeat_status() -> String {
    "idle".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub server_time: DateTime<Utc>,
}

// Job claiming

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Targeted claim for a queue-dispatched job; empty for oldest-pending.
    #[serde(default)]
    pub job_id: Option<i64>,
}

/// Claim response. `job_id` is `None` when no work is available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimResponse {
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub video_id: Option<i64>,
    #[serde(default)]
    pub video_slug: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub source_width: Option<i32>,
    #[serde(default)]
    pub source_height: Option<i32>,
    #[serde(default)]
    pub source_filename: Option<String>,
    #[serde(default)]
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Qualities already on storage, skipped on selective re-transcode.
    #[serde(default)]
    pub existing_qualities: Vec<String>,
    pub message: String,
}

impl ClaimResponse {
    pub fn empty() -> Self {
        Self {
            message: "No jobs available".to_string(),
            ..Default::default()
        }
    }
}

// Progress updates

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityProgressUpdate {
    pub name: String,
    pub status: QualityStatus,
    /// 0-100
    pub progress: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRequest {
    pub current_step: JobStep,
    /// 0-100
    pub progress_percent: f32,
    #[serde(default)]
    pub quality_progress: Vec<QualityProgressUpdate>,
    /// Probe results, sent once so metadata survives a worker crash.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub source_width: Option<i32>,
    #[serde(default)]
    pub source_height: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub status: String,
    pub claim_expires_at: DateTime<Utc>,
}

// Job completion

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityInfo {
    pub name: String,
    pub width: i32,
    pub height: i32,
    /// kbps
    pub bitrate: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub qualities: Vec<QualityInfo>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub source_width: Option<i32>,
    #[serde(default)]
    pub source_height: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub status: String,
    pub message: String,
}

// Job failure

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub error_message: String,
    #[serde(default = "default_retry")]
    pub retry: bool,
}

fn default_retry() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailResponse {
    pub status: String,
    pub will_retry: bool,
    pub attempt_number: i32,
}

// Simple status payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_error_short_is_unchanged() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn test_truncate_error_caps_at_limit() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        // Multi-byte chars straddling the limit must not split
        let long = "é".repeat(400);
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= MAX_ERROR_LEN);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_claim_response_empty_has_no_job() {
        let resp = ClaimResponse::empty();
        assert!(resp.job_id.is_none());
        assert_eq!(resp.message, "No jobs available");
    }

    #[test]
    fn test_progress_request_deserializes_with_defaults() {
        let req: ProgressRequest = serde_json::from_str(
            r#"{"current_step": "transcode", "progress_percent": 42.5}"#,
        )
        .unwrap();
        assert_eq!(req.current_step, JobStep::Transcode);
        assert!(req.quality_progress.is_empty());
        assert!(req.duration.is_none());
    }

    #[test]
    fn test_quality_progress_wire_shape() {
        let update = QualityProgressUpdate {
            name: "720p".to_string(),
            status: QualityStatus::InProgress,
            progress: 50,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["progress"], 50);
    }
}
