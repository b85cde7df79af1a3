//! Database row types

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VideoRow {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub description: Option<String>,
    pub category_id: Option<i64>,
    pub duration: Option<f64>,
    pub source_width: Option<i32>,
    pub source_height: Option<i32>,
    pub status: String,
    pub error_message: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub id: i64,
    pub video_id: i64,
    pub priority: i16,
    pub worker_id: Option<String>,
    pub current_step: String,
    pub progress_percent: f32,
    pub attempt_number: i32,
    pub max_attempts: i32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QualityProgressRow {
    pub id: i64,
    pub job_id: i64,
    pub quality: String,
    pub status: String,
    pub progress_percent: f32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkerRow {
    pub id: i64,
    pub worker_id: String,
    pub worker_name: Option<String>,
    pub worker_type: String,
    pub status: String,
    pub capabilities: Option<serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ApiKeyRow {
    pub id: i64,
    pub worker_id: i64,
    pub key_prefix: String,
    pub key_hash: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Claim envelope assembled inside the claim transaction.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRow,
    pub video: VideoRow,
    pub existing_qualities: Vec<String>,
}
