//! Dispatch message carried on the priority streams

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Dispatch priority. Streams are always consumed high to low; within a
/// stream, order is arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// Consumption order.
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(JobPriority::High),
            "normal" => Some(JobPriority::Normal),
            "low" => Some(JobPriority::Low),
            _ => None,
        }
    }

    /// Numeric rank stored on `transcoding_jobs.priority`; higher claims first.
    pub fn rank(&self) -> i16 {
        match self {
            JobPriority::High => 2,
            JobPriority::Normal => 1,
            JobPriority::Low => 0,
        }
    }

    pub fn from_rank(rank: i16) -> Self {
        match rank {
            r if r >= 2 => JobPriority::High,
            1 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job dispatch message for workers.
///
/// Carried on a Redis stream as flat string fields. `message_id`/`stream`
/// identify the stream entry for acknowledgment and never leave the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDispatch {
    pub job_id: i64,
    pub video_id: i64,
    pub video_slug: String,
    pub source_filename: Option<String>,
    pub source_width: Option<i32>,
    pub source_height: Option<i32>,
    pub duration: Option<f64>,
    pub priority: JobPriority,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub message_id: Option<String>,
    #[serde(skip)]
    pub stream: Option<String>,
}

impl JobDispatch {
    pub fn new(job_id: i64, video_id: i64, video_slug: &str, priority: JobPriority) -> Self {
        Self {
            job_id,
            video_id,
            video_slug: video_slug.to_string(),
            source_filename: None,
            source_width: None,
            source_height: None,
            duration: None,
            priority,
            created_at: Some(Utc::now()),
            message_id: None,
            stream: None,
        }
    }

    /// Encode as stream fields (all values stringly, empty/zero for absent).
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("job_id".to_string(), self.job_id.to_string()),
            ("video_id".to_string(), self.video_id.to_string()),
            ("video_slug".to_string(), self.video_slug.clone()),
            (
                "source_filename".to_string(),
                self.source_filename.clone().unwrap_or_default(),
            ),
            (
                "source_width".to_string(),
                self.source_width.unwrap_or(0).to_string(),
            ),
            (
                "source_height".to_string(),
                self.source_height.unwrap_or(0).to_string(),
            ),
            (
                "duration".to_string(),
                self.duration.unwrap_or(0.0).to_string(),
            ),
            ("priority".to_string(), self.priority.as_str().to_string()),
            (
                "created_at".to_string(),
                self.created_at.unwrap_or_else(Utc::now).to_rfc3339(),
            ),
        ]
    }

    /// Decode from stream fields. Returns None when the required ids are
    /// missing or unparseable; optional fields degrade silently.
    pub fn from_fields(
        fields: &HashMap<String, String>,
        message_id: Option<String>,
        stream: Option<String>,
    ) -> Option<Self> {
        let job_id: i64 = fields.get("job_id")?.parse().ok()?;
        let video_id: i64 = fields.get("video_id")?.parse().ok()?;
        let video_slug = fields.get("video_slug")?.clone();

        let non_empty = |key: &str| fields.get(key).filter(|v| !v.is_empty()).cloned();
        let non_zero_i32 = |key: &str| {
            fields
                .get(key)
                .and_then(|v| v.parse::<i32>().ok())
                .filter(|v| *v != 0)
        };

        Some(Self {
            job_id,
            video_id,
            video_slug,
            source_filename: non_empty("source_filename"),
            source_width: non_zero_i32("source_width"),
            source_height: non_zero_i32("source_height"),
            duration: fields
                .get("duration")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|d| *d > 0.0),
            priority: fields
                .get("priority")
                .and_then(|p| JobPriority::parse(p))
                .unwrap_or(JobPriority::Normal),
            created_at: fields
                .get("created_at")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            message_id,
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rank_round_trip() {
        for priority in JobPriority::ALL {
            assert_eq!(JobPriority::from_rank(priority.rank()), priority);
        }
        assert_eq!(JobPriority::from_rank(7), JobPriority::High);
        assert_eq!(JobPriority::from_rank(-1), JobPriority::Low);
    }

    #[test]
    fn test_dispatch_field_round_trip() {
        let mut dispatch = JobDispatch::new(42, 7, "spring-hike", JobPriority::High);
        dispatch.source_filename = Some("7.mp4".to_string());
        dispatch.source_width = Some(1920);
        dispatch.source_height = Some(1080);
        dispatch.duration = Some(30.5);

        let fields: HashMap<String, String> = dispatch.to_fields().into_iter().collect();
        let decoded =
            JobDispatch::from_fields(&fields, Some("1-0".to_string()), Some("s".to_string()))
                .unwrap();

        assert_eq!(decoded.job_id, 42);
        assert_eq!(decoded.video_id, 7);
        assert_eq!(decoded.video_slug, "spring-hike");
        assert_eq!(decoded.source_filename.as_deref(), Some("7.mp4"));
        assert_eq!(decoded.source_width, Some(1920));
        assert_eq!(decoded.source_height, Some(1080));
        assert_eq!(decoded.duration, Some(30.5));
        assert_eq!(decoded.priority, JobPriority::High);
        assert_eq!(decoded.message_id.as_deref(), Some("1-0"));
    }

    #[test]
    fn test_dispatch_absent_fields_decode_as_none() {
        let dispatch = JobDispatch::new(1, 2, "clip", JobPriority::Low);
        let fields: HashMap<String, String> = dispatch.to_fields().into_iter().collect();
        let decoded = JobDispatch::from_fields(&fields, None, None).unwrap();

        assert!(decoded.source_filename.is_none());
        assert!(decoded.source_width.is_none());
        assert!(decoded.duration.is_none());
    }

    #[test]
    fn test_dispatch_rejects_missing_ids() {
        let mut fields = HashMap::new();
        fields.insert("video_slug".to_string(), "clip".to_string());
        assert!(JobDispatch::from_fields(&fields, None, None).is_none());
    }

    #[test]
    fn test_dispatch_tolerates_bad_created_at() {
        let dispatch = JobDispatch::new(1, 2, "clip", JobPriority::Normal);
        let mut fields: HashMap<String, String> = dispatch.to_fields().into_iter().collect();
        fields.insert("created_at".to_string(), "not-a-date".to_string());
        let decoded = JobDispatch::from_fields(&fields, None, None).unwrap();
        assert!(decoded.created_at.is_none());
    }
}
