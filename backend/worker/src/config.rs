//! Worker configuration
//!
//! Read from `VODHOST_WORKER_*` / `VODHOST_*` environment variables. A
//! remote worker cannot start without an API key; that is a hard exit at
//! startup, not a runtime error.

use job_queue::{QueueConfig, QueueMode};
use media_core::hls::StreamingFormat;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator base URL, e.g. http://coordinator:9002
    pub api_url: String,
    /// Raw API key issued at registration.
    pub api_key: Option<String>,
    pub worker_name: Option<String>,
    /// Scratch space for downloads and encoder output.
    pub work_dir: PathBuf,

    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,

    pub queue_mode: QueueMode,
    pub redis_url: Option<String>,
    pub stream_prefix: String,

    /// "auto", "nvidia", "intel", or "none".
    pub hwaccel_type: String,
    /// "h264", "hevc", or "av1".
    pub preferred_codec: String,

    pub hls_segment_duration: u32,
    pub streaming_format: StreamingFormat,

    /// Encode timeout = clamp(duration * multiplier * resolution factor).
    pub ffmpeg_timeout_multiplier: f64,
    pub ffmpeg_timeout_min: Duration,
    pub ffmpeg_timeout_max: Duration,
    /// Budget for probe/thumbnail subprocesses.
    pub probe_timeout: Duration,

    /// Sources longer than this are rejected at probe time.
    pub max_duration_secs: f64,

    /// Fixed cap on concurrent quality encodes; 0 = derive from the GPU.
    pub parallel_qualities: usize,

    /// Keep finished quality files across retries so the next attempt skips
    /// them.
    pub keep_completed_qualities: bool,

    /// Minimum spacing between progress calls to the coordinator.
    pub progress_interval: Duration,

    /// Webhook endpoint for lifecycle and failure alerts.
    pub alert_webhook_url: Option<String>,
    pub alert_secret: Option<String>,
    pub alert_rate_limit: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            api_url: env_str("VODHOST_WORKER_API_URL", "http://localhost:9002"),
            api_key: std::env::var("VODHOST_WORKER_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            worker_name: std::env::var("VODHOST_WORKER_NAME").ok(),
            work_dir: PathBuf::from(env_str("VODHOST_WORKER_WORK_DIR", "/tmp/vodhost-worker")),
            heartbeat_interval: Duration::from_secs(env_parse(
                "VODHOST_WORKER_HEARTBEAT_INTERVAL_SECS",
                30,
            )?),
            poll_interval: Duration::from_secs(env_parse(
                "VODHOST_WORKER_POLL_INTERVAL_SECS",
                10,
            )?),
            queue_mode: QueueMode::parse(&env_str("VODHOST_JOB_QUEUE_MODE", "hybrid"))
                .ok_or("invalid VODHOST_JOB_QUEUE_MODE")?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            stream_prefix: env_str("VODHOST_STREAM_PREFIX", "vodhost"),
            hwaccel_type: env_str("VODHOST_HWACCEL_TYPE", "auto"),
            preferred_codec: env_str("VODHOST_HWACCEL_PREFERRED_CODEC", "h264"),
            hls_segment_duration: env_parse("VODHOST_HLS_SEGMENT_DURATION", 6)?,
            streaming_format: StreamingFormat::parse(&env_str(
                "VODHOST_STREAMING_FORMAT",
                "hls_ts",
            ))
            .ok_or("invalid VODHOST_STREAMING_FORMAT")?,
            ffmpeg_timeout_multiplier: env_parse("VODHOST_FFMPEG_TIMEOUT_MULTIPLIER", 3.0)?,
            ffmpeg_timeout_min: Duration::from_secs(env_parse(
                "VODHOST_FFMPEG_TIMEOUT_MINIMUM_SECS",
                300,
            )?),
            ffmpeg_timeout_max: Duration::from_secs(env_parse(
                "VODHOST_FFMPEG_TIMEOUT_MAXIMUM_SECS",
                3600,
            )?),
            probe_timeout: Duration::from_secs(env_parse("VODHOST_PROBE_TIMEOUT_SECS", 30)?),
            max_duration_secs: env_parse("VODHOST_MAX_DURATION_SECS", 7.0 * 86_400.0)?,
            parallel_qualities: env_parse("VODHOST_PARALLEL_QUALITIES", 0)?,
            keep_completed_qualities: env_parse("VODHOST_KEEP_COMPLETED_QUALITIES", true)?,
            progress_interval: Duration::from_secs(env_parse(
                "VODHOST_PROGRESS_UPDATE_INTERVAL_SECS",
                5,
            )?),
            alert_webhook_url: std::env::var("VODHOST_ALERT_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            alert_secret: std::env::var("VODHOST_ALERT_SECRET").ok(),
            alert_rate_limit: Duration::from_secs(env_parse(
                "VODHOST_ALERT_RATE_LIMIT_SECS",
                300,
            )?),
        })
    }

    pub fn alert_config(&self) -> alerts::AlertConfig {
        alerts::AlertConfig {
            webhook_url: self.alert_webhook_url.clone(),
            secret: self.alert_secret.clone(),
            min_interval: self.alert_rate_limit,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            mode: self.queue_mode,
            redis_url: self.redis_url.clone(),
            stream_prefix: self.stream_prefix.clone(),
            ..QueueConfig::default()
        }
    }
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T::Err: std::error::Error + 'static,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_defaults() {
        for var in [
            "VODHOST_WORKER_API_URL",
            "VODHOST_WORKER_API_KEY",
            "VODHOST_JOB_QUEUE_MODE",
            "VODHOST_STREAMING_FORMAT",
            "VODHOST_HLS_SEGMENT_DURATION",
        ] {
            std::env::remove_var(var);
        }

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.api_url, "http://localhost:9002");
        assert!(config.api_key.is_none());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.streaming_format, StreamingFormat::HlsTs);
        assert_eq!(config.hls_segment_duration, 6);
        assert!(config.keep_completed_qualities);
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_queue_mode_is_rejected() {
        std::env::set_var("VODHOST_JOB_QUEUE_MODE", "carrier-pigeon");
        assert!(WorkerConfig::from_env().is_err());
        std::env::remove_var("VODHOST_JOB_QUEUE_MODE");
    }
}
