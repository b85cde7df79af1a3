//! Coordinator configuration
//!
//! All options come from `VODHOST_*` environment variables (plus
//! `DATABASE_URL`/`REDIS_URL`), with defaults suitable for a single-node
//! install.

use job_queue::{QueueConfig, QueueMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub storage: StorageConfig,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub limits: LimitsConfig,
    pub alerts: AlertSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Peers allowed to set X-Forwarded-For, for log attribution only.
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub videos_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub archive_dir: PathBuf,
    /// Spill area for streamed request bodies, on the same filesystem as
    /// `videos_dir` so final moves are renames.
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub mode: String,
    pub redis_url: Option<String>,
    pub stream_prefix: String,
    pub pending_timeout_ms: u64,
    pub block_ms: u64,
    pub stream_maxlen: usize,
    pub dead_letter_maxlen: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Claim lease duration.
    pub claim_duration_secs: u64,
    /// Heartbeat age after which a worker is marked offline.
    pub offline_threshold_secs: u64,
    /// Janitor cycle interval.
    pub janitor_interval_secs: u64,
    /// Orphaned output directories younger than this are left alone.
    pub orphan_grace_secs: u64,
    /// No orphan cleanup during this window after process start.
    pub startup_grace_secs: u64,
    /// Soft-deleted videos are purged after this long.
    pub archive_retention_secs: u64,
    /// Delete the uploaded source once a job fails permanently.
    pub cleanup_source_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum size of an uploaded source video.
    pub max_upload_bytes: u64,
    /// Maximum size of one file inside an artifact archive.
    pub max_archive_file_bytes: u64,
    /// Maximum total size of an artifact archive body.
    pub max_archive_bytes: u64,
    /// Wall-clock budget for tar extraction.
    pub extract_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    pub webhook_url: Option<String>,
    pub secret: Option<String>,
    pub rate_limit_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let root = PathBuf::from(env_str("VODHOST_STORAGE_PATH", "/srv/vodhost-storage"));
        let videos_dir = root.join(env_str("VODHOST_VIDEOS_SUBDIR", "videos"));
        let uploads_dir = root.join(env_str("VODHOST_UPLOADS_SUBDIR", "uploads"));
        let archive_dir = root.join(env_str("VODHOST_ARCHIVE_SUBDIR", "archive"));
        let tmp_dir = root.join("tmp");

        Ok(Config {
            app: AppConfig {
                host: env_str("VODHOST_COORDINATOR_HOST", "0.0.0.0"),
                port: env_parse("VODHOST_COORDINATOR_PORT", 9002)?,
                trusted_proxies: std::env::var("VODHOST_TRUSTED_PROXIES")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            storage: StorageConfig {
                root,
                videos_dir,
                uploads_dir,
                archive_dir,
                tmp_dir,
            },
            queue: QueueSettings {
                mode: env_str("VODHOST_JOB_QUEUE_MODE", "hybrid"),
                redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
                stream_prefix: env_str("VODHOST_STREAM_PREFIX", "vodhost"),
                pending_timeout_ms: env_parse("VODHOST_REDIS_PENDING_TIMEOUT_MS", 60_000)?,
                block_ms: env_parse("VODHOST_REDIS_BLOCK_MS", 5_000)?,
                stream_maxlen: env_parse("VODHOST_STREAM_MAXLEN", 10_000)?,
                dead_letter_maxlen: env_parse("VODHOST_DEAD_LETTER_MAXLEN", 1_000)?,
            },
            worker: WorkerSettings {
                claim_duration_secs: env_parse("VODHOST_CLAIM_DURATION_SECS", 1800)?,
                offline_threshold_secs: env_parse("VODHOST_OFFLINE_THRESHOLD_SECS", 300)?,
                janitor_interval_secs: env_parse("VODHOST_JANITOR_INTERVAL_SECS", 60)?,
                orphan_grace_secs: env_parse("VODHOST_ORPHAN_GRACE_SECS", 86_400)?,
                startup_grace_secs: env_parse("VODHOST_STARTUP_GRACE_SECS", 3_600)?,
                archive_retention_secs: env_parse(
                    "VODHOST_ARCHIVE_RETENTION_SECS",
                    30 * 86_400,
                )?,
                cleanup_source_on_failure: env_parse(
                    "VODHOST_CLEANUP_SOURCE_ON_FAILURE",
                    true,
                )?,
            },
            limits: LimitsConfig {
                max_upload_bytes: env_parse(
                    "VODHOST_MAX_UPLOAD_BYTES",
                    100 * 1024 * 1024 * 1024,
                )?,
                max_archive_file_bytes: env_parse(
                    "VODHOST_MAX_ARCHIVE_FILE_BYTES",
                    2 * 1024 * 1024 * 1024,
                )?,
                max_archive_bytes: env_parse(
                    "VODHOST_MAX_ARCHIVE_BYTES",
                    32 * 1024 * 1024 * 1024,
                )?,
                extract_timeout_secs: env_parse("VODHOST_EXTRACT_TIMEOUT_SECS", 60)?,
            },
            alerts: AlertSettings {
                webhook_url: std::env::var("VODHOST_ALERT_WEBHOOK_URL")
                    .ok()
                    .filter(|s| !s.is_empty()),
                secret: std::env::var("VODHOST_ALERT_SECRET").ok(),
                rate_limit_secs: env_parse("VODHOST_ALERT_RATE_LIMIT_SECS", 300)?,
            },
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            mode: QueueMode::parse(&self.queue.mode).unwrap_or(QueueMode::Hybrid),
            redis_url: self.queue.redis_url.clone(),
            stream_prefix: self.queue.stream_prefix.clone(),
            consumer_group: "transcoders".to_string(),
            pending_timeout_ms: self.queue.pending_timeout_ms,
            block_ms: self.queue.block_ms,
            stream_maxlen: self.queue.stream_maxlen,
            dead_letter_maxlen: self.queue.dead_letter_maxlen,
        }
    }

    pub fn alert_config(&self) -> alerts::AlertConfig {
        alerts::AlertConfig {
            webhook_url: self.alerts.webhook_url.clone(),
            secret: self.alerts.secret.clone(),
            min_interval: Duration::from_secs(self.alerts.rate_limit_secs),
            timeout: Duration::from_secs(10),
        }
    }

    /// Create the storage directory trees if missing.
    pub async fn ensure_storage_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.storage.videos_dir,
            &self.storage.uploads_dir,
            &self.storage.archive_dir,
            &self.storage.tmp_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
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

/// Allowed source-file extensions, also the download path allow-list.
pub const SOURCE_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov", "avi"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_defaults() {
        for var in [
            "VODHOST_STORAGE_PATH",
            "VODHOST_JOB_QUEUE_MODE",
            "VODHOST_CLAIM_DURATION_SECS",
            "VODHOST_TRUSTED_PROXIES",
        ] {
            std::env::remove_var(var);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.app.port, 9002);
        assert_eq!(config.worker.claim_duration_secs, 1800);
        assert_eq!(config.limits.max_archive_file_bytes, 2 * 1024 * 1024 * 1024);
        assert!(config.storage.videos_dir.ends_with("videos"));
        assert!(config.app.trusted_proxies.is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_trusted_proxies_parsing() {
        std::env::set_var("VODHOST_TRUSTED_PROXIES", "10.0.0.1, 10.0.0.2");
        let config = Config::from_env().unwrap();
        assert_eq!(config.app.trusted_proxies, vec!["10.0.0.1", "10.0.0.2"]);
        std::env::remove_var("VODHOST_TRUSTED_PROXIES");
    }
}
