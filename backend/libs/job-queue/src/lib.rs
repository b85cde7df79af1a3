//! Job queue for transcoding dispatch
//!
//! Supports two backends:
//! - Database polling (default, always works)
//! - Redis Streams (instant dispatch when available)
//!
//! Three priority streams are consumed in order (high, normal, low), plus a
//! capped dead-letter stream for jobs that exhausted their retries. Redis
//! dispatch is advisory only: the claim CAS in the database remains the
//! authority, so duplicate or stale dispatches are harmless.

use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use worker_protocol::truncate_error;

pub mod dispatch;

pub use dispatch::{JobDispatch, JobPriority};

/// Queue backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Claim by polling the database; no push dispatch.
    Database,
    /// Redis Streams required; jobs are not claimable without it.
    Redis,
    /// Redis when reachable at startup, database polling otherwise.
    Hybrid,
}

impl QueueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "database" => Some(QueueMode::Database),
            "redis" => Some(QueueMode::Redis),
            "hybrid" => Some(QueueMode::Hybrid),
            _ => None,
        }
    }

    pub fn wants_redis(&self) -> bool {
        matches!(self, QueueMode::Redis | QueueMode::Hybrid)
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub redis_url: Option<String>,
    /// Key prefix for all streams, e.g. "vodhost".
    pub stream_prefix: String,
    pub consumer_group: String,
    /// Idle time after which a pending message is considered abandoned.
    pub pending_timeout_ms: u64,
    /// Blocking-read window for stream consumers.
    pub block_ms: u64,
    /// Approximate cap on each priority stream.
    pub stream_maxlen: usize,
    /// Approximate cap on the dead-letter stream.
    pub dead_letter_maxlen: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Hybrid,
            redis_url: None,
            stream_prefix: "vodhost".to_string(),
            consumer_group: "transcoders".to_string(),
            pending_timeout_ms: 60_000,
            block_ms: 5_000,
            stream_maxlen: 10_000,
            dead_letter_maxlen: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn stream_key(&self, priority: JobPriority) -> String {
        format!("{}:jobs:{}", self.stream_prefix, priority.as_str())
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}:jobs:dead-letter", self.stream_prefix)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("queue not initialized for consuming")]
    NotInitialized,
}

/// Per-priority stream statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StreamStats {
    pub length: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub available: bool,
    pub streams: HashMap<String, StreamStats>,
    pub dead_letter: usize,
}

/// Job queue manager supporting database and Redis backends.
#[derive(Clone)]
pub struct JobQueue {
    config: QueueConfig,
    conn: Option<ConnectionManager>,
    consumer_name: Option<String>,
}

impl JobQueue {
    /// Connect according to the configured mode. In hybrid mode a Redis
    /// failure degrades to database polling; in redis mode it is surfaced.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        if !config.mode.wants_redis() {
            info!("Job queue mode: database (polling)");
            return Ok(Self {
                config,
                conn: None,
                consumer_name: None,
            });
        }

        let Some(url) = config.redis_url.clone().filter(|u| !u.is_empty()) else {
            if config.mode == QueueMode::Redis {
                warn!("Redis queue mode requires REDIS_URL; jobs will not be dispatched");
            } else {
                info!("REDIS_URL not set, using database polling fallback");
            }
            return Ok(Self {
                config,
                conn: None,
                consumer_name: None,
            });
        };

        match Self::open_connection(&url).await {
            Ok(conn) => {
                info!("Job queue connected to Redis Streams");
                Ok(Self {
                    config,
                    conn: Some(conn),
                    consumer_name: None,
                })
            }
            Err(e) if config.mode == QueueMode::Hybrid => {
                warn!("Redis unavailable ({e}), using database polling fallback");
                Ok(Self {
                    config,
                    conn: None,
                    consumer_name: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_connection(url: &str) -> Result<ConnectionManager, RedisError> {
        let client = redis::Client::open(url)?;
        ConnectionManager::new(client).await
    }

    /// Whether push dispatch through Redis is active.
    pub fn is_redis_enabled(&self) -> bool {
        self.conn.is_some()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create the consumer group on every priority stream and register this
    /// consumer. Required before `claim`.
    pub async fn initialize_consumer(&mut self, consumer_name: &str) -> Result<(), QueueError> {
        self.consumer_name = Some(consumer_name.to_string());

        let Some(conn) = self.conn.as_ref() else {
            return Ok(());
        };
        let mut conn = conn.clone();

        for priority in JobPriority::ALL {
            let stream = self.config.stream_key(priority);
            let result: Result<(), RedisError> = conn
                .xgroup_create_mkstream(&stream, &self.config.consumer_group, "0")
                .await;
            match result {
                Ok(()) => {
                    info!("Created consumer group on {stream}");
                }
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    // Group already exists
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("Job queue initialized with Redis Streams (consumer: {consumer_name})");
        Ok(())
    }

    /// Publish a new job dispatch. Returns true when pushed to Redis, false
    /// when the queue is database-only.
    pub async fn publish(&self, job: &JobDispatch) -> Result<bool, QueueError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(false);
        };
        let mut conn = conn.clone();

        let stream = self.config.stream_key(job.priority);
        let fields = job.to_fields();
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let _: String = conn
            .xadd_maxlen(
                &stream,
                StreamMaxlen::Approx(self.config.stream_maxlen),
                "*",
                &pairs,
            )
            .await?;

        debug!("Published job {} to {stream}", job.job_id);
        Ok(true)
    }

    /// Claim the next dispatch, checking priority streams in order.
    ///
    /// Abandoned pending messages (idle beyond the configured threshold) are
    /// reclaimed before new messages are read; the blocking read means this
    /// call may wait up to `block_ms` when nothing is queued.
    pub async fn claim(&self) -> Result<Option<JobDispatch>, QueueError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(None);
        };
        let consumer = self
            .consumer_name
            .as_deref()
            .ok_or(QueueError::NotInitialized)?;
        let mut conn = conn.clone();

        if let Some(job) = self.recover_abandoned(&mut conn, consumer).await? {
            return Ok(Some(job));
        }

        for priority in JobPriority::ALL {
            let stream = self.config.stream_key(priority);
            if let Some(job) = self.read_one(&mut conn, consumer, &stream).await? {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    /// Reclaim pending messages from crashed consumers, highest priority
    /// first. Returns at most one dispatch per call.
    async fn recover_abandoned(
        &self,
        conn: &mut ConnectionManager,
        consumer: &str,
    ) -> Result<Option<JobDispatch>, QueueError> {
        for priority in JobPriority::ALL {
            let stream = self.config.stream_key(priority);

            let pending: StreamPendingCountReply = match conn
                .xpending_count(&stream, &self.config.consumer_group, "-", "+", 10)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("XPENDING failed on {stream}: {e}");
                    continue;
                }
            };

            for entry in pending.ids {
                if entry.last_delivered_ms <= self.config.pending_timeout_ms as usize {
                    continue;
                }

                let claimed: StreamClaimReply = conn
                    .xclaim(
                        &stream,
                        &self.config.consumer_group,
                        consumer,
                        self.config.pending_timeout_ms,
                        &[&entry.id],
                    )
                    .await?;

                if let Some(msg) = claimed.ids.into_iter().next() {
                    if let Some(job) = dispatch_from_stream_id(&msg, &stream) {
                        info!(
                            "Recovered abandoned job {} from {stream} (idle {}ms)",
                            job.job_id, entry.last_delivered_ms
                        );
                        return Ok(Some(job));
                    }
                    // Undecodable entry: drop it so it stops clogging the PEL
                    let _: i64 = conn
                        .xack(&stream, &self.config.consumer_group, &[&msg.id])
                        .await?;
                }
            }
        }

        Ok(None)
    }

    async fn read_one(
        &self,
        conn: &mut ConnectionManager,
        consumer: &str,
        stream: &str,
    ) -> Result<Option<JobDispatch>, QueueError> {
        let options = StreamReadOptions::default()
            .group(&self.config.consumer_group, consumer)
            .count(1)
            .block(self.config.block_ms as usize);

        let reply: StreamReadReply = match conn.xread_options(&[stream], &[">"], &options).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("XREADGROUP failed on {stream}: {e}");
                return Ok(None);
            }
        };

        for key in reply.keys {
            if let Some(msg) = key.ids.into_iter().next() {
                if let Some(job) = dispatch_from_stream_id(&msg, stream) {
                    return Ok(Some(job));
                }
                let _: i64 = conn
                    .xack(stream, &self.config.consumer_group, &[&msg.id])
                    .await?;
            }
        }

        Ok(None)
    }

    /// Acknowledge a dispatch after its job finished (or was confirmed
    /// unclaimable at the database level).
    pub async fn acknowledge(&self, job: &JobDispatch) -> Result<bool, QueueError> {
        let (Some(conn), Some(message_id), Some(stream)) =
            (self.conn.as_ref(), &job.message_id, &job.stream)
        else {
            return Ok(false);
        };
        let mut conn = conn.clone();

        let _: i64 = conn
            .xack(stream, &self.config.consumer_group, &[message_id])
            .await?;
        debug!("Acknowledged job {}", job.job_id);
        Ok(true)
    }

    /// Move a dispatch to the dead-letter stream and acknowledge the
    /// original message.
    pub async fn reject(&self, job: &JobDispatch, error: &str) -> Result<bool, QueueError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(false);
        };
        let mut conn = conn.clone();

        let mut fields = job.to_fields();
        fields.push(("error".to_string(), truncate_error(error)));
        fields.push((
            "failed_at".to_string(),
            chrono::Utc::now().to_rfc3339(),
        ));
        fields.push((
            "original_stream".to_string(),
            job.stream.clone().unwrap_or_default(),
        ));
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let _: String = conn
            .xadd_maxlen(
                self.config.dead_letter_key(),
                StreamMaxlen::Approx(self.config.dead_letter_maxlen),
                "*",
                &pairs,
            )
            .await?;

        if let (Some(message_id), Some(stream)) = (&job.message_id, &job.stream) {
            let _: i64 = conn
                .xack(stream, &self.config.consumer_group, &[message_id])
                .await?;
        }

        let summary: String = error.chars().take(100).collect();
        info!("Job {} moved to dead-letter queue: {summary}", job.job_id);
        Ok(true)
    }

    /// Append a coordinator-built entry to the dead-letter stream. Used when
    /// the database, not a stream message, is the source of truth for the
    /// failure (e.g. stale-claim escalation).
    pub async fn dead_letter(&self, job: &JobDispatch, error: &str) -> Result<bool, QueueError> {
        self.reject(job, error).await
    }

    /// Trim the dead-letter stream to its cap, dropping the oldest entries.
    pub async fn trim_dead_letter(&self) -> Result<(), QueueError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(());
        };
        let mut conn = conn.clone();

        let _: i64 = conn
            .xtrim(
                self.config.dead_letter_key(),
                StreamMaxlen::Approx(self.config.dead_letter_maxlen),
            )
            .await?;
        Ok(())
    }

    /// Queue statistics for the admin surface.
    pub async fn stats(&self) -> QueueStats {
        let Some(conn) = self.conn.as_ref() else {
            return QueueStats::default();
        };
        let mut conn = conn.clone();

        let mut stats = QueueStats {
            available: true,
            ..Default::default()
        };

        for priority in JobPriority::ALL {
            let stream = self.config.stream_key(priority);
            let length: usize = conn.xlen(&stream).await.unwrap_or(0);
            let pending: usize = conn
                .xpending_count::<_, _, _, _, _, StreamPendingCountReply>(
                    &stream,
                    &self.config.consumer_group,
                    "-",
                    "+",
                    1000,
                )
                .await
                .map(|r| r.ids.len())
                .unwrap_or(0);
            stats
                .streams
                .insert(priority.as_str().to_string(), StreamStats { length, pending });
        }

        stats.dead_letter = conn.xlen(self.config.dead_letter_key()).await.unwrap_or(0);
        stats
    }
}

/// Decode a stream entry into a dispatch, tagging it with the message id and
/// stream needed for acknowledgment.
fn dispatch_from_stream_id(msg: &StreamId, stream: &str) -> Option<JobDispatch> {
    let mut fields = HashMap::new();
    for (key, value) in &msg.map {
        if let Ok(s) = redis::from_redis_value::<String>(value) {
            fields.insert(key.clone(), s);
        }
    }
    JobDispatch::from_fields(&fields, Some(msg.id.clone()), Some(stream.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(QueueMode::parse("database"), Some(QueueMode::Database));
        assert_eq!(QueueMode::parse("redis"), Some(QueueMode::Redis));
        assert_eq!(QueueMode::parse("hybrid"), Some(QueueMode::Hybrid));
        assert_eq!(QueueMode::parse("kafka"), None);
        assert!(!QueueMode::Database.wants_redis());
        assert!(QueueMode::Hybrid.wants_redis());
    }

    #[test]
    fn test_stream_keys_follow_priority_order() {
        let config = QueueConfig::default();
        let keys: Vec<String> = JobPriority::ALL
            .into_iter()
            .map(|p| config.stream_key(p))
            .collect();
        assert_eq!(
            keys,
            vec![
                "vodhost:jobs:high",
                "vodhost:jobs:normal",
                "vodhost:jobs:low"
            ]
        );
        assert_eq!(config.dead_letter_key(), "vodhost:jobs:dead-letter");
    }

    #[tokio::test]
    async fn test_database_mode_never_dispatches() {
        let queue = JobQueue::connect(QueueConfig {
            mode: QueueMode::Database,
            redis_url: Some("redis://localhost:1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(!queue.is_redis_enabled());
        let job = JobDispatch::new(1, 2, "clip", JobPriority::Normal);
        assert!(!queue.publish(&job).await.unwrap());
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hybrid_mode_degrades_without_redis() {
        // Unroutable port: hybrid mode must fall back instead of failing
        let queue = JobQueue::connect(QueueConfig {
            mode: QueueMode::Hybrid,
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(!queue.is_redis_enabled());
    }
}
