//! Webhook alerts for transcoding events
//!
//! Delivers notifications for stale-job recovery, exhausted retries,
//! repeated per-video failures, and worker lifecycle events. Delivery runs
//! on a background task fed by an unbounded channel so callers never block;
//! per-type rate limiting keeps a flapping job from flooding the endpoint,
//! while critical types bypass the limit.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Alert event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    JobStaleRecovered,
    JobMaxRetriesExceeded,
    JobFailed,
    WorkerStartup,
    WorkerShutdown,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::JobStaleRecovered => "job_stale_recovered",
            AlertType::JobMaxRetriesExceeded => "job_max_retries_exceeded",
            AlertType::JobFailed => "job_failed",
            AlertType::WorkerStartup => "worker_startup",
            AlertType::WorkerShutdown => "worker_shutdown",
        }
    }

    /// Critical alerts bypass rate limiting.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AlertType::JobMaxRetriesExceeded | AlertType::WorkerStartup | AlertType::WorkerShutdown
        )
    }
}

/// Alert sender configuration.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Webhook endpoint; alerts are disabled when None.
    pub webhook_url: Option<String>,
    /// Optional shared secret for the HMAC payload signature.
    pub secret: Option<String>,
    /// Minimum interval between alerts of the same type.
    pub min_interval: Duration,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            secret: None,
            min_interval: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct AlertEvent {
    alert_type: AlertType,
    details: serde_json::Value,
    force: bool,
}

/// Rate limiter tracking the last send per alert type plus per-video failure
/// counts for repeated-failure detection. In-process and ephemeral.
#[derive(Debug, Default)]
pub struct AlertLimiter {
    last_sent: HashMap<AlertType, Instant>,
    video_failures: HashMap<i64, u32>,
}

impl AlertLimiter {
    pub fn can_send(&self, alert_type: AlertType, min_interval: Duration) -> bool {
        match self.last_sent.get(&alert_type) {
            Some(at) => at.elapsed() >= min_interval,
            None => true,
        }
    }

    pub fn record_sent(&mut self, alert_type: AlertType) {
        self.last_sent.insert(alert_type, Instant::now());
    }

    /// Record a failure for a video; returns the running count.
    pub fn record_video_failure(&mut self, video_id: i64) -> u32 {
        let count = self.video_failures.entry(video_id).or_insert(0);
        *count += 1;
        *count
    }
}

/// Handle for emitting alerts. Cloneable; delivery happens on a background
/// task owned by the first instance.
#[derive(Clone)]
pub struct AlertSender {
    tx: Option<mpsc::UnboundedSender<AlertEvent>>,
}

impl AlertSender {
    /// Spawn the delivery task. With no webhook URL configured the sender is
    /// inert and every emit is a no-op.
    pub fn new(config: AlertConfig) -> Self {
        if config.webhook_url.is_none() {
            debug!("Alert webhook not configured, alerts disabled");
            return Self { tx: None };
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(delivery_loop(config, rx));
        Self { tx: Some(tx) }
    }

    /// An inert sender for contexts without alerting (tests, tools).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn emit(&self, alert_type: AlertType, details: serde_json::Value, force: bool) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(AlertEvent {
                alert_type,
                details,
                force,
            });
        }
    }

    pub fn stale_job_recovered(
        &self,
        video_id: i64,
        video_slug: &str,
        attempt_number: i32,
        previous_worker: Option<&str>,
    ) {
        self.emit(
            AlertType::JobStaleRecovered,
            serde_json::json!({
                "video_id": video_id,
                "video_slug": video_slug,
                "attempt_number": attempt_number,
                "next_attempt": attempt_number + 1,
                "previous_worker_id": previous_worker,
            }),
            false,
        );
    }

    pub fn max_retries_exceeded(
        &self,
        video_id: i64,
        video_slug: &str,
        max_attempts: i32,
        last_error: Option<&str>,
    ) {
        self.emit(
            AlertType::JobMaxRetriesExceeded,
            serde_json::json!({
                "video_id": video_id,
                "video_slug": video_slug,
                "max_attempts": max_attempts,
                "last_error": last_error,
            }),
            true,
        );
    }

    /// Emitted on every failure; the delivery loop only sends once a video
    /// has failed repeatedly.
    pub fn job_failed(
        &self,
        video_id: i64,
        video_slug: &str,
        attempt_number: i32,
        error: &str,
        will_retry: bool,
    ) {
        self.emit(
            AlertType::JobFailed,
            serde_json::json!({
                "video_id": video_id,
                "video_slug": video_slug,
                "attempt_number": attempt_number,
                "error": error,
                "will_retry": will_retry,
            }),
            false,
        );
    }

    pub fn worker_startup(&self, worker_id: &str, gpu_info: Option<&str>) {
        self.emit(
            AlertType::WorkerStartup,
            serde_json::json!({
                "worker_id": worker_id,
                "gpu_info": gpu_info,
            }),
            true,
        );
    }

    pub fn worker_shutdown(&self, worker_id: &str, jobs_processed: u64, jobs_failed: u64) {
        self.emit(
            AlertType::WorkerShutdown,
            serde_json::json!({
                "worker_id": worker_id,
                "jobs_processed": jobs_processed,
                "jobs_failed": jobs_failed,
            }),
            true,
        );
    }
}

/// Number of failures of the same video before a job_failed alert fires.
const REPEATED_FAILURE_THRESHOLD: u32 = 2;

async fn delivery_loop(config: AlertConfig, mut rx: mpsc::UnboundedReceiver<AlertEvent>) {
    let url = config.webhook_url.clone().unwrap_or_default();
    let client = match reqwest::Client::builder().timeout(config.timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to build alert HTTP client, alerts disabled: {e}");
            return;
        }
    };
    let mut limiter = AlertLimiter::default();

    while let Some(event) = rx.recv().await {
        // job_failed only fires once the same video has failed repeatedly
        if event.alert_type == AlertType::JobFailed {
            let video_id = event.details["video_id"].as_i64().unwrap_or(0);
            let count = limiter.record_video_failure(video_id);
            if count < REPEATED_FAILURE_THRESHOLD {
                continue;
            }
        }

        let force = event.force || event.alert_type.is_critical();
        if !force && !limiter.can_send(event.alert_type, config.min_interval) {
            debug!("Alert {} rate limited", event.alert_type.as_str());
            continue;
        }

        let payload = serde_json::json!({
            "event": event.alert_type.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "details": event.details,
        });

        let mut request = client.post(&url).json(&payload);
        if let Some(secret) = &config.secret {
            request = request.header(
                "X-Alert-Signature",
                format!("sha256={}", sign_payload(secret, &payload)),
            );
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                limiter.record_sent(event.alert_type);
                info!("Alert sent: {}", event.alert_type.as_str());
            }
            Ok(resp) => {
                warn!(
                    "Alert webhook returned {} for {}",
                    resp.status(),
                    event.alert_type.as_str()
                );
            }
            Err(e) => {
                warn!("Failed to send alert webhook: {e}");
            }
        }
    }
}

/// HMAC-SHA256 signature over the serialized payload.
pub fn sign_payload(secret: &str, payload: &serde_json::Value) -> String {
    let body = serde_json::to_string(payload).unwrap_or_default();
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
