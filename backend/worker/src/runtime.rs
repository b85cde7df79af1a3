//! Worker runtime: heartbeat loop, claim loop, graceful shutdown
//!
//! One job at a time. The claim loop prefers Redis dispatch (confirmed
//! through the coordinator, whose database CAS is authoritative) and falls
//! back to polling. SIGTERM/SIGINT let the current job finish; no new jobs
//! are claimed afterwards.

use crate::api_client::WorkerApiClient;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::hwaccel;
use crate::pipeline::{JobOutcome, Pipeline};
use alerts::AlertSender;
use job_queue::JobQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct WorkerRuntime {
    config: Arc<WorkerConfig>,
    client: Arc<WorkerApiClient>,
    queue: JobQueue,
    alert_sender: AlertSender,
    shutdown: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    consumer_name: String,
}

impl WorkerRuntime {
    /// Build the runtime: verify configuration, connect the queue, register
    /// the stream consumer.
    pub async fn new(config: WorkerConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("VODHOST_WORKER_API_KEY is required"))?;

        tokio::fs::create_dir_all(&config.work_dir).await?;

        let client = Arc::new(WorkerApiClient::new(&config.api_url, &api_key)?);
        let consumer_name = format!("worker-{}", &Uuid::new_v4().to_string()[..8]);

        let mut queue = JobQueue::connect(config.queue_config()).await?;
        queue.initialize_consumer(&consumer_name).await?;
        if queue.is_redis_enabled() {
            info!("Redis Streams enabled for instant job dispatch");
        } else {
            info!(
                "Using database polling (interval: {}s)",
                config.poll_interval.as_secs()
            );
        }

        let alert_sender = AlertSender::new(config.alert_config());

        Ok(Self {
            config: Arc::new(config),
            client,
            queue,
            alert_sender,
            shutdown: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicBool::new(false)),
            consumer_name,
        })
    }

    /// Run until shutdown. Returns an error only for unrecoverable startup
    /// conditions (unreachable coordinator).
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Worker starting");
        info!("  API URL: {}", self.config.api_url);
        info!("  Work dir: {}", self.config.work_dir.display());
        info!("  Consumer: {}", self.consumer_name);

        // GPU detection is slow (test encodes); once per process
        let gpu_caps = hwaccel::detect_gpu_capabilities(&self.config.hwaccel_type)
            .await
            .map(Arc::new);
        match &gpu_caps {
            Some(caps) => info!(
                "GPU detected: {} ({}), max sessions {}",
                caps.device_name,
                caps.hwaccel_type.as_str(),
                caps.max_concurrent_sessions
            ),
            None => info!("No GPU acceleration available, using CPU encoding"),
        }

        let capabilities = hwaccel::worker_capabilities(gpu_caps.as_deref()).await;

        // The first heartbeat doubles as the connectivity check; a worker
        // that cannot reach its coordinator has nothing to do
        self.client
            .heartbeat("idle", Some(capabilities.clone()))
            .await
            .map_err(|e| anyhow::anyhow!("cannot reach coordinator at startup: {e}"))?;
        info!("Connected to coordinator");

        self.alert_sender.worker_startup(
            &self.consumer_name,
            gpu_caps.as_ref().map(|c| c.device_name.as_str()),
        );

        self.spawn_signal_handler();
        let heartbeat = self.spawn_heartbeat_loop(capabilities);

        let pipeline = Pipeline {
            client: self.client.clone(),
            config: self.config.clone(),
            gpu_caps,
            shutdown: self.shutdown.clone(),
        };

        let mut jobs_processed: u64 = 0;
        let mut jobs_failed: u64 = 0;

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.next_job().await {
                Ok(Some((envelope, dispatch))) => {
                    self.busy.store(true, Ordering::SeqCst);
                    let outcome = pipeline.process_job(&envelope).await;
                    self.busy.store(false, Ordering::SeqCst);

                    match outcome {
                        JobOutcome::Completed => {
                            jobs_processed += 1;
                            if let Some(dispatch) = &dispatch {
                                if let Err(e) = self.queue.acknowledge(dispatch).await {
                                    warn!("Failed to acknowledge dispatch: {e}");
                                }
                            }
                        }
                        JobOutcome::ClaimExpired => {
                            // The job belongs to someone else; drop the
                            // message so the stream does not replay it here
                            if let Some(dispatch) = &dispatch {
                                let _ = self.queue.acknowledge(dispatch).await;
                            }
                        }
                        JobOutcome::Failed(error) => {
                            jobs_failed += 1;
                            if let Some(dispatch) = &dispatch {
                                if let Err(e) = self.queue.reject(dispatch, &error).await {
                                    warn!("Failed to reject dispatch: {e}");
                                }
                            }
                        }
                    }
                }
                Ok(None) => {
                    // Redis reads already block; only database polling sleeps
                    if !self.queue.is_redis_enabled() {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
                Err(e) => {
                    error!("Claim loop error: {e}");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        heartbeat.abort();
        self.alert_sender
            .worker_shutdown(&self.consumer_name, jobs_processed, jobs_failed);
        info!("Worker stopped. Jobs processed: {jobs_processed}, failed: {jobs_failed}");
        Ok(())
    }

    /// Fetch the next job envelope, preferring queue dispatch. A dispatched
    /// job that the database refuses is acknowledged and skipped.
    async fn next_job(
        &self,
    ) -> Result<Option<(worker_protocol::ClaimResponse, Option<job_queue::JobDispatch>)>> {
        if self.queue.is_redis_enabled() {
            if let Some(dispatch) = self.queue.claim().await? {
                info!("Queue dispatched job {}, confirming claim", dispatch.job_id);
                let envelope = self.client.claim(Some(dispatch.job_id)).await?;
                if envelope.job_id.is_some() {
                    return Ok(Some((envelope, Some(dispatch))));
                }
                // Already claimed or completed elsewhere; drop the message
                info!("Job {} no longer claimable, acknowledging", dispatch.job_id);
                self.queue.acknowledge(&dispatch).await?;
                return Ok(None);
            }
        }

        let envelope = self.client.claim(None).await?;
        if envelope.job_id.is_some() {
            return Ok(Some((envelope, None)));
        }
        Ok(None)
    }

    fn spawn_heartbeat_loop(&self, capabilities: serde_json::Value) -> JoinHandle<()> {
        let client = self.client.clone();
        let shutdown = self.shutdown.clone();
        let busy = self.busy.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut sent_capabilities = true;
            loop {
                tokio::time::sleep(interval).await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let status = if busy.load(Ordering::SeqCst) {
                    "busy"
                } else {
                    "idle"
                };
                // Capabilities ride only on the first heartbeat after a gap
                let caps = if sent_capabilities {
                    None
                } else {
                    Some(capabilities.clone())
                };
                match client.heartbeat(status, caps).await {
                    Ok(_) => sent_capabilities = true,
                    Err(e) => {
                        warn!("Heartbeat failed: {e}");
                        sent_capabilities = false;
                    }
                }
            }
        })
    }

    fn spawn_signal_handler(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to install SIGINT handler: {e}");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
            info!("Shutdown signal received, finishing current job");
            shutdown.store(true, Ordering::SeqCst);
        });
    }
}
