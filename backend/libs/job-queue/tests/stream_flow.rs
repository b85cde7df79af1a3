//! Redis Streams round-trip tests
//!
//! Run against a real Redis instance; skipped when REDIS_URL is not set.
//! Each test uses its own stream prefix so runs never interfere.

use job_queue::{JobDispatch, JobPriority, JobQueue, QueueConfig, QueueMode};
use uuid::Uuid;

fn test_config(prefix: &str) -> QueueConfig {
    QueueConfig {
        mode: QueueMode::Redis,
        redis_url: std::env::var("REDIS_URL").ok(),
        stream_prefix: prefix.to_string(),
        pending_timeout_ms: 60_000,
        block_ms: 100,
        ..QueueConfig::default()
    }
}

async fn test_queue(suffix: &str) -> Option<JobQueue> {
    if std::env::var("REDIS_URL").is_err() {
        eprintln!("REDIS_URL not set, skipping integration test");
        return None;
    }
    let prefix = format!("vodhost-test-{suffix}-{}", Uuid::new_v4());
    let mut queue = JobQueue::connect(test_config(&prefix)).await.expect("connect");
    assert!(queue.is_redis_enabled(), "redis mode must connect");
    queue
        .initialize_consumer("test-consumer")
        .await
        .expect("initialize consumer");
    Some(queue)
}

#[tokio::test]
async fn test_publish_claim_ack_round_trip() {
    let Some(queue) = test_queue("ack").await else { return };

    let mut dispatch = JobDispatch::new(11, 21, "round-trip", JobPriority::Normal);
    dispatch.source_filename = Some("21.mp4".to_string());
    assert!(queue.publish(&dispatch).await.unwrap());

    let claimed = queue.claim().await.unwrap().expect("message available");
    assert_eq!(claimed.job_id, 11);
    assert_eq!(claimed.video_id, 21);
    assert_eq!(claimed.video_slug, "round-trip");
    assert_eq!(claimed.source_filename.as_deref(), Some("21.mp4"));
    assert!(claimed.message_id.is_some());

    assert!(queue.acknowledge(&claimed).await.unwrap());

    // Acknowledged: nothing left to claim
    let empty = queue.claim().await.unwrap();
    assert!(empty.is_none());
}

#[tokio::test]
async fn test_high_priority_claims_first() {
    let Some(queue) = test_queue("priority").await else { return };

    queue
        .publish(&JobDispatch::new(1, 1, "low", JobPriority::Low))
        .await
        .unwrap();
    queue
        .publish(&JobDispatch::new(2, 2, "normal", JobPriority::Normal))
        .await
        .unwrap();
    queue
        .publish(&JobDispatch::new(3, 3, "high", JobPriority::High))
        .await
        .unwrap();

    let order: Vec<String> = {
        let mut slugs = Vec::new();
        for _ in 0..3 {
            let claimed = queue.claim().await.unwrap().expect("message");
            slugs.push(claimed.video_slug.clone());
            queue.acknowledge(&claimed).await.unwrap();
        }
        slugs
    };
    assert_eq!(order, vec!["high", "normal", "low"]);
}

#[tokio::test]
async fn test_reject_moves_to_dead_letter() {
    let Some(queue) = test_queue("dlq").await else { return };

    queue
        .publish(&JobDispatch::new(7, 7, "doomed", JobPriority::Normal))
        .await
        .unwrap();
    let claimed = queue.claim().await.unwrap().expect("message");

    let long_error = "e".repeat(2000);
    assert!(queue.reject(&claimed, &long_error).await.unwrap());

    // Original message is gone and the dead-letter stream holds it
    assert!(queue.claim().await.unwrap().is_none());
    let stats = queue.stats().await;
    assert!(stats.available);
    assert_eq!(stats.dead_letter, 1);
}

#[tokio::test]
async fn test_abandoned_message_is_recovered() {
    if std::env::var("REDIS_URL").is_err() {
        eprintln!("REDIS_URL not set, skipping integration test");
        return;
    }

    // Tiny pending timeout so an unacknowledged read becomes abandoned fast
    let prefix = format!("vodhost-test-recover-{}", Uuid::new_v4());
    let mut config = test_config(&prefix);
    config.pending_timeout_ms = 50;

    let mut crashed = JobQueue::connect(config.clone()).await.unwrap();
    crashed.initialize_consumer("crashed-worker").await.unwrap();

    crashed
        .publish(&JobDispatch::new(5, 5, "orphaned", JobPriority::Normal))
        .await
        .unwrap();
    // Read without acknowledging, as a crashing worker would
    let taken = crashed.claim().await.unwrap().expect("message");
    assert_eq!(taken.video_slug, "orphaned");

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut survivor = JobQueue::connect(config).await.unwrap();
    survivor.initialize_consumer("survivor-worker").await.unwrap();

    let recovered = survivor
        .claim()
        .await
        .unwrap()
        .expect("abandoned message reclaimed");
    assert_eq!(recovered.job_id, 5);
    survivor.acknowledge(&recovered).await.unwrap();
}
