//! Worker registration and API key verification tests
//!
//! Run against a real PostgreSQL instance; skipped when DATABASE_URL is not
//! set.

use coordinator::auth::{hash_api_key, key_prefix, verify_worker_key};
use coordinator::db::worker_repo;
use coordinator::error::ApiError;
use sqlx::PgPool;

async fn test_pool() -> Option<PgPool> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set, skipping integration test");
            return None;
        }
    };
    let pool = PgPool::connect(&url).await.expect("connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Some(pool)
}

#[tokio::test]
async fn test_register_issues_usable_key() {
    let Some(pool) = test_pool().await else { return };

    let (worker, raw_key) = worker_repo::register(&pool, Some("encoder-1"), "remote", None)
        .await
        .unwrap();
    assert!(raw_key.starts_with("whk_"));

    // Only the hash is stored
    let stored: String =
        sqlx::query_scalar("SELECT key_hash FROM worker_api_keys WHERE worker_id = $1")
            .bind(worker.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_ne!(stored, raw_key);
    assert_eq!(stored, hash_api_key(&raw_key));

    let verified = verify_worker_key(&pool, &raw_key).await.unwrap();
    assert_eq!(verified.worker_id, worker.worker_id);
    assert_eq!(verified.worker_name.as_deref(), Some("encoder-1"));

    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_wrong_key_with_valid_prefix_is_rejected() {
    let Some(pool) = test_pool().await else { return };

    let (worker, raw_key) = worker_repo::register(&pool, None, "remote", None)
        .await
        .unwrap();

    // Same prefix, different tail: the prefix lookup will hit, the
    // constant-time hash comparison must not
    let forged = format!("{}{}", key_prefix(&raw_key), "A".repeat(39));
    let result = verify_worker_key(&pool, &forged).await;
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));

    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_revoked_key_is_rejected() {
    let Some(pool) = test_pool().await else { return };

    let (worker, raw_key) = worker_repo::register(&pool, None, "remote", None)
        .await
        .unwrap();

    sqlx::query("UPDATE worker_api_keys SET revoked_at = NOW() WHERE worker_id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();

    let result = verify_worker_key(&pool, &raw_key).await;
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));

    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expired_key_is_rejected() {
    let Some(pool) = test_pool().await else { return };

    let (worker, raw_key) = worker_repo::register(&pool, None, "remote", None)
        .await
        .unwrap();

    sqlx::query(
        "UPDATE worker_api_keys SET expires_at = NOW() - INTERVAL '1 minute' WHERE worker_id = $1",
    )
    .bind(worker.id)
    .execute(&pool)
    .await
    .unwrap();

    let result = verify_worker_key(&pool, &raw_key).await;
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));

    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_disabled_worker_is_forbidden() {
    let Some(pool) = test_pool().await else { return };

    let (worker, raw_key) = worker_repo::register(&pool, None, "remote", None)
        .await
        .unwrap();

    sqlx::query("UPDATE workers SET status = 'disabled' WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();

    // Disabled is an authorization failure, not an authentication one
    let result = verify_worker_key(&pool, &raw_key).await;
    assert!(matches!(result, Err(ApiError::Forbidden(_))));

    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_heartbeat_reactivates_offline_worker() {
    let Some(pool) = test_pool().await else { return };

    let (worker, _raw_key) = worker_repo::register(&pool, None, "remote", None)
        .await
        .unwrap();

    sqlx::query("UPDATE workers SET status = 'offline' WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();

    worker_repo::heartbeat(&pool, worker.id, None).await.unwrap();

    let status: String = sqlx::query_scalar("SELECT status FROM workers WHERE id = $1")
        .bind(worker.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "active");

    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_offline_sweep_targets_silent_workers() {
    let Some(pool) = test_pool().await else { return };

    let (worker, _key) = worker_repo::register(&pool, Some("silent"), "remote", None)
        .await
        .unwrap();

    sqlx::query("UPDATE workers SET last_heartbeat = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();

    let flipped = worker_repo::mark_stale_offline(&pool, 300).await.unwrap();
    assert!(flipped >= 1);

    let status: String = sqlx::query_scalar("SELECT status FROM workers WHERE id = $1")
        .bind(worker.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "offline");

    sqlx::query("DELETE FROM workers WHERE id = $1")
        .bind(worker.id)
        .execute(&pool)
        .await
        .unwrap();
}
