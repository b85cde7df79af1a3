//! Worker registry persistence

use crate::auth::{generate_api_key, hash_api_key, key_prefix};
use crate::error::Result;
use crate::models::WorkerRow;
use sqlx::PgPool;
use uuid::Uuid;

/// Register a new worker and issue its API key. The raw key is returned to
/// the caller exactly once; only the hash is stored.
pub async fn register(
    pool: &PgPool,
    worker_name: Option<&str>,
    worker_type: &str,
    capabilities: Option<&serde_json::Value>,
) -> Result<(WorkerRow, String)> {
    let worker_uuid = Uuid::new_v4().to_string();
    let raw_key = generate_api_key();

    let mut tx = pool.begin().await?;

    let worker = sqlx::query_as::<_, WorkerRow>(
        r#"
        INSERT INTO workers (worker_id, worker_name, worker_type, status, capabilities)
        VALUES ($1, $2, $3, 'active', $4)
        RETURNING id, worker_id, worker_name, worker_type, status, capabilities,
                  registered_at, last_heartbeat
        "#,
    )
    .bind(&worker_uuid)
    .bind(worker_name)
    .bind(worker_type)
    .bind(capabilities)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO worker_api_keys (worker_id, key_prefix, key_hash)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(worker.id)
    .bind(key_prefix(&raw_key))
    .bind(hash_api_key(&raw_key))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok((worker, raw_key))
}

/// Record a heartbeat: stamps `last_heartbeat`, reactivates offline workers,
/// and refreshes capabilities when the worker reports them.
pub async fn heartbeat(
    pool: &PgPool,
    worker_pk: i64,
    capabilities: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE workers
        SET last_heartbeat = NOW(),
            status = CASE WHEN status = 'disabled' THEN status ELSE 'active' END,
            capabilities = COALESCE($2, capabilities)
        WHERE id = $1
        "#,
    )
    .bind(worker_pk)
    .bind(capabilities)
    .execute(pool)
    .await?;
    Ok(())
}

/// List all registered workers, most recently heard-from first.
pub async fn list(pool: &PgPool) -> Result<Vec<WorkerRow>> {
    let workers = sqlx::query_as::<_, WorkerRow>(
        r#"
        SELECT id, worker_id, worker_name, worker_type, status, capabilities,
               registered_at, last_heartbeat
        FROM workers
        ORDER BY last_heartbeat DESC NULLS LAST, registered_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(workers)
}

/// Mark active workers offline when their heartbeat is older than the
/// threshold. Returns the number of workers transitioned.
pub async fn mark_stale_offline(pool: &PgPool, threshold_secs: u64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE workers
        SET status = 'offline'
        WHERE status = 'active'
          AND (last_heartbeat IS NULL OR last_heartbeat < NOW() - $1 * INTERVAL '1 second')
        "#,
    )
    .bind(threshold_secs as i64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
