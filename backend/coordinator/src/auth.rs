//! Worker API key authentication
//!
//! Keys are long random secrets returned once at registration. Only the
//! SHA-256 hash is stored; lookups go through an indexed 8-character prefix
//! so each request costs one point query, and hash comparison is
//! constant-time. Client IPs never influence authentication, only logging.

use crate::error::ApiError;
use crate::models::{ApiKeyRow, WorkerRow};
use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use tracing::debug;
use worker_protocol::API_KEY_HEADER;

/// Length of the random portion of a generated key.
const KEY_RANDOM_LEN: usize = 43;
pub const KEY_PREFIX_LEN: usize = 8;

/// Generate a new raw API key.
pub fn generate_api_key() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("whk_{random}")
}

/// SHA-256 hex digest of a raw key.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Lookup prefix: the first 8 characters of the raw key.
pub fn key_prefix(key: &str) -> &str {
    &key[..key.len().min(KEY_PREFIX_LEN)]
}

/// Constant-time equality over hash strings.
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Authenticated worker, extracted from the `X-Worker-API-Key` header.
#[derive(Debug, Clone)]
pub struct AuthedWorker(pub WorkerRow);

impl FromRequest for AuthedWorker {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let pool = req.app_data::<web::Data<PgPool>>().cloned();
        let api_key = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Box::pin(async move {
            let pool = pool
                .ok_or_else(|| ApiError::Internal("database pool not configured".to_string()))?;
            let api_key = api_key.ok_or_else(|| {
                ApiError::Unauthorized(format!("Missing API key. Include {API_KEY_HEADER} header."))
            })?;

            let worker = verify_worker_key(pool.get_ref(), &api_key).await?;
            Ok(AuthedWorker(worker))
        })
    }
}

/// Verify a raw API key and return the owning worker.
pub async fn verify_worker_key(pool: &PgPool, api_key: &str) -> Result<WorkerRow, ApiError> {
    if api_key.len() < KEY_PREFIX_LEN {
        return Err(ApiError::Unauthorized("Invalid API key".to_string()));
    }

    let prefix = key_prefix(api_key);
    let hash = hash_api_key(api_key);

    let key_row = sqlx::query_as::<_, ApiKeyRow>(
        r#"
        SELECT id, worker_id, key_prefix, key_hash, expires_at, revoked_at, last_used_at, created_at
        FROM worker_api_keys
        WHERE key_prefix = $1 AND revoked_at IS NULL
        "#,
    )
    .bind(prefix)
    .fetch_all(pool)
    .await?
    .into_iter()
    .find(|row| hashes_match(&row.key_hash, &hash))
    .ok_or_else(|| ApiError::Unauthorized("Invalid API key".to_string()))?;

    if let Some(expires_at) = key_row.expires_at {
        if expires_at < chrono::Utc::now() {
            return Err(ApiError::Unauthorized("API key expired".to_string()));
        }
    }

    // Fire-and-forget usage stamp; a single expression, never read-then-write
    let usage_pool = pool.clone();
    let key_id = key_row.id;
    tokio::spawn(async move {
        let result = sqlx::query("UPDATE worker_api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&usage_pool)
            .await;
        if let Err(e) = result {
            debug!("last_used_at update failed for key {key_id}: {e}");
        }
    });

    let worker = sqlx::query_as::<_, WorkerRow>(
        r#"
        SELECT id, worker_id, worker_name, worker_type, status, capabilities,
               registered_at, last_heartbeat
        FROM workers
        WHERE id = $1
        "#,
    )
    .bind(key_row.worker_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::Unauthorized("Worker not found".to_string()))?;

    if worker.status == "disabled" {
        return Err(ApiError::Forbidden("Worker is disabled".to_string()));
    }

    Ok(worker)
}

/// Effective client IP for log attribution. The first X-Forwarded-For entry
/// is honored only when the direct peer is a trusted proxy.
pub fn effective_client_ip(req: &HttpRequest, trusted_proxies: &[String]) -> String {
    let peer = req
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if trusted_proxies.iter().any(|p| p == &peer) {
        if let Some(forwarded) = req
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }

    peer
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_generated_keys_are_unique_and_prefixed() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert!(a.starts_with("whk_"));
        assert_eq!(a.len(), 4 + KEY_RANDOM_LEN);
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        let hash = hash_api_key("whk_test");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_api_key("whk_test"));
        assert_ne!(hash, hash_api_key("whk_other"));
    }

    #[test]
    fn test_prefix_is_eight_chars() {
        let key = generate_api_key();
        assert_eq!(key_prefix(&key).len(), KEY_PREFIX_LEN);
        assert!(key.starts_with(key_prefix(&key)));
        // Short inputs never panic
        assert_eq!(key_prefix("abc"), "abc");
    }

    #[test]
    fn test_hashes_match_constant_time_semantics() {
        let h = hash_api_key("whk_x");
        assert!(hashes_match(&h, &h));
        assert!(!hashes_match(&h, &hash_api_key("whk_y")));
        // Length mismatch is still a clean false
        assert!(!hashes_match(&h, "short"));
    }

    #[test]
    fn test_effective_ip_ignores_header_from_untrusted_peer() {
        let req = TestRequest::default()
            .insert_header(("X-Forwarded-For", "203.0.113.9, 10.0.0.1"))
            .peer_addr("192.0.2.5:4711".parse().unwrap())
            .to_http_request();

        // Peer not trusted: header ignored
        assert_eq!(effective_client_ip(&req, &[]), "192.0.2.5");

        // Peer trusted: first forwarded entry wins
        let trusted = vec!["192.0.2.5".to_string()];
        assert_eq!(effective_client_ip(&req, &trusted), "203.0.113.9");
    }
}
