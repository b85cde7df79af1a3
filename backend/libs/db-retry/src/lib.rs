//! Retry wrapper for transient database errors
//!
//! Classifies sqlx errors as retryable (deadlocks, serialization failures,
//! lock contention, dropped connections) and retries them with exponential
//! backoff plus jitter. Once attempts are exhausted a distinguished error is
//! raised; the HTTP surface maps it to 503 with `Retry-After: 1`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Default retry configuration: 100 ms base delay doubling up to 2 s,
/// five retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RetryError {
    /// All retries exhausted; the caller should surface 503 `Retry-After: 1`.
    #[error("database operation failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    /// Non-retryable error, re-raised immediately.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// SQLSTATE codes that indicate the statement may succeed on retry.
const RETRYABLE_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

const RETRYABLE_MESSAGE_PATTERNS: &[&str] = &[
    "deadlock detected",
    "could not serialize access",
    "could not obtain lock",
    "lock timeout",
    "connection refused",
    "connection reset",
    "server closed the connection unexpectedly",
];

/// Check whether an sqlx error is worth retrying.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                if RETRYABLE_SQLSTATES.contains(&code.as_ref()) {
                    return true;
                }
            }
            let message = db_err.message().to_lowercase();
            RETRYABLE_MESSAGE_PATTERNS
                .iter()
                .any(|p| message.contains(p))
        }
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Retry policy carried by `with_retry`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (0-based), with ±25 % jitter so
    /// contending writers do not stampede in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_range = exp.as_secs_f64() * 0.25;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((exp.as_secs_f64() + jitter).max(0.01))
    }
}

/// Run `op` with the default retry policy.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T, RetryError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    with_retry_policy(RetryPolicy::default(), op).await
}

/// Run `op`, retrying transient database errors per `policy`.
pub async fn with_retry_policy<T, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, RetryError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut last_err: Option<sqlx::Error> = None;

    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) => {
                if attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = policy.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient database error, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    error!(
                        attempts = policy.max_retries + 1,
                        "database error after all retries: {err}"
                    );
                }
                last_err = Some(err);
            }
            Err(err) => return Err(RetryError::Database(err)),
        }
    }

    Err(RetryError::Exhausted {
        attempts: policy.max_retries + 1,
        source: last_err.expect("exhausted without an error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient_error() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ))
    }

    #[test]
    fn test_io_and_pool_errors_are_retryable() {
        assert!(is_retryable(&transient_error()));
        assert!(is_retryable(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        assert!(!is_retryable(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        // Jitter is ±25 %, so compare against generous bounds.
        assert!(policy.delay_for_attempt(0) <= Duration::from_millis(200));
        assert!(policy.delay_for_attempt(10) <= Duration::from_millis(2600));
        assert!(policy.delay_for_attempt(10) >= Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_error_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = with_retry(move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient_error())
                } else {
                    Ok(42u32)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), RetryError> = with_retry(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient_error())
            }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => {
                assert_eq!(attempts, DEFAULT_MAX_RETRIES + 1)
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_surfaces_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), RetryError> = with_retry(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(sqlx::Error::RowNotFound)
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Database(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
