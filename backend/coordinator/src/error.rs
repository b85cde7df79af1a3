use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use db_retry::{RetryError, RetryPolicy};
use serde::Serialize;
use std::future::Future;
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Database(_) | ApiError::Io(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        let mut builder = HttpResponse::build(code);

        // Exhausted retry budget: tell the client when to come back
        if matches!(self, ApiError::Unavailable(_)) {
            builder.insert_header(("Retry-After", "1"));
        }

        builder.json(ErrorResponse {
            error: self.to_string(),
            code: code.as_u16(),
        })
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("record not found".to_string()),
            other => ApiError::Database(other),
        }
    }
}

impl From<RetryError> for ApiError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { .. } => ApiError::Unavailable(err.to_string()),
            RetryError::Database(e) => e.into(),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Io(err.to_string())
    }
}

/// Retry a database-backed operation on transient errors, surfacing 503
/// `Retry-After: 1` once the budget is spent. Domain errors (conflicts,
/// not-found, validation) pass through untouched on the first occurrence.
pub async fn with_db_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = RetryPolicy::default();

    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ApiError::Database(inner)) if db_retry::is_retryable(&inner) => {
                if attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient database error, retrying: {inner}"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    return Err(ApiError::Unavailable(format!(
                        "database operation failed after {} attempts: {inner}",
                        policy.max_retries + 1
                    )));
                }
            }
            Err(other) => return Err(other),
        }
    }

    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::Conflict("claim expired".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Unauthorized("bad key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Unavailable("retries exhausted".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_unavailable_carries_retry_after() {
        let resp = ApiError::Unavailable("busy".into()).error_response();
        assert_eq!(
            resp.headers().get("Retry-After").unwrap().to_str().unwrap(),
            "1"
        );
    }

    #[test]
    fn test_row_not_found_maps_to_404() {
        let err: ApiError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_with_db_retry_passes_domain_errors_through() {
        let result: Result<()> =
            with_db_retry(|| async { Err(ApiError::Conflict("owned elsewhere".into())) }).await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_db_retry_exhausts_to_unavailable() {
        let result: Result<()> = with_db_retry(|| async {
            Err(ApiError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            ))))
        })
        .await;
        assert!(matches!(result, Err(ApiError::Unavailable(_))));
    }
}
