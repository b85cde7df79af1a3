//! Worker error taxonomy
//!
//! A 409 from any coordinator call becomes `ClaimExpired`, an explicit
//! result that short-circuits the pipeline: the job may already belong to
//! another worker, so nothing more is reported and local temp files are
//! discarded.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The coordinator answered 409: abort, someone else may own this job.
    #[error("claim expired - job may have been reassigned to another worker")]
    ClaimExpired,

    #[error("coordinator returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ffmpeg failed: {0}")]
    Ffmpeg(String),

    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("invalid media: {0}")]
    InvalidMedia(String),

    #[error("playlist validation failed: {0}")]
    Playlist(#[from] media_core::hls::PlaylistError),

    #[error("queue error: {0}")]
    Queue(#[from] job_queue::QueueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// Whether the pipeline should stop without reporting failure.
    pub fn is_claim_expired(&self) -> bool {
        matches!(self, WorkerError::ClaimExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_expired_detection() {
        assert!(WorkerError::ClaimExpired.is_claim_expired());
        assert!(!WorkerError::Ffmpeg("boom".into()).is_claim_expired());
    }
}
