use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the blocking connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted after waiting {waited:?} (max_size={max_size})")]
    Exhausted { waited: Duration, max_size: usize },

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to open database connection")]
    Open(#[from] rusqlite::Error),
}

/// Failures from the inference backend. Transport and API errors are
/// kept apart so callers can log status codes and response excerpts.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http request failed")]
    Http(#[from] reqwest::Error),

    #[error("api returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("api reply carried no message content")]
    EmptyReply,

    #[error("failed to sample frames from {path}: {cause}")]
    FrameSampling { path: String, cause: anyhow::Error },
}

/// A failed frame grab. Grab errors are transient by contract: the
/// capture loop logs them and retries rather than stopping.
#[derive(Debug, Error)]
#[error("frame capture failed: {0}")]
pub struct CaptureError(pub String);
