//! Crate-wide error taxonomy.
//!
//! One `thiserror::Error` per subsystem boundary, context carried as fields
//! rather than formatted strings so callers can match on variant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error on worker '{worker}': {message}")]
    Transport { worker: String, message: String },

    #[error("permanent transport failure on worker '{worker}': {message}")]
    TransportPermanent { worker: String, message: String },

    #[error("worker '{worker}' failed health check: {errors:?}")]
    HealthViolation { worker: String, errors: Vec<String> },

    #[error("job '{job_id}' build failed: {stderr}")]
    BuildFailed { job_id: String, stderr: String },

    #[error("job '{job_id}' transfer failed on '{path}'")]
    TransferFailed { job_id: String, path: String },

    #[error("job '{job_id}' cancelled")]
    Cancelled { job_id: String },

    #[error("no available {kind} worker")]
    NoAvailableWorker { kind: String },

    #[error("pool acquire timed out for kind '{kind}' after {timeout_ms}ms")]
    PoolTimeout { kind: String, timeout_ms: u64 },

    #[error("worker '{0}' not found")]
    WorkerNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("unsupported builder '{0}'")]
    UnsupportedBuilder(String),

    #[error("unsupported platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the transport-transient bucket the
    /// retry policy is allowed to retry, classified by message content.
    pub fn is_retryable(&self) -> bool {
        let message = match self {
            Error::Transport { message, .. } => message,
            _ => return false,
        };
        let lower = message.to_lowercase();
        const RETRYABLE: &[&str] = &[
            "connection refused",
            "connection reset",
            "connection timed out",
            "no route to host",
            "network is unreachable",
            "ssh exception",
            "authentication failed",
            "channel closed",
            "session closed",
            "temporary failure",
            "timeout",
            "too many connections",
        ];
        RETRYABLE.iter().any(|needle| lower.contains(needle))
    }
}
