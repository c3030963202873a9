//! ============================================================================
//! Worker Errors - Failure Taxonomy & Loop Disposition
//! ============================================================================
//! Every failure the worker can observe, and how the outer task loop reacts:
//! - Recovered locally: lock contention, corruption, backend fallback
//! - Backoff and refetch: upload exhaustion, no progress, network trouble
//! - Terminate: the server no longer accepts this client version
//! ============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::backend::Capability;

/// Errors raised by the cache, engine session, orchestrators and server client
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Asset {id} is being downloaded by another process")]
    LockBusy { id: String },

    #[error("Asset {id} failed verification: expected {id}, got {actual}")]
    Corrupt { id: String, actual: String },

    #[error("Backend {capability} rejected by the engine, retry with fallback")]
    RetryWithFallback { capability: Capability },

    #[error("Upload failed after {attempts} attempts: {reason}")]
    UploadFailed { attempts: u32, reason: String },

    #[error("Malformed engine output ({reason}): {line:?}")]
    ProtocolViolation { line: String, reason: String },

    #[error("Engine exited without producing any games")]
    NoProgress,

    #[error("Server rejected this client: {0}")]
    ServerRejected(String),

    #[error("Engine rejected its configuration: {0}")]
    EngineRejected(String),

    #[error("Timed out after {0:?} waiting for the engine")]
    Timeout(Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("Invalid task from server: {0}")]
    InvalidTask(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        WorkerError::Network(e.to_string())
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// What the task loop does after an attempt ends in error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Short sleep, then re-dispatch (backend fallback)
    RetrySoon,
    /// Long sleep, then fetch a fresh task
    Backoff,
    /// Stop the process
    Terminate,
}

impl WorkerError {
    pub fn disposition(&self) -> Disposition {
        match self {
            WorkerError::RetryWithFallback { .. } => Disposition::RetrySoon,
            WorkerError::ServerRejected(_) => Disposition::Terminate,
            _ => Disposition::Backoff,
        }
    }

    /// Whether a retry at the upload layer could change the outcome
    pub fn is_retryable_upload(&self) -> bool {
        !matches!(
            self,
            WorkerError::ServerRejected(_) | WorkerError::Json(_) | WorkerError::UploadFailed { .. }
        )
    }
}
