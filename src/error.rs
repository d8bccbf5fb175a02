//! Error types for the transfer pipeline.

use thiserror::Error;

use crate::job::JobStatus;

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("connection to {host} failed: {detail}")]
    Connection { host: String, detail: String },

    #[error("size query failed: {0}")]
    SizeQuery(String),

    #[error("archive staging failed: {0}")]
    Staging(String),

    #[error("archive extraction failed: {0}")]
    Extraction(String),

    #[error("worker queue rejected job {0}")]
    Dispatch(i64),

    #[error("session to {0} is closed")]
    State(String),

    #[error("remote command failed with status {status}: {stderr}")]
    Command { status: i32, stderr: String },

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job status cannot move {from} -> {to}")]
    Transition { from: JobStatus, to: JobStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;
