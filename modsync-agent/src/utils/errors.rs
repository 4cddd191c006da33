//! Error taxonomy for the synchronization engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Integrity mismatch for {path}: {reason}")]
    IntegrityMismatch { path: String, reason: String },

    #[error("Insufficient disk space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Partial restore: {restored}/{total} files restored")]
    PartialRestoreFailure { restored: usize, total: usize },

    #[error("No backup snapshot found for {0}")]
    NoSnapshot(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether another attempt at the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RemoteUnavailable(_) | SyncError::Io(_) | SyncError::Http(_) => true,
            SyncError::IntegrityMismatch { .. } => true,
            SyncError::InvalidManifest(_)
            | SyncError::InsufficientSpace { .. }
            | SyncError::Cancelled
            | SyncError::PartialRestoreFailure { .. }
            | SyncError::NoSnapshot(_)
            | SyncError::Config(_)
            | SyncError::Serialization(_) => false,
        }
    }

    pub fn integrity(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::IntegrityMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
