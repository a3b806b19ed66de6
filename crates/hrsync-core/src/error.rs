//! Error types for hrsync-core

use thiserror::Error;

use crate::remote::TransportError;

/// Result type alias using hrsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hrsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted for this component (e.g. queueing a GET)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No usable credential; the user must re-authenticate
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// Remote API failure
    #[error("Remote error: {0}")]
    Transport(#[from] TransportError),

    /// gzip encode/decode failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// A pull/push cycle is already running
    #[error("A sync cycle is already in progress")]
    SyncInProgress,
}

impl Error {
    /// Whether the failure is worth retrying on a later cycle.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_retryable(),
            Self::SyncInProgress => true,
            _ => false,
        }
    }
}
