//! Error types for ebb-core

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::normalize::ValidationError;
use crate::remote::TransportError;

/// Result type alias using ebb-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ebb-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// Local storage is full; the write that hit it was rolled back
    #[error("Local storage quota exceeded: {0}")]
    Capacity(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Payload failed its table schema
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Clock reading that cannot be represented or lies too far ahead
    #[error("Clock error: {0}")]
    Clock(String),

    /// Registry or engine misconfiguration detected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote authority could not be reached or refused the request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => Self::Capacity(error.to_string()),
            _ => Self::Sqlite(error),
        }
    }
}

impl Error {
    /// Whether a retry of the same operation may succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_transient(),
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
