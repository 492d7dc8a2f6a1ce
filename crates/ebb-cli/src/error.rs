use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] ebb_core::Error),
    #[error(transparent)]
    Config(#[from] ebb_core::config::ConfigError),
    #[error(transparent)]
    Transport(#[from] ebb_core::TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No payload provided; pass a JSON object or pipe one on stdin")]
    EmptyPayload,
    #[error("Payload must be a JSON object")]
    PayloadNotObject,
    #[error("Record not found: {table}/{key}")]
    RecordNotFound { table: String, key: String },
    #[error("Sync is not configured. Set EBB_RELAY_URL and EBB_API_TOKEN.")]
    SyncNotConfigured,
}
