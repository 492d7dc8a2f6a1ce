use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use ebb_core::db::{LocalRecord, Store};
use ebb_core::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use ebb_core::{EngineConfig, HttpRemote, Remote, SyncEngine, TransportError};
use serde_json::{Map, Value};

use crate::error::CliError;

const PREVIEW_CHARS: usize = 60;

/// Relay transport, or nothing when the host runs without one
pub enum CliRemote {
    Http(HttpRemote),
    Offline,
}

impl Remote for CliRemote {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        match self {
            Self::Http(remote) => remote.push(request).await,
            Self::Offline => Err(offline()),
        }
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        match self {
            Self::Http(remote) => remote.pull(request).await,
            Self::Offline => Err(offline()),
        }
    }
}

fn offline() -> TransportError {
    TransportError::Unavailable("no relay configured".to_string())
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("EBB_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ebb")
        .join("ebb.db")
}

pub fn load_config(scope: Option<&str>) -> Result<EngineConfig, CliError> {
    let mut config = EngineConfig::from_env()?;
    if let Some(scope) = scope {
        config.scope = scope.trim().to_string();
    }
    Ok(config)
}

/// Open the local store and engine; the relay is optional unless `require_remote`
pub fn open_engine(
    db_path: &Path,
    config: EngineConfig,
    require_remote: bool,
) -> Result<SyncEngine<CliRemote>, CliError> {
    let remote = match config.remote_credentials() {
        Ok((url, token)) => CliRemote::Http(HttpRemote::new(url, token)?),
        Err(_) if !require_remote => CliRemote::Offline,
        Err(_) => return Err(CliError::SyncNotConfigured),
    };

    let store = Arc::new(Store::open(db_path)?);
    Ok(SyncEngine::open(store, remote, config)?)
}

/// Parse a payload argument, falling back to stdin when it is absent or `-`
pub fn read_payload(argument: Option<&str>) -> Result<Map<String, Value>, CliError> {
    let raw = match argument {
        Some(value) if value != "-" => value.to_string(),
        _ => {
            let mut stdin = io::stdin();
            if stdin.is_terminal() {
                return Err(CliError::EmptyPayload);
            }
            let mut input = String::new();
            stdin.read_to_string(&mut input)?;
            input
        }
    };
    parse_payload(&raw)
}

pub fn parse_payload(raw: &str) -> Result<Map<String, Value>, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyPayload);
    }
    match serde_json::from_str::<Value>(trimmed)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(CliError::PayloadNotObject),
    }
}

pub fn format_record_lines(records: &[LocalRecord]) -> Vec<String> {
    records.iter().map(format_record_line).collect()
}

pub fn format_record_line(record: &LocalRecord) -> String {
    format!(
        "{}  {}  {}",
        record.primary_key,
        format_timestamp(record.updated_at),
        payload_preview(&record.payload)
    )
}

pub fn payload_preview(payload: &Value) -> String {
    let compact = payload.to_string();
    if compact.chars().count() <= PREVIEW_CHARS {
        return compact;
    }
    let mut preview: String = compact.chars().take(PREVIEW_CHARS - 3).collect();
    preview.push_str("...");
    preview
}

pub fn format_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis).map_or_else(
        || millis.to_string(),
        |at| at.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}
