//! Wire types exchanged with the remote authority

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::ClockValue;
use crate::error::Error;

/// Upper bound on a single pull page, enforced on both ends
pub const MAX_PULL_LIMIT: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Put,
    Delete,
}

impl OpKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "put" => Ok(Self::Put),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown op kind `{other}`"))),
        }
    }
}

/// One operation in a push batch; payload uses wire field names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushOp {
    pub op_id: String,
    pub table_name: String,
    pub primary_key: String,
    pub op_kind: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    pub clock: ClockValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub scope: String,
    pub device_id: String,
    pub ops: Vec<PushOp>,
}

/// Outcome of one pushed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub op_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushResult {
    pub fn accepted(op_id: impl Into<String>, server_version: i64) -> Self {
        Self {
            op_id: op_id.into(),
            accepted: true,
            server_version: Some(server_version),
            error: None,
        }
    }

    pub fn rejected(op_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            accepted: false,
            server_version: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub scope: String,
    pub device_id: String,
    /// Highest server version this device has durably applied
    pub cursor: i64,
    pub limit: u32,
    /// Restrict to these tables; empty means all
    #[serde(default)]
    pub tables: Vec<String>,
}

/// A change as recorded by the remote authority; payload uses wire field names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    pub table_name: String,
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    pub clock: ClockValue,
    pub server_version: i64,
    #[serde(default)]
    pub tombstone: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<SyncChange>,
    pub next_cursor: i64,
    pub has_more: bool,
}
