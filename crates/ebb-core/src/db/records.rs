//! Record storage inside a store transaction
//!
//! All writes to synchronized tables go through [`RecordTxn`], which notifies
//! the installed [`WriteHook`] after each write. The hook runs in the same
//! transaction, so a failing hook aborts the write.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::clock::ClockValue;
use crate::error::{Error, Result};

/// Where a write came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Host application edit; captured into the outbox
    Local,
    /// Applied from a pulled remote change; never re-captured
    Remote,
}

/// A record write as seen by the hook
#[derive(Debug, Clone, Copy)]
pub enum WriteEvent<'a> {
    Put {
        table: &'a str,
        primary_key: &'a str,
        payload: &'a Map<String, Value>,
        clock: &'a ClockValue,
    },
    Delete {
        table: &'a str,
        primary_key: &'a str,
        clock: &'a ClockValue,
    },
}

/// Observer of record writes, invoked inside the writing transaction
pub trait WriteHook: Send + Sync {
    fn after_write(&self, txn: &RecordTxn<'_>, event: &WriteEvent<'_>) -> Result<()>;
}

/// A live local row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalRecord {
    pub table_name: String,
    pub primary_key: String,
    pub payload: Value,
    pub clock: ClockValue,
    pub updated_at: i64,
}

/// What the store knows about one key, for conflict comparison
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyState {
    pub row_clock: Option<ClockValue>,
    pub payload: Option<Map<String, Value>>,
    pub tombstone_clock: Option<ClockValue>,
    pub tombstone_version: Option<i64>,
}

impl KeyState {
    /// Highest clock that a new change must beat; `None` means anything wins
    pub fn effective_clock(&self) -> Option<&ClockValue> {
        match (&self.row_clock, &self.tombstone_clock) {
            (Some(row), Some(tombstone)) => Some(row.max(tombstone)),
            (row, tombstone) => row.as_ref().or(tombstone.as_ref()),
        }
    }
}

/// Transaction-scoped handle for record reads and hooked writes
pub struct RecordTxn<'a> {
    conn: &'a Connection,
    origin: WriteOrigin,
    hook: Option<&'a Arc<dyn WriteHook>>,
}

impl<'a> RecordTxn<'a> {
    pub(crate) const fn new(
        conn: &'a Connection,
        origin: WriteOrigin,
        hook: Option<&'a Arc<dyn WriteHook>>,
    ) -> Self {
        Self { conn, origin, hook }
    }

    pub const fn origin(&self) -> WriteOrigin {
        self.origin
    }

    pub const fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn get(&self, table: &str, primary_key: &str) -> Result<Option<LocalRecord>> {
        get_record(self.conn, table, primary_key)
    }

    /// Insert or replace a row; clears any deletion marker for the key
    pub fn put(
        &self,
        table: &str,
        primary_key: &str,
        payload: &Map<String, Value>,
        clock: &ClockValue,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO records (table_name, primary_key, payload, clock, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (table_name, primary_key) DO UPDATE SET
                 payload = excluded.payload,
                 clock = excluded.clock,
                 updated_at = excluded.updated_at",
            params![
                table,
                primary_key,
                serde_json::to_string(payload)?,
                clock.encode(),
                now
            ],
        )?;
        self.conn.execute(
            "DELETE FROM tombstones WHERE table_name = ?1 AND primary_key = ?2",
            params![table, primary_key],
        )?;

        self.notify(&WriteEvent::Put {
            table,
            primary_key,
            payload,
            clock,
        })
    }

    /// Remove a row and leave a deletion marker carrying `clock`
    pub fn delete(
        &self,
        table: &str,
        primary_key: &str,
        clock: &ClockValue,
        server_version: Option<i64>,
    ) -> Result<()> {
        self.conn.execute(
            "DELETE FROM records WHERE table_name = ?1 AND primary_key = ?2",
            params![table, primary_key],
        )?;
        self.conn.execute(
            "INSERT INTO tombstones (table_name, primary_key, clock, server_version, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (table_name, primary_key) DO UPDATE SET
                 clock = excluded.clock,
                 server_version = excluded.server_version,
                 deleted_at = excluded.deleted_at",
            params![
                table,
                primary_key,
                clock.encode(),
                server_version,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;

        self.notify(&WriteEvent::Delete {
            table,
            primary_key,
            clock,
        })
    }

    /// Record the server version of a deletion marker already in place
    pub fn confirm_tombstone(
        &self,
        table: &str,
        primary_key: &str,
        clock: &ClockValue,
        server_version: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tombstones SET server_version = ?4
             WHERE table_name = ?1 AND primary_key = ?2 AND clock = ?3",
            params![table, primary_key, clock.encode(), server_version],
        )?;
        Ok(())
    }

    fn notify(&self, event: &WriteEvent<'_>) -> Result<()> {
        match self.hook {
            Some(hook) => hook.after_write(self, event),
            None => Ok(()),
        }
    }
}

pub fn get_record(conn: &Connection, table: &str, primary_key: &str) -> Result<Option<LocalRecord>> {
    let row = conn
        .query_row(
            "SELECT table_name, primary_key, payload, clock, updated_at
             FROM records WHERE table_name = ?1 AND primary_key = ?2",
            params![table, primary_key],
            raw_record,
        )
        .optional()?;
    row.map(parse_record).transpose()
}

/// Rows of one table, most recently written first
pub fn list_records(conn: &Connection, table: &str, limit: usize) -> Result<Vec<LocalRecord>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, primary_key, payload, clock, updated_at
         FROM records
         WHERE table_name = ?1
         ORDER BY updated_at DESC, primary_key ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![table, limit as i64], raw_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(parse_record).collect()
}

/// Current state for many keys of one table in a single query
pub fn fetch_key_states(
    conn: &Connection,
    table: &str,
    keys: &[&str],
) -> Result<HashMap<String, KeyState>> {
    let keys_json = serde_json::to_string(keys)?;
    let mut stmt = conn.prepare(
        "SELECT k.value, r.clock, r.payload, t.clock, t.server_version
         FROM json_each(?2) AS k
         LEFT JOIN records r ON r.table_name = ?1 AND r.primary_key = k.value
         LEFT JOIN tombstones t ON t.table_name = ?1 AND t.primary_key = k.value",
    )?;
    let rows = stmt
        .query_map(params![table, keys_json], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut states = HashMap::with_capacity(rows.len());
    for (key, row_clock, payload, tombstone_clock, tombstone_version) in rows {
        let payload = payload
            .map(|raw| serde_json::from_str::<Map<String, Value>>(&raw))
            .transpose()?;
        states.insert(
            key,
            KeyState {
                row_clock: row_clock.map(|clock| clock.parse()).transpose()?,
                payload,
                tombstone_clock: tombstone_clock.map(|clock| clock.parse()).transpose()?,
                tombstone_version,
            },
        );
    }
    Ok(states)
}

/// Drop deletion markers every replica has moved past
pub fn prune_tombstones(conn: &Connection, through_version: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM tombstones WHERE server_version IS NOT NULL AND server_version <= ?1",
        [through_version],
    )?)
}

type RawRecord = (String, String, String, String, i64);

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn parse_record(raw: RawRecord) -> Result<LocalRecord> {
    let (table_name, primary_key, payload, clock, updated_at) = raw;
    let payload: Value = serde_json::from_str(&payload)?;
    if !payload.is_object() {
        return Err(Error::Database(format!(
            "stored payload for {table_name}/{primary_key} is not an object"
        )));
    }
    Ok(LocalRecord {
        table_name,
        primary_key,
        payload,
        clock: clock.parse()?,
        updated_at,
    })
}
