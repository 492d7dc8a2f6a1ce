//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate(conn, 1, V1_RECORDS)?;
    }
    if version < 2 {
        migrate(conn, 2, V2_SYNC_BOOKKEEPING)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);
    Ok(version)
}

/// Version 1: record storage and deletion markers
const V1_RECORDS: &[&str] = &[
    // Schema version tracking
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // Live rows of every synchronized table, payload in local field names
    "CREATE TABLE IF NOT EXISTS records (
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        payload TEXT NOT NULL,
        clock TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (table_name, primary_key)
    ) WITHOUT ROWID",
    "CREATE INDEX IF NOT EXISTS idx_records_updated ON records(table_name, updated_at DESC)",
    // Deletion markers; clock guards against resurrection by stale puts
    "CREATE TABLE IF NOT EXISTS tombstones (
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        clock TEXT NOT NULL,
        server_version INTEGER,
        deleted_at INTEGER NOT NULL,
        PRIMARY KEY (table_name, primary_key)
    ) WITHOUT ROWID",
    // Installation metadata (node id)
    "CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// Version 2: outbox queue and per-scope cursors
const V2_SYNC_BOOKKEEPING: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS outbox (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        op_kind TEXT NOT NULL CHECK (op_kind IN ('put', 'delete')),
        payload TEXT,
        clock TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'in_flight', 'acknowledged')),
        next_attempt_at INTEGER NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(status, next_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_key ON outbox(table_name, primary_key)",
    "CREATE TABLE IF NOT EXISTS cursors (
        scope_id TEXT PRIMARY KEY,
        last_seen_version INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
];

fn migrate(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    // Dropping the transaction on error rolls the whole step back.
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}
