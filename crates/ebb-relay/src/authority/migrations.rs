//! Relay schema migrations

use ebb_core::Result;
use rusqlite::{Connection, OptionalExtension};

pub const CURRENT_VERSION: i32 = 1;

pub fn run(conn: &mut Connection) -> Result<()> {
    if get_version(conn)? < 1 {
        migrate(conn, 1, V1_CHANGE_LOG)?;
    }
    Ok(())
}

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

/// Version 1: scopes, change log, latest state, device cursors
const V1_CHANGE_LOG: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // One version counter per (owner, scope)
    "CREATE TABLE IF NOT EXISTS scopes (
        id INTEGER PRIMARY KEY,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        UNIQUE (owner, name)
    )",
    // Append-only log of applied operations
    "CREATE TABLE IF NOT EXISTS change_log (
        scope_id INTEGER NOT NULL REFERENCES scopes(id),
        server_version INTEGER NOT NULL,
        op_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        op_kind TEXT NOT NULL CHECK (op_kind IN ('put', 'delete')),
        payload TEXT,
        clock TEXT NOT NULL,
        received_at INTEGER NOT NULL,
        PRIMARY KEY (scope_id, server_version),
        UNIQUE (scope_id, op_id)
    )",
    // Latest state per key; deletions kept as tombstones until collected
    "CREATE TABLE IF NOT EXISTS remote_records (
        scope_id INTEGER NOT NULL REFERENCES scopes(id),
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        payload TEXT,
        clock TEXT NOT NULL,
        server_version INTEGER NOT NULL,
        tombstone INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (scope_id, table_name, primary_key)
    ) WITHOUT ROWID",
    "CREATE INDEX IF NOT EXISTS idx_remote_records_version
        ON remote_records(scope_id, server_version)",
    "CREATE TABLE IF NOT EXISTS device_cursors (
        scope_id INTEGER NOT NULL REFERENCES scopes(id),
        device_id TEXT NOT NULL,
        last_seen_version INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (scope_id, device_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_device_cursors_version
        ON device_cursors(scope_id, last_seen_version)",
];

fn migrate(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    tx.commit()?;

    tracing::info!("Migrated relay database to version {version}");
    Ok(())
}
