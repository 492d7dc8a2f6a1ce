//! Remote authority: change log, latest-state table, tombstones, and GC
//!
//! Every pushed operation is handled in its own transaction. Applying an
//! operation increments its scope's version counter and appends to the change
//! log atomically, so server versions within a scope are dense and ordered.

mod migrations;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use ebb_core::clock::MAX_CLOCK_DRIFT;
use ebb_core::normalize::Normalizer;
use ebb_core::protocol::{
    OpKind, PullRequest, PullResponse, PushOp, PushRequest, PushResponse, PushResult, SyncChange,
    MAX_PULL_LIMIT,
};
use ebb_core::registry::TableRegistry;
use ebb_core::{ClockValue, Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::{Map, Value};

/// Outcome of one garbage-collection pass over a scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub scopes: usize,
    pub log_entries: usize,
    pub tombstones: usize,
}

pub struct Authority {
    conn: Mutex<Connection>,
    normalizer: Normalizer,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority").finish_non_exhaustive()
    }
}

impl Authority {
    pub fn open(path: impl AsRef<Path>, registry: Arc<TableRegistry>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path.as_ref())?, registry)
    }

    pub fn open_in_memory(registry: Arc<TableRegistry>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, registry)
    }

    fn from_connection(mut conn: Connection, registry: Arc<TableRegistry>) -> Result<Self> {
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            normalizer: Normalizer::new(registry),
        })
    }

    /// Apply a batch; each operation succeeds or fails on its own
    pub fn push(&self, owner: &str, request: &PushRequest) -> Result<PushResponse> {
        let mut conn = self.lock()?;
        let scope_id = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = ensure_scope(&tx, owner, &request.scope)?;
            tx.commit()?;
            id
        };

        let mut results = Vec::with_capacity(request.ops.len());
        for op in &request.ops {
            let payload = match self.validate(op) {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::warn!(
                        table = %op.table_name,
                        op_id = %op.op_id,
                        %error,
                        "Rejected pushed operation"
                    );
                    results.push(PushResult::rejected(&op.op_id, error.to_string()));
                    continue;
                }
            };

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = apply_op(&tx, scope_id, &request.device_id, op, payload.as_ref())?;
            tx.commit()?;
            results.push(PushResult::accepted(&op.op_id, version));
        }

        Ok(PushResponse { results })
    }

    /// Latest state of every key changed after the cursor, oldest first
    pub fn pull(&self, owner: &str, request: &PullRequest, max_limit: u32) -> Result<PullResponse> {
        if request.cursor < 0 {
            return Err(Error::InvalidInput("cursor must not be negative".to_string()));
        }
        let limit = request.limit.clamp(1, max_limit.clamp(1, MAX_PULL_LIMIT));

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let scope_id = ensure_scope(&tx, owner, &request.scope)?;

        let tables = serde_json::to_string(&request.tables)?;
        let mut rows = {
            let mut stmt = tx.prepare(
                "SELECT table_name, primary_key, payload, clock, server_version, tombstone
                 FROM remote_records
                 WHERE scope_id = ?1
                   AND server_version > ?2
                   AND (json_array_length(?3) = 0
                        OR table_name IN (SELECT value FROM json_each(?3)))
                 ORDER BY server_version ASC
                 LIMIT ?4",
            )?;
            let collected = stmt.query_map(
                params![scope_id, request.cursor, tables, i64::from(limit) + 1],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
            collected
        };

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);

        let changes = rows
            .into_iter()
            .map(
                |(table_name, primary_key, payload, clock, server_version, tombstone)| {
                    Ok(SyncChange {
                        table_name,
                        primary_key,
                        payload: payload
                            .map(|raw| serde_json::from_str::<Map<String, Value>>(&raw))
                            .transpose()?,
                        clock: clock.parse()?,
                        server_version,
                        tombstone,
                    })
                },
            )
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = changes
            .last()
            .map_or(request.cursor, |change| change.server_version);

        tx.execute(
            "INSERT INTO device_cursors (scope_id, device_id, last_seen_version, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (scope_id, device_id) DO UPDATE SET
                 last_seen_version = MAX(last_seen_version, excluded.last_seen_version),
                 updated_at = excluded.updated_at",
            params![
                scope_id,
                request.device_id,
                request.cursor,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;

        Ok(PullResponse {
            changes,
            next_cursor,
            has_more,
        })
    }

    /// Drop log entries and tombstones every known device has moved past
    pub fn collect_garbage(&self) -> Result<GcReport> {
        let mut conn = self.lock()?;
        let scope_ids = {
            let mut stmt = conn.prepare("SELECT id FROM scopes ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let mut report = GcReport::default();
        for scope_id in scope_ids {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(watermark) = watermark(&tx, scope_id)? else {
                continue;
            };
            report.log_entries += tx.execute(
                "DELETE FROM change_log WHERE scope_id = ?1 AND server_version <= ?2",
                params![scope_id, watermark],
            )?;
            report.tombstones += tx.execute(
                "DELETE FROM remote_records
                 WHERE scope_id = ?1 AND tombstone = 1 AND server_version <= ?2",
                params![scope_id, watermark],
            )?;
            tx.commit()?;
            report.scopes += 1;
        }

        if report.log_entries > 0 || report.tombstones > 0 {
            tracing::info!(
                scopes = report.scopes,
                log_entries = report.log_entries,
                tombstones = report.tombstones,
                "Collected change log garbage"
            );
        }
        Ok(report)
    }

    /// Current version counter of a scope (0 if unknown)
    pub fn scope_version(&self, owner: &str, scope: &str) -> Result<i64> {
        let conn = self.lock()?;
        let version = conn
            .query_row(
                "SELECT version FROM scopes WHERE owner = ?1 AND name = ?2",
                params![owner, scope],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    /// Number of change-log entries retained for a scope
    pub fn log_len(&self, owner: &str, scope: &str) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM change_log c
             JOIN scopes s ON s.id = c.scope_id
             WHERE s.owner = ?1 AND s.name = ?2",
            params![owner, scope],
            |row| row.get(0),
        )?)
    }

    /// Canonical wire payload for a put, or `None` for a delete
    fn validate(&self, op: &PushOp) -> Result<Option<Map<String, Value>>> {
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        if op.clock.is_ahead_of(now, MAX_CLOCK_DRIFT) {
            return Err(Error::Clock(format!(
                "clock {} is more than {}s ahead of relay time",
                op.clock,
                MAX_CLOCK_DRIFT.as_secs()
            )));
        }
        self.normalizer.primary_key(&op.table_name, &op.primary_key)?;
        match op.op_kind {
            OpKind::Delete => Ok(None),
            OpKind::Put => {
                let raw = op
                    .payload
                    .clone()
                    .ok_or_else(|| Error::InvalidInput("put requires a payload".to_string()))?;
                let canonical = self.normalizer.from_wire(&op.table_name, &Value::Object(raw))?;
                if canonical.primary_key() != op.primary_key {
                    return Err(Error::InvalidInput(
                        "payload primary key does not match operation".to_string(),
                    ));
                }
                Ok(Some(self.normalizer.to_wire(&canonical)?))
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("relay connection mutex poisoned".to_string()))
    }
}

fn ensure_scope(tx: &Transaction<'_>, owner: &str, scope: &str) -> Result<i64> {
    tx.execute(
        "INSERT INTO scopes (owner, name, version, created_at) VALUES (?1, ?2, 0, ?3)
         ON CONFLICT (owner, name) DO NOTHING",
        params![owner, scope, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(tx.query_row(
        "SELECT id FROM scopes WHERE owner = ?1 AND name = ?2",
        params![owner, scope],
        |row| row.get(0),
    )?)
}

/// Apply one validated operation; returns the server version to report
fn apply_op(
    tx: &Transaction<'_>,
    scope_id: i64,
    device_id: &str,
    op: &PushOp,
    payload: Option<&Map<String, Value>>,
) -> Result<i64> {
    let replayed: Option<i64> = tx
        .query_row(
            "SELECT server_version FROM change_log WHERE scope_id = ?1 AND op_id = ?2",
            params![scope_id, op.op_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(version) = replayed {
        tracing::debug!(op_id = %op.op_id, version, "Replayed operation");
        return Ok(version);
    }

    let current: Option<(String, i64)> = tx
        .query_row(
            "SELECT clock, server_version FROM remote_records
             WHERE scope_id = ?1 AND table_name = ?2 AND primary_key = ?3",
            params![scope_id, op.table_name, op.primary_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((clock, version)) = current {
        let stored: ClockValue = clock.parse()?;
        if op.clock <= stored {
            tracing::debug!(
                table = %op.table_name,
                op_id = %op.op_id,
                "Stale operation accepted without applying"
            );
            return Ok(version);
        }
    }

    let version: i64 = tx.query_row(
        "UPDATE scopes SET version = version + 1 WHERE id = ?1 RETURNING version",
        [scope_id],
        |row| row.get(0),
    )?;
    let payload = payload.map(serde_json::to_string).transpose()?;
    let clock = op.clock.encode();

    tx.execute(
        "INSERT INTO change_log (scope_id, server_version, op_id, device_id, table_name,
                                 primary_key, op_kind, payload, clock, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            scope_id,
            version,
            op.op_id,
            device_id,
            op.table_name,
            op.primary_key,
            op.op_kind.as_str(),
            payload,
            clock,
            chrono::Utc::now().timestamp_millis()
        ],
    )?;
    tx.execute(
        "INSERT INTO remote_records (scope_id, table_name, primary_key, payload, clock,
                                     server_version, tombstone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (scope_id, table_name, primary_key) DO UPDATE SET
             payload = excluded.payload,
             clock = excluded.clock,
             server_version = excluded.server_version,
             tombstone = excluded.tombstone",
        params![
            scope_id,
            op.table_name,
            op.primary_key,
            payload,
            clock,
            version,
            op.op_kind == OpKind::Delete
        ],
    )?;
    Ok(version)
}

/// Lowest cursor among devices known to the scope
fn watermark(tx: &Transaction<'_>, scope_id: i64) -> Result<Option<i64>> {
    Ok(tx
        .query_row(
            "SELECT last_seen_version FROM device_cursors
             WHERE scope_id = ?1
             ORDER BY last_seen_version ASC
             LIMIT 1",
            [scope_id],
            |row| row.get(0),
        )
        .optional()?)
}
