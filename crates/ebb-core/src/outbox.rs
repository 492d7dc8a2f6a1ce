//! Durable queue of local operations awaiting acknowledgement
//!
//! Rows are written by write capture inside the host's transaction and drained
//! by [`OutboxManager::flush`]. A row is deleted only after the remote authority
//! acknowledges it, so delivery is at-least-once; the remote side deduplicates
//! by operation id.

#![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::breaker::BreakerRegistry;
use crate::clock::ClockValue;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::protocol::{OpKind, PushOp, PushRequest, PushResult};
use crate::remote::{Remote, TransportError};
use crate::util::{backoff_delay, compact_text, unix_millis_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    InFlight,
    Acknowledged,
}

impl OpStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Acknowledged => "acknowledged",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "acknowledged" => Ok(Self::Acknowledged),
            other => Err(Error::Database(format!("unknown outbox status `{other}`"))),
        }
    }
}

/// A queued local operation; payload uses wire field names
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub id: String,
    pub table_name: String,
    pub primary_key: String,
    pub op_kind: OpKind,
    pub payload: Option<Map<String, Value>>,
    pub clock: ClockValue,
    pub status: OpStatus,
    pub next_attempt_at: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl PendingOperation {
    fn to_push_op(&self) -> PushOp {
        PushOp {
            op_id: self.id.clone(),
            table_name: self.table_name.clone(),
            primary_key: self.primary_key.clone(),
            op_kind: self.op_kind,
            payload: self.payload.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Queue one operation; runs inside the caller's transaction
pub fn enqueue(
    conn: &Connection,
    table: &str,
    primary_key: &str,
    op_kind: OpKind,
    payload: Option<&Map<String, Value>>,
    clock: &ClockValue,
) -> Result<String> {
    let id = uuid::Uuid::now_v7().to_string();
    let now = unix_millis_now();
    let payload = payload.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO outbox (id, table_name, primary_key, op_kind, payload, clock, status,
                             next_attempt_at, attempt_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, 0, ?7)",
        params![id, table, primary_key, op_kind.as_str(), payload, clock.encode(), now],
    )?;
    Ok(id)
}

/// Number of operations not yet acknowledged
pub fn queue_len(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE status IN ('pending', 'in_flight')",
        [],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Queued operations in clock order
pub fn list_operations(conn: &Connection, limit: usize) -> Result<Vec<PendingOperation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM outbox ORDER BY clock ASC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit as i64], raw_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(parse_operation).collect()
}

/// Return rows abandoned mid-flush by a previous process to `pending`
pub fn recover_in_flight(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE outbox SET status = 'pending' WHERE status = 'in_flight'",
        [],
    )?)
}

/// Delete pending rows superseded by a newer pending row for the same key
pub fn coalesce(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM outbox
         WHERE status = 'pending'
           AND EXISTS (
               SELECT 1 FROM outbox AS newer
               WHERE newer.table_name = outbox.table_name
                 AND newer.primary_key = outbox.primary_key
                 AND newer.status = 'pending'
                 AND newer.clock > outbox.clock
           )",
        [],
    )?)
}

/// Drop pending rows for a key that a newer applied remote change has overtaken
pub fn discard_superseded(
    conn: &Connection,
    table: &str,
    primary_key: &str,
    clock: &ClockValue,
) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM outbox
         WHERE table_name = ?1 AND primary_key = ?2 AND status = 'pending' AND clock < ?3",
        params![table, primary_key, clock.encode()],
    )?)
}

/// Result of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Operations transmitted in this flush
    pub sent: usize,
    pub acknowledged: usize,
    pub rejected: usize,
    /// Superseded rows removed before sending
    pub coalesced: usize,
    /// Rows still queued afterwards
    pub remaining: u64,
    /// The scope's breaker refused the attempt
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxSettings {
    pub batch_size: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(300),
        }
    }
}

/// Drains the outbox for one scope
pub struct OutboxManager<R> {
    store: Arc<Store>,
    remote: Arc<R>,
    breakers: Arc<BreakerRegistry>,
    scope: String,
    device_id: String,
    settings: OutboxSettings,
    flush_lock: Mutex<()>,
}

impl<R: Remote> OutboxManager<R> {
    /// Build the manager, resetting any rows left in flight by a crash
    pub fn open(
        store: Arc<Store>,
        remote: Arc<R>,
        breakers: Arc<BreakerRegistry>,
        scope: impl Into<String>,
        device_id: impl Into<String>,
        settings: OutboxSettings,
    ) -> Result<Self> {
        let recovered = store.transaction(recover_in_flight)?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered in-flight outbox operations");
        }
        Ok(Self {
            store,
            remote,
            breakers,
            scope: scope.into(),
            device_id: device_id.into(),
            settings,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn queue_len(&self) -> Result<u64> {
        self.store.read(queue_len)
    }

    pub fn operations(&self, limit: usize) -> Result<Vec<PendingOperation>> {
        self.store.read(|conn| list_operations(conn, limit))
    }

    /// Send one batch of due operations
    pub async fn flush(&self) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;

        let now = unix_millis_now();
        let (coalesced, batch) = self.store.transaction(|conn| {
            let coalesced = coalesce(conn)?;
            let batch = claim_due(conn, now, self.settings.batch_size)?;
            Ok((coalesced, batch))
        })?;
        if coalesced > 0 {
            tracing::debug!(coalesced, "Coalesced superseded outbox operations");
        }

        let mut report = FlushReport {
            coalesced,
            ..FlushReport::default()
        };
        if batch.is_empty() {
            report.remaining = self.queue_len()?;
            return Ok(report);
        }

        if !self.breakers.allow(&self.scope) {
            self.store.transaction(|conn| release(conn, &batch))?;
            report.paused = true;
            report.remaining = self.queue_len()?;
            tracing::debug!(scope = %self.scope, "Flush paused by open circuit");
            return Ok(report);
        }

        let request = PushRequest {
            scope: self.scope.clone(),
            device_id: self.device_id.clone(),
            ops: batch.iter().map(PendingOperation::to_push_op).collect(),
        };
        report.sent = batch.len();

        let response = match self.remote.push(request).await {
            Ok(response) => response,
            Err(error) => {
                self.breakers.record_failure(&self.scope);
                let message = error.to_string();
                let floor = match &error {
                    TransportError::RateLimited { retry_after_secs } => {
                        Duration::from_secs(*retry_after_secs)
                    }
                    _ => Duration::ZERO,
                };
                self.store
                    .transaction(|conn| self.retry_later(conn, &batch, &message, floor))?;
                tracing::warn!(scope = %self.scope, error = %message, "Push failed; operations requeued");
                return Err(error.into());
            }
        };
        self.breakers.record_success(&self.scope);

        let (acknowledged, rejected) = self
            .store
            .transaction(|conn| self.settle(conn, &batch, &response.results))?;
        report.acknowledged = acknowledged;
        report.rejected = rejected;
        report.remaining = self.queue_len()?;

        tracing::debug!(
            sent = report.sent,
            acknowledged,
            rejected,
            remaining = report.remaining,
            "Flushed outbox"
        );
        Ok(report)
    }

    fn settle(
        &self,
        conn: &Connection,
        batch: &[PendingOperation],
        results: &[PushResult],
    ) -> Result<(usize, usize)> {
        let mut acknowledged = 0;
        let mut rejected = 0;

        for op in batch {
            match results.iter().find(|result| result.op_id == op.id) {
                Some(result) if result.accepted => {
                    conn.execute("DELETE FROM outbox WHERE id = ?1", [&op.id])?;
                    if let (OpKind::Delete, Some(version)) = (op.op_kind, result.server_version) {
                        conn.execute(
                            "UPDATE tombstones SET server_version = ?4
                             WHERE table_name = ?1 AND primary_key = ?2 AND clock = ?3",
                            params![op.table_name, op.primary_key, op.clock.encode(), version],
                        )?;
                    }
                    acknowledged += 1;
                }
                Some(result) => {
                    let reason = result.error.as_deref().unwrap_or("rejected without reason");
                    tracing::warn!(
                        op_id = %op.id,
                        table = %op.table_name,
                        error = %reason,
                        "Remote rejected operation"
                    );
                    self.retry_later(conn, std::slice::from_ref(op), reason, Duration::ZERO)?;
                    rejected += 1;
                }
                None => {
                    tracing::warn!(op_id = %op.id, "Push response omitted operation");
                    self.retry_later(
                        conn,
                        std::slice::from_ref(op),
                        "missing from push response",
                        Duration::ZERO,
                    )?;
                }
            }
        }
        Ok((acknowledged, rejected))
    }

    /// Requeue with back-off, never sooner than `floor` (the remote's `Retry-After`)
    fn retry_later(
        &self,
        conn: &Connection,
        ops: &[PendingOperation],
        error: &str,
        floor: Duration,
    ) -> Result<()> {
        let now = unix_millis_now();
        let error = compact_text(error);
        for op in ops {
            let attempts = op.attempt_count.saturating_add(1);
            let delay = backoff_delay(self.settings.retry_base, self.settings.retry_max, attempts)
                .max(floor);
            conn.execute(
                "UPDATE outbox
                 SET status = 'pending', attempt_count = ?2, next_attempt_at = ?3, last_error = ?4
                 WHERE id = ?1",
                params![
                    op.id,
                    attempts,
                    now.saturating_add(delay.as_millis() as i64),
                    error
                ],
            )?;
        }
        Ok(())
    }
}

const OPERATION_COLUMNS: &str = "id, table_name, primary_key, op_kind, payload, clock, status,
     next_attempt_at, attempt_count, last_error, created_at";

fn claim_due(conn: &Connection, now: i64, limit: usize) -> Result<Vec<PendingOperation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM outbox
         WHERE status = 'pending' AND next_attempt_at <= ?1
         ORDER BY clock ASC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![now, limit as i64], raw_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut batch = rows
        .into_iter()
        .map(parse_operation)
        .collect::<Result<Vec<_>>>()?;

    for op in &mut batch {
        conn.execute(
            "UPDATE outbox SET status = 'in_flight' WHERE id = ?1",
            [&op.id],
        )?;
        op.status = OpStatus::InFlight;
    }
    Ok(batch)
}

fn release(conn: &Connection, batch: &[PendingOperation]) -> Result<()> {
    for op in batch {
        conn.execute(
            "UPDATE outbox SET status = 'pending' WHERE id = ?1 AND status = 'in_flight'",
            [&op.id],
        )?;
    }
    Ok(())
}

type RawOperation = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    u32,
    Option<String>,
    i64,
);

fn raw_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOperation> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn parse_operation(raw: RawOperation) -> Result<PendingOperation> {
    let (
        id,
        table_name,
        primary_key,
        op_kind,
        payload,
        clock,
        status,
        next_attempt_at,
        attempt_count,
        last_error,
        created_at,
    ) = raw;
    Ok(PendingOperation {
        id,
        table_name,
        primary_key,
        op_kind: op_kind.parse()?,
        payload: payload.map(|raw| serde_json::from_str(&raw)).transpose()?,
        clock: clock.parse()?,
        status: status.parse()?,
        next_attempt_at,
        attempt_count,
        last_error,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerSettings;
    use crate::clock::NodeId;
    use crate::protocol::{PullRequest, PullResponse, PushResponse};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ScriptedRemote {
        pushes: StdMutex<Vec<PushRequest>>,
        fail: StdMutex<Option<TransportError>>,
        reject: StdMutex<Vec<String>>,
    }

    impl Remote for ScriptedRemote {
        async fn push(&self, request: PushRequest) -> std::result::Result<PushResponse, TransportError> {
            if let Some(error) = self.fail.lock().unwrap().clone() {
                return Err(error);
            }
            let reject = self.reject.lock().unwrap().clone();
            let results = request
                .ops
                .iter()
                .enumerate()
                .map(|(index, op)| {
                    if reject.contains(&op.primary_key) {
                        PushResult::rejected(&op.op_id, "bad payload")
                    } else {
                        PushResult::accepted(&op.op_id, index as i64 + 1)
                    }
                })
                .collect();
            self.pushes.lock().unwrap().push(request);
            Ok(PushResponse { results })
        }

        async fn pull(&self, _request: PullRequest) -> std::result::Result<PullResponse, TransportError> {
            Ok(PullResponse {
                changes: Vec::new(),
                next_cursor: 0,
                has_more: false,
            })
        }
    }

    fn clock(physical: u64) -> ClockValue {
        ClockValue::new(physical, 0, NodeId::parse("device-a").unwrap())
    }

    fn payload(value: i64) -> Map<String, Value> {
        json!({ "key": "k", "value": value }).as_object().cloned().unwrap()
    }

    fn manager(store: &Arc<Store>, remote: &Arc<ScriptedRemote>) -> OutboxManager<ScriptedRemote> {
        OutboxManager::open(
            store.clone(),
            remote.clone(),
            Arc::new(BreakerRegistry::new(BreakerSettings::default())),
            "scope-1",
            "device-a",
            OutboxSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn three_puts_to_one_key_send_one_op() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|conn| {
                for tick in 1..=3 {
                    enqueue(conn, "kv", "k", OpKind::Put, Some(&payload(tick)), &clock(tick as u64))?;
                }
                Ok(())
            })
            .unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        let report = manager(&store, &remote).flush().await.unwrap();

        assert_eq!(report.coalesced, 2);
        assert_eq!(report.sent, 1);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.remaining, 0);
        let pushes = remote.pushes.lock().unwrap();
        assert_eq!(pushes[0].ops.len(), 1);
        assert_eq!(pushes[0].ops[0].clock, clock(3));
        assert_eq!(pushes[0].ops[0].payload.as_ref().unwrap()["value"], json!(3));
    }

    #[tokio::test]
    async fn transport_failure_requeues_with_backoff() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|conn| enqueue(conn, "kv", "k", OpKind::Put, Some(&payload(1)), &clock(1)))
            .unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        *remote.fail.lock().unwrap() = Some(TransportError::Unavailable("offline".to_string()));
        let outbox = manager(&store, &remote);

        assert!(outbox.flush().await.is_err());
        let ops = outbox.operations(10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, OpStatus::Pending);
        assert_eq!(ops[0].attempt_count, 1);
        assert!(ops[0].next_attempt_at > ops[0].created_at);
        assert!(ops[0].last_error.as_deref().unwrap().contains("offline"));

        // Not yet due: nothing is sent.
        *remote.fail.lock().unwrap() = None;
        let report = outbox.flush().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn rate_limited_push_waits_at_least_retry_after() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|conn| enqueue(conn, "kv", "k", OpKind::Put, Some(&payload(1)), &clock(1)))
            .unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        *remote.fail.lock().unwrap() = Some(TransportError::RateLimited {
            retry_after_secs: 30,
        });
        let outbox = manager(&store, &remote);
        let before = unix_millis_now();

        assert!(outbox.flush().await.is_err());
        let ops = outbox.operations(10).unwrap();
        assert_eq!(ops[0].attempt_count, 1);
        assert!(ops[0].next_attempt_at >= before + 30_000);
    }

    #[tokio::test]
    async fn rejected_op_stays_queued_while_others_are_acknowledged() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|conn| {
                enqueue(conn, "kv", "good", OpKind::Put, Some(&payload(1)), &clock(1))?;
                enqueue(conn, "kv", "bad", OpKind::Put, Some(&payload(2)), &clock(2))?;
                Ok(())
            })
            .unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        remote.reject.lock().unwrap().push("bad".to_string());
        let outbox = manager(&store, &remote);

        let report = outbox.flush().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.rejected, 1);
        let ops = outbox.operations(10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].primary_key, "bad");
        assert_eq!(ops[0].last_error.as_deref(), Some("bad payload"));
    }

    #[test]
    fn open_recovers_in_flight_rows() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .transaction(|conn| {
                enqueue(conn, "kv", "k", OpKind::Delete, None, &clock(1))?;
                claim_due(conn, i64::MAX, 10)?;
                Ok(())
            })
            .unwrap();
        let before = store.read(|conn| list_operations(conn, 10)).unwrap();
        assert_eq!(before[0].status, OpStatus::InFlight);

        let remote = Arc::new(ScriptedRemote::default());
        let outbox = manager(&store, &remote);
        let after = outbox.operations(10).unwrap();
        assert_eq!(after[0].status, OpStatus::Pending);
        assert_eq!(outbox.queue_len().unwrap(), 1);
    }

    #[test]
    fn coalescing_skips_in_flight_rows() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|conn| {
                enqueue(conn, "kv", "k", OpKind::Put, Some(&payload(1)), &clock(1))?;
                claim_due(conn, i64::MAX, 10)?;
                enqueue(conn, "kv", "k", OpKind::Put, Some(&payload(2)), &clock(2))?;
                enqueue(conn, "kv", "k", OpKind::Delete, None, &clock(3))?;
                assert_eq!(coalesce(conn)?, 1);
                Ok(())
            })
            .unwrap();

        let ops = store.read(|conn| list_operations(conn, 10)).unwrap();
        let kinds: Vec<_> = ops.iter().map(|op| (op.status, op.op_kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (OpStatus::InFlight, OpKind::Put),
                (OpStatus::Pending, OpKind::Delete)
            ]
        );
    }
}
