//! Write capture: local edits become outbox operations in the same transaction

use std::sync::Arc;

use serde_json::Value;

use crate::clock::{ClockValue, HybridClock};
use crate::db::{
    get_record, list_records, LocalRecord, RecordTxn, Store, WriteEvent, WriteHook, WriteOrigin,
};
use crate::deny_list::DenyList;
use crate::error::Result;
use crate::normalize::Normalizer;
use crate::outbox;
use crate::protocol::OpKind;

/// Store hook that enqueues every local write to a synchronized table
#[derive(Debug)]
pub struct WriteCapture {
    normalizer: Normalizer,
    deny_list: DenyList,
}

impl WriteCapture {
    pub const fn new(normalizer: Normalizer, deny_list: DenyList) -> Self {
        Self {
            normalizer,
            deny_list,
        }
    }
}

impl WriteHook for WriteCapture {
    fn after_write(&self, txn: &RecordTxn<'_>, event: &WriteEvent<'_>) -> Result<()> {
        if txn.origin() == WriteOrigin::Remote {
            return Ok(());
        }

        match *event {
            WriteEvent::Put {
                table,
                primary_key,
                payload,
                clock,
            } => {
                if self.deny_list.denies_key(table, primary_key) {
                    tracing::debug!(table, "Write to denied key kept local");
                    return Ok(());
                }
                let meta = self.normalizer.registry().get(table)?;
                let mut canonical = self
                    .normalizer
                    .normalize(table, &Value::Object(payload.clone()))?;
                canonical.retain_fields(|field| {
                    field == meta.primary_key() || !self.deny_list.denies_field(table, field)
                });
                let wire = self.normalizer.to_wire(&canonical)?;
                outbox::enqueue(
                    txn.connection(),
                    table,
                    primary_key,
                    OpKind::Put,
                    Some(&wire),
                    clock,
                )?;
            }
            WriteEvent::Delete {
                table,
                primary_key,
                clock,
            } => {
                if self.deny_list.denies_key(table, primary_key) {
                    return Ok(());
                }
                outbox::enqueue(
                    txn.connection(),
                    table,
                    primary_key,
                    OpKind::Delete,
                    None,
                    clock,
                )?;
            }
        }
        Ok(())
    }
}

/// Host-facing API for edits to synchronized tables
#[derive(Debug, Clone)]
pub struct LocalWriter {
    store: Arc<Store>,
    clock: Arc<HybridClock>,
    normalizer: Normalizer,
}

impl LocalWriter {
    pub const fn new(store: Arc<Store>, clock: Arc<HybridClock>, normalizer: Normalizer) -> Self {
        Self {
            store,
            clock,
            normalizer,
        }
    }

    /// Validate and store a record, returning the clock it was stamped with
    pub fn put(&self, table: &str, payload: &Value) -> Result<ClockValue> {
        self.transaction(|writer| writer.put(table, payload))
    }

    /// Delete a record, leaving a local tombstone; returns whether a row existed
    pub fn delete(&self, table: &str, primary_key: &str) -> Result<bool> {
        self.transaction(|writer| writer.delete(table, primary_key))
    }

    pub fn get(&self, table: &str, primary_key: &str) -> Result<Option<LocalRecord>> {
        let primary_key = self.normalizer.primary_key(table, primary_key)?;
        self.store
            .read(|conn| get_record(conn, table, &primary_key))
    }

    pub fn list(&self, table: &str, limit: usize) -> Result<Vec<LocalRecord>> {
        self.normalizer.registry().get(table)?;
        self.store.read(|conn| list_records(conn, table, limit))
    }

    /// Run several edits atomically; nothing is stored or queued unless all succeed
    pub fn transaction<T>(&self, f: impl FnOnce(&LocalTxn<'_, '_>) -> Result<T>) -> Result<T> {
        self.store.write(WriteOrigin::Local, |txn| {
            let writer = LocalTxn {
                txn,
                clock: &self.clock,
                normalizer: &self.normalizer,
            };
            f(&writer)
        })
    }
}

/// Edits inside one [`LocalWriter::transaction`]
pub struct LocalTxn<'t, 'c> {
    txn: &'t RecordTxn<'c>,
    clock: &'t HybridClock,
    normalizer: &'t Normalizer,
}

impl LocalTxn<'_, '_> {
    pub fn put(&self, table: &str, payload: &Value) -> Result<ClockValue> {
        let canonical = self.normalizer.normalize(table, payload)?;
        let clock = self.clock.now()?;
        let primary_key = canonical.primary_key().to_string();
        self.txn
            .put(table, &primary_key, &canonical.into_fields(), &clock)?;
        Ok(clock)
    }

    pub fn delete(&self, table: &str, primary_key: &str) -> Result<bool> {
        let primary_key = self.normalizer.primary_key(table, primary_key)?;
        let existed = self.txn.get(table, &primary_key)?.is_some();
        let clock = self.clock.now()?;
        self.txn.delete(table, &primary_key, &clock, None)?;
        Ok(existed)
    }

    pub fn get(&self, table: &str, primary_key: &str) -> Result<Option<LocalRecord>> {
        self.txn.get(table, primary_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, NodeId};
    use crate::error::Error;
    use crate::outbox::{list_operations, PendingOperation};
    use crate::registry::TableRegistry;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Harness {
        store: Arc<Store>,
        writer: LocalWriter,
    }

    fn harness(deny_list: DenyList) -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let normalizer = Normalizer::new(Arc::new(TableRegistry::builtin()));
        store
            .install_hook(Arc::new(WriteCapture::new(normalizer.clone(), deny_list)))
            .unwrap();
        let clock = Arc::new(HybridClock::with_source(
            NodeId::parse("device-a").unwrap(),
            Arc::new(ManualTimeSource::new(1_000)),
        ));
        let writer = LocalWriter::new(store.clone(), clock, normalizer);
        Harness { store, writer }
    }

    fn queued(store: &Store) -> Vec<PendingOperation> {
        store.read(|conn| list_operations(conn, 100)).unwrap()
    }

    #[test]
    fn local_put_is_enqueued_in_wire_form() {
        let h = harness(DenyList::default());
        h.writer
            .put(
                "threads",
                &json!({
                    "id": "t1",
                    "title": "Plans",
                    "project_id": "p1",
                    "created_at": 10,
                    "updated_at": 11,
                    "message_count": 4
                }),
            )
            .unwrap();

        let ops = queued(&h.store);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_kind, OpKind::Put);
        assert_eq!(
            Value::Object(ops[0].payload.clone().unwrap()),
            json!({
                "id": "t1",
                "title": "Plans",
                "projectId": "p1",
                "createdAt": 10,
                "updatedAt": 11
            })
        );

        let stored = h.writer.get("threads", "t1").unwrap().unwrap();
        assert_eq!(stored.payload["message_count"], json!(4));
        assert_eq!(stored.clock, ops[0].clock);
    }

    #[test]
    fn invalid_payload_rolls_back_write() {
        let h = harness(DenyList::default());
        let error = h
            .writer
            .put("threads", &json!({ "id": "t1", "title": 7 }))
            .unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        assert!(h.writer.get("threads", "t1").unwrap().is_none());
        assert!(queued(&h.store).is_empty());
    }

    #[test]
    fn denied_keys_stay_local_and_denied_fields_are_stripped() {
        let deny = DenyList::builtin().with_field("threads", "title");
        let h = harness(deny);
        h.writer
            .put("kv", &json!({ "key": "cache.models", "value": [1, 2, 3] }))
            .unwrap();
        h.writer
            .put(
                "threads",
                &json!({ "id": "t1", "title": "Secret", "created_at": 1, "updated_at": 1 }),
            )
            .unwrap();

        assert!(h.writer.get("kv", "cache.models").unwrap().is_some());
        let ops = queued(&h.store);
        assert_eq!(ops.len(), 1);
        let payload = ops[0].payload.as_ref().unwrap();
        assert_eq!(payload.get("id"), Some(&json!("t1")));
        assert!(payload.get("title").is_none());
        let stored = h.writer.get("threads", "t1").unwrap().unwrap();
        assert_eq!(stored.payload["title"], json!("Secret"));
    }

    #[test]
    fn delete_records_tombstone_and_enqueues() {
        let h = harness(DenyList::default());
        h.writer
            .put("kv", &json!({ "key": "theme", "value": "dark" }))
            .unwrap();
        assert!(h.writer.delete("kv", "theme").unwrap());
        assert!(!h.writer.delete("kv", "never-existed").unwrap());

        assert!(h.writer.get("kv", "theme").unwrap().is_none());
        let ops = queued(&h.store);
        let kinds: Vec<_> = ops.iter().map(|op| op.op_kind).collect();
        assert_eq!(kinds, vec![OpKind::Put, OpKind::Delete, OpKind::Delete]);
        assert!(ops[1].clock > ops[0].clock);

        let states = h
            .store
            .read(|conn| crate::db::fetch_key_states(conn, "kv", &["theme"]))
            .unwrap();
        assert_eq!(states["theme"].tombstone_clock.as_ref(), Some(&ops[1].clock));
    }

    #[test]
    fn transaction_is_all_or_nothing() {
        let h = harness(DenyList::default());
        let result = h.writer.transaction(|w| {
            w.put("kv", &json!({ "key": "a", "value": 1 }))?;
            w.put("kv", &json!({ "value": 2 }))
        });
        assert!(result.is_err());
        assert!(h.writer.get("kv", "a").unwrap().is_none());
        assert!(queued(&h.store).is_empty());
    }
}
