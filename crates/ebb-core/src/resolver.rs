//! Last-writer-wins application of remote changes
//!
//! A change is applied only when its clock is strictly greater than both the
//! local row's clock and any local tombstone's clock. Derived and deny-listed
//! fields are local: they are never compared and survive an overwrite.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::clock::{ClockValue, HybridClock};
use crate::db::{fetch_key_states, KeyState, RecordTxn, Store, WriteOrigin};
use crate::deny_list::DenyList;
use crate::error::Result;
use crate::normalize::Normalizer;
use crate::outbox::discard_superseded;
use crate::protocol::SyncChange;

/// Outcome of applying one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub applied: usize,
    pub deleted: usize,
    /// Changes that lost to local state
    pub stale: usize,
    /// Changes that failed validation or carried an out-of-range clock
    pub rejected: usize,
    /// Queued local operations dropped because an applied change overtook them
    pub superseded: usize,
    pub max_clock: Option<ClockValue>,
    pub max_server_version: Option<i64>,
}

impl ApplyResult {
    pub fn merge(&mut self, other: Self) {
        self.applied += other.applied;
        self.deleted += other.deleted;
        self.stale += other.stale;
        self.rejected += other.rejected;
        self.superseded += other.superseded;
        self.max_clock = self.max_clock.take().max(other.max_clock);
        self.max_server_version = self.max_server_version.max(other.max_server_version);
    }

    fn observe_clock(&mut self, clock: &ClockValue) {
        if self.max_clock.as_ref().is_none_or(|max| clock > max) {
            self.max_clock = Some(clock.clone());
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    normalizer: Normalizer,
    deny_list: DenyList,
    clock: Arc<HybridClock>,
}

impl ConflictResolver {
    pub const fn new(normalizer: Normalizer, deny_list: DenyList, clock: Arc<HybridClock>) -> Self {
        Self {
            normalizer,
            deny_list,
            clock,
        }
    }

    /// Apply a batch in its own remote-origin transaction
    pub fn apply_changes(&self, store: &Store, changes: &[SyncChange]) -> Result<ApplyResult> {
        store.write(WriteOrigin::Remote, |txn| self.apply_in(txn, changes))
    }

    /// Apply a batch inside a caller's remote-origin transaction
    pub fn apply_in(&self, txn: &RecordTxn<'_>, changes: &[SyncChange]) -> Result<ApplyResult> {
        let mut result = ApplyResult::default();

        let mut by_table: BTreeMap<&str, Vec<&SyncChange>> = BTreeMap::new();
        for change in changes {
            result.max_server_version = result.max_server_version.max(Some(change.server_version));
            if !self.clock.admits(&change.clock) {
                tracing::warn!(
                    table = %change.table_name,
                    clock = %change.clock,
                    "Rejected remote change with clock far ahead of local time"
                );
                result.rejected += 1;
                continue;
            }
            result.observe_clock(&change.clock);
            by_table
                .entry(change.table_name.as_str())
                .or_default()
                .push(change);
        }

        for (table, changes) in by_table {
            if !self.normalizer.registry().contains(table) {
                tracing::warn!(table, count = changes.len(), "Dropped changes for unknown table");
                result.rejected += changes.len();
                continue;
            }

            let mut keys: Vec<&str> = changes.iter().map(|c| c.primary_key.as_str()).collect();
            keys.sort_unstable();
            keys.dedup();
            let mut states = fetch_key_states(txn.connection(), table, &keys)?;

            for change in changes {
                let state = states.entry(change.primary_key.clone()).or_default();
                self.apply_one(txn, table, change, state, &mut result)?;
            }
        }

        if let Some(max) = &result.max_clock {
            self.clock.observe(max)?;
        }
        tracing::debug!(
            applied = result.applied,
            deleted = result.deleted,
            stale = result.stale,
            rejected = result.rejected,
            superseded = result.superseded,
            "Applied remote changes"
        );
        Ok(result)
    }

    fn apply_one(
        &self,
        txn: &RecordTxn<'_>,
        table: &str,
        change: &SyncChange,
        state: &mut KeyState,
        result: &mut ApplyResult,
    ) -> Result<()> {
        let wins = state
            .effective_clock()
            .is_none_or(|local| change.clock > *local);

        if !wins {
            if change.tombstone && state.tombstone_clock.as_ref() == Some(&change.clock) {
                // Our own delete echoed back: record its server version for pruning.
                txn.confirm_tombstone(table, &change.primary_key, &change.clock, change.server_version)?;
                state.tombstone_version = Some(change.server_version);
            }
            result.stale += 1;
            return Ok(());
        }

        if change.tombstone {
            result.superseded +=
                discard_superseded(txn.connection(), table, &change.primary_key, &change.clock)?;
            txn.delete(
                table,
                &change.primary_key,
                &change.clock,
                Some(change.server_version),
            )?;
            *state = KeyState {
                row_clock: None,
                payload: None,
                tombstone_clock: Some(change.clock.clone()),
                tombstone_version: Some(change.server_version),
            };
            result.deleted += 1;
            return Ok(());
        }

        let Some(payload) = &change.payload else {
            tracing::warn!(table, "Rejected remote put without payload");
            result.rejected += 1;
            return Ok(());
        };
        let canonical = match self
            .normalizer
            .from_wire(table, &Value::Object(payload.clone()))
        {
            Ok(canonical) if canonical.primary_key() == change.primary_key => canonical,
            Ok(_) => {
                tracing::warn!(table, "Rejected remote put with mismatched primary key");
                result.rejected += 1;
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(table, %error, "Rejected invalid remote payload");
                result.rejected += 1;
                return Ok(());
            }
        };

        let mut fields = canonical.into_fields();
        let meta = self.normalizer.registry().get(table)?;
        let local_only = meta
            .fields()
            .map(|(name, _)| name)
            .filter(|name| self.deny_list.denies_field(table, name));
        for field in meta.derived_fields().chain(local_only) {
            match state.payload.as_ref().and_then(|local| local.get(field)) {
                Some(value) => {
                    fields.insert(field.to_string(), value.clone());
                }
                None if self.deny_list.denies_field(table, field) => {
                    fields.remove(field);
                }
                None => {}
            }
        }

        result.superseded +=
            discard_superseded(txn.connection(), table, &change.primary_key, &change.clock)?;
        txn.put(table, &change.primary_key, &fields, &change.clock)?;
        *state = KeyState {
            row_clock: Some(change.clock.clone()),
            payload: Some(fields),
            tombstone_clock: None,
            tombstone_version: None,
        };
        result.applied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{LocalWriter, WriteCapture};
    use crate::clock::{ManualTimeSource, NodeId};
    use crate::db::get_record;
    use crate::deny_list::DenyList;
    use crate::outbox::queue_len;
    use crate::registry::TableRegistry;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        NodeId::parse(id).unwrap()
    }

    fn clock(physical: u64, counter: u32, id: &str) -> ClockValue {
        ClockValue::new(physical, counter, node(id))
    }

    fn put(key: &str, value: &str, clock: ClockValue, version: i64) -> SyncChange {
        SyncChange {
            table_name: "kv".to_string(),
            primary_key: key.to_string(),
            payload: json!({ "key": key, "value": value }).as_object().cloned(),
            clock,
            server_version: version,
            tombstone: false,
        }
    }

    fn tombstone(key: &str, clock: ClockValue, version: i64) -> SyncChange {
        SyncChange {
            table_name: "kv".to_string(),
            primary_key: key.to_string(),
            payload: None,
            clock,
            server_version: version,
            tombstone: true,
        }
    }

    struct Harness {
        store: Arc<Store>,
        resolver: ConflictResolver,
        writer: LocalWriter,
        clock: Arc<HybridClock>,
    }

    fn harness() -> Harness {
        harness_with(DenyList::default())
    }

    fn harness_with(deny_list: DenyList) -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let normalizer = Normalizer::new(Arc::new(TableRegistry::builtin()));
        store
            .install_hook(Arc::new(WriteCapture::new(normalizer.clone(), deny_list.clone())))
            .unwrap();
        let clock = Arc::new(HybridClock::with_source(
            node("local"),
            Arc::new(ManualTimeSource::new(50)),
        ));
        Harness {
            resolver: ConflictResolver::new(normalizer.clone(), deny_list, clock.clone()),
            writer: LocalWriter::new(store.clone(), clock.clone(), normalizer),
            store,
            clock,
        }
    }

    fn value_of(h: &Harness, key: &str) -> Option<Value> {
        h.store
            .read(|conn| get_record(conn, "kv", key))
            .unwrap()
            .map(|record| record.payload["value"].clone())
    }

    #[test]
    fn newer_change_wins_and_is_not_recaptured() {
        let h = harness();
        let result = h
            .resolver
            .apply_changes(&h.store, &[put("a", "remote", clock(100, 0, "b"), 1)])
            .unwrap();

        assert_eq!(result.applied, 1);
        assert_eq!(value_of(&h, "a"), Some(json!("remote")));
        assert_eq!(h.store.read(queue_len).unwrap(), 0);
    }

    #[test]
    fn arrival_order_does_not_change_the_winner() {
        let older = put("a", "older", clock(100, 0, "b"), 1);
        let newer = put("a", "newer", clock(100, 1, "a"), 2);

        let forward = harness();
        forward
            .resolver
            .apply_changes(&forward.store, &[older.clone(), newer.clone()])
            .unwrap();
        let reverse = harness();
        let result = reverse
            .resolver
            .apply_changes(&reverse.store, &[newer, older])
            .unwrap();

        assert_eq!(result.stale, 1);
        assert_eq!(value_of(&forward, "a"), Some(json!("newer")));
        assert_eq!(value_of(&reverse, "a"), Some(json!("newer")));
    }

    #[test]
    fn tombstone_blocks_older_put() {
        let h = harness();
        let result = h
            .resolver
            .apply_changes(
                &h.store,
                &[
                    tombstone("a", clock(200, 0, "b"), 2),
                    put("a", "zombie", clock(150, 0, "c"), 3),
                ],
            )
            .unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(result.stale, 1);
        assert_eq!(value_of(&h, "a"), None);

        // A strictly newer put may recreate the record.
        h.resolver
            .apply_changes(&h.store, &[put("a", "reborn", clock(201, 0, "c"), 4)])
            .unwrap();
        assert_eq!(value_of(&h, "a"), Some(json!("reborn")));
    }

    #[test]
    fn local_delete_wins_over_stale_remote_put() {
        let h = harness();
        h.writer.put("kv", &json!({ "key": "a", "value": "mine" })).unwrap();
        h.writer.delete("kv", "a").unwrap();

        let result = h
            .resolver
            .apply_changes(&h.store, &[put("a", "theirs", clock(40, 0, "z"), 1)])
            .unwrap();
        assert_eq!(result.stale, 1);
        assert_eq!(value_of(&h, "a"), None);
    }

    #[test]
    fn echoed_tombstone_records_server_version() {
        let h = harness();
        h.writer.delete("kv", "a").unwrap();
        let local = h
            .store
            .read(|conn| fetch_key_states(conn, "kv", &["a"]))
            .unwrap()
            .remove("a")
            .unwrap();
        let own_clock = local.tombstone_clock.unwrap();

        h.resolver
            .apply_changes(&h.store, &[tombstone("a", own_clock, 7)])
            .unwrap();
        let state = h
            .store
            .read(|conn| fetch_key_states(conn, "kv", &["a"]))
            .unwrap()
            .remove("a")
            .unwrap();
        assert_eq!(state.tombstone_version, Some(7));
    }

    #[test]
    fn derived_fields_survive_remote_overwrite() {
        let h = harness();
        h.writer
            .put(
                "threads",
                &json!({ "id": "t1", "title": "Old", "created_at": 1, "updated_at": 1, "message_count": 9 }),
            )
            .unwrap();

        let change = SyncChange {
            table_name: "threads".to_string(),
            primary_key: "t1".to_string(),
            payload: json!({ "id": "t1", "title": "New", "createdAt": 1, "updatedAt": 2, "message_count": 0 })
                .as_object()
                .cloned(),
            clock: clock(10_000, 0, "b"),
            server_version: 1,
            tombstone: false,
        };
        let result = h.resolver.apply_changes(&h.store, &[change]).unwrap();
        assert_eq!(result.applied, 1);

        let record = h
            .store
            .read(|conn| get_record(conn, "threads", "t1"))
            .unwrap()
            .unwrap();
        assert_eq!(record.payload["title"], json!("New"));
        assert_eq!(record.payload["updated_at"], json!(2));
        assert_eq!(record.payload["message_count"], json!(9));
    }

    #[test]
    fn invalid_changes_are_rejected_without_failing_the_batch() {
        let h = harness();
        let mut bad = put("b", "x", clock(100, 0, "b"), 2);
        bad.payload = json!({ "key": "b" }).as_object().cloned();
        let mut unknown = put("c", "x", clock(100, 0, "b"), 3);
        unknown.table_name = "widgets".to_string();

        let result = h
            .resolver
            .apply_changes(&h.store, &[put("a", "ok", clock(100, 0, "b"), 1), bad, unknown])
            .unwrap();
        assert_eq!(result.applied, 1);
        assert_eq!(result.rejected, 2);
        assert_eq!(result.max_server_version, Some(3));
    }

    #[test]
    fn observed_clock_makes_next_local_write_dominate() {
        let h = harness();
        h.resolver
            .apply_changes(&h.store, &[put("a", "remote", clock(9_000, 3, "b"), 1)])
            .unwrap();
        let local = h.clock.now().unwrap();
        assert!(local > clock(9_000, 3, "b"));
    }

    #[test]
    fn deny_listed_fields_survive_remote_overwrite() {
        let h = harness_with(DenyList::default().with_field("threads", "title"));
        h.writer
            .put(
                "threads",
                &json!({ "id": "t1", "title": "Secret", "created_at": 1, "updated_at": 1 }),
            )
            .unwrap();

        let change = SyncChange {
            table_name: "threads".to_string(),
            primary_key: "t1".to_string(),
            payload: json!({ "id": "t1", "createdAt": 1, "updatedAt": 2 })
                .as_object()
                .cloned(),
            clock: clock(1_000, 0, "remote"),
            server_version: 1,
            tombstone: false,
        };
        let result = h.resolver.apply_changes(&h.store, &[change]).unwrap();
        assert_eq!(result.applied, 1);

        let record = h
            .store
            .read(|conn| get_record(conn, "threads", "t1"))
            .unwrap()
            .unwrap();
        assert_eq!(record.payload["title"], json!("Secret"));
        assert_eq!(record.payload["updated_at"], json!(2));
    }

    #[test]
    fn applied_tombstone_discards_older_queued_edit() {
        let h = harness();
        h.writer.put("kv", &json!({ "key": "k", "value": "stale" })).unwrap();
        h.writer.put("kv", &json!({ "key": "other", "value": 1 })).unwrap();
        assert_eq!(h.store.read(queue_len).unwrap(), 2);

        let result = h
            .resolver
            .apply_changes(&h.store, &[tombstone("k", clock(300, 0, "b"), 4)])
            .unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(result.superseded, 1);
        assert_eq!(h.store.read(queue_len).unwrap(), 1);
        assert_eq!(value_of(&h, "k"), None);
    }

    #[test]
    fn losing_change_keeps_queued_edit() {
        let h = harness();
        h.writer.put("kv", &json!({ "key": "k", "value": "mine" })).unwrap();

        let result = h
            .resolver
            .apply_changes(&h.store, &[put("k", "older", clock(10, 0, "b"), 1)])
            .unwrap();
        assert_eq!(result.stale, 1);
        assert_eq!(result.superseded, 0);
        assert_eq!(h.store.read(queue_len).unwrap(), 1);
        assert_eq!(value_of(&h, "k"), Some(json!("mine")));
    }

    #[test]
    fn clock_far_ahead_is_rejected_and_not_observed() {
        let h = harness();
        let hostile = put("k", "future", clock(u64::MAX, u32::MAX, "b"), 5);

        let result = h.resolver.apply_changes(&h.store, &[hostile]).unwrap();
        assert_eq!(result.rejected, 1);
        assert_eq!(result.applied, 0);
        assert_eq!(result.max_clock, None);
        assert_eq!(result.max_server_version, Some(5));
        assert_eq!(value_of(&h, "k"), None);

        let local = h.clock.now().unwrap();
        assert_eq!((local.physical_time, local.logical_counter), (50, 0));
    }
}
