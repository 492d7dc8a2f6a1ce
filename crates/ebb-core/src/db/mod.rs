//! Local storage layer for ebb

mod connection;
mod migrations;
mod records;

pub use connection::Store;
pub use records::{
    fetch_key_states, get_record, list_records, prune_tombstones, KeyState, LocalRecord,
    RecordTxn, WriteEvent, WriteHook, WriteOrigin,
};
