//! ebb-core - device side of the ebb sync engine
//!
//! Local writes are stamped with a hybrid logical clock and captured into an
//! outbox inside the writing transaction. The outbox pushes to a remote
//! authority; catch-up pulls its change log back and resolves conflicts with
//! last-writer-wins on the clock.

pub mod breaker;
pub mod capture;
pub mod catch_up;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod db;
pub mod deny_list;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod util;

pub use clock::{ClockValue, HybridClock, NodeId};
pub use config::EngineConfig;
pub use engine::{SyncEngine, SyncHandle, SyncReport, SyncState, SyncStatus};
pub use error::{Error, Result};
pub use remote::{HttpRemote, Remote, TransportError};
