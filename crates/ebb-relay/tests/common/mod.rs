#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ebb_core::clock::ManualTimeSource;
use ebb_core::db::Store;
use ebb_core::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use ebb_core::registry::TableRegistry;
use ebb_core::{EngineConfig, Remote, SyncEngine, TransportError};
use ebb_relay::Authority;

pub const OWNER: &str = "alice";
pub const SCOPE: &str = "notes";

/// In-process stand-in for the HTTP relay, with switches for failure modes
#[derive(Clone)]
pub struct LocalRelay {
    pub authority: Arc<Authority>,
    online: Arc<AtomicBool>,
    lost_acks: Arc<AtomicUsize>,
    pushed_ops: Arc<AtomicUsize>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self {
            authority: Arc::new(Authority::open_in_memory(Arc::new(TableRegistry::builtin())).unwrap()),
            online: Arc::new(AtomicBool::new(true)),
            lost_acks: Arc::new(AtomicUsize::new(0)),
            pushed_ops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Apply the next `count` pushes but report them as failed
    pub fn lose_acks(&self, count: usize) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    /// Operations received over the wire, replays included
    pub fn pushed_ops(&self) -> usize {
        self.pushed_ops.load(Ordering::SeqCst)
    }

    pub fn log_len(&self) -> i64 {
        self.authority.log_len(OWNER, SCOPE).unwrap()
    }

    pub fn version(&self) -> i64 {
        self.authority.scope_version(OWNER, SCOPE).unwrap()
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("relay offline".to_string()))
        }
    }
}

impl Remote for LocalRelay {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        self.ensure_online()?;
        self.pushed_ops.fetch_add(request.ops.len(), Ordering::SeqCst);
        let response = self
            .authority
            .push(OWNER, &request)
            .map_err(|error| TransportError::Unavailable(error.to_string()))?;

        let lost = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(TransportError::Unavailable("connection reset".to_string()));
        }
        Ok(response)
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        self.ensure_online()?;
        self.authority
            .pull(OWNER, &request, 1_000)
            .map_err(|error| TransportError::Unavailable(error.to_string()))
    }
}

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::for_scope(SCOPE);
    config.retry_base = Duration::from_millis(1);
    config.retry_max = Duration::from_millis(10);
    config.pull_page_size = 2;
    config
}

/// A device with an in-memory store and a manual wall clock
pub fn device(relay: &LocalRelay, millis: u64) -> (SyncEngine<LocalRelay>, Arc<ManualTimeSource>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    device_on(store, relay, millis)
}

pub fn device_at(path: &Path, relay: &LocalRelay, millis: u64) -> (SyncEngine<LocalRelay>, Arc<ManualTimeSource>) {
    let store = Arc::new(Store::open(path).unwrap());
    device_on(store, relay, millis)
}

pub fn device_on(
    store: Arc<Store>,
    relay: &LocalRelay,
    millis: u64,
) -> (SyncEngine<LocalRelay>, Arc<ManualTimeSource>) {
    let time = Arc::new(ManualTimeSource::new(millis));
    let engine = SyncEngine::open_with(store, relay.clone(), config(), time.clone(), None).unwrap();
    (engine, time)
}

/// Wait past the outbox retry back-off
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
