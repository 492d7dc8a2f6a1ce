//! Sync engine: wires capture, outbox, catch-up, and breakers for one scope

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::breaker::{BreakerRegistry, BreakerState};
use crate::capture::{LocalWriter, WriteCapture};
use crate::catch_up::{CatchUpReport, Subscription};
use crate::clock::{HybridClock, NodeId, SystemTimeSource, TimeSource};
use crate::config::{ConfigError, EngineConfig};
use crate::db::Store;
use crate::error::Result;
use crate::normalize::Normalizer;
use crate::outbox::{FlushReport, OutboxManager};
use crate::remote::Remote;
use crate::resolver::ConflictResolver;
use crate::util::compact_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    /// The scope's circuit is open; remote calls are suspended
    Paused,
    /// The last remote round failed
    Error,
}

/// What a host displays about synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub scope: String,
    pub state: SyncState,
    pub pending_ops: u64,
    pub cursor: i64,
    pub breaker: BreakerState,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub flush: FlushReport,
    pub catch_up: CatchUpReport,
}

#[derive(Debug, Default)]
struct Activity {
    running: u32,
    last_error: Option<String>,
}

pub struct SyncEngine<R> {
    config: EngineConfig,
    node_id: NodeId,
    clock: Arc<HybridClock>,
    writer: LocalWriter,
    outbox: OutboxManager<R>,
    subscription: Subscription<R>,
    breakers: Arc<BreakerRegistry>,
    activity: Mutex<Activity>,
}

impl<R: Remote> SyncEngine<R> {
    /// Open an engine against the system clock
    pub fn open(store: Arc<Store>, remote: R, config: EngineConfig) -> Result<Self> {
        Self::open_with(store, remote, config, Arc::new(SystemTimeSource), None)
    }

    /// Open with an explicit time source and an optional breaker registry shared
    /// with other scopes
    pub fn open_with(
        store: Arc<Store>,
        remote: R,
        config: EngineConfig,
        time_source: Arc<dyn TimeSource>,
        breakers: Option<Arc<BreakerRegistry>>,
    ) -> Result<Self> {
        config.validate()?;
        store.bind_scope(&config.scope)?;
        let registry = Arc::new(config.load_registry()?);
        let deny_list = config.load_deny_list()?;
        registry.require_all(deny_list.tables())?;
        for table in deny_list.tables() {
            let meta = registry.get(table)?;
            let required = meta
                .fields()
                .filter(|(_, spec)| spec.required)
                .find(|(name, _)| deny_list.denies_field(table, name));
            if let Some((field, _)) = required {
                return Err(ConfigError::Invalid(format!(
                    "deny-list cannot exclude required field `{table}.{field}`"
                ))
                .into());
            }
        }

        let normalizer = Normalizer::new(registry);
        store.install_hook(Arc::new(WriteCapture::new(
            normalizer.clone(),
            deny_list.clone(),
        )))?;

        let node_id = store.node_id()?;
        let clock = Arc::new(HybridClock::with_source(node_id.clone(), time_source));
        let breakers =
            breakers.unwrap_or_else(|| Arc::new(BreakerRegistry::new(config.breaker_settings())));
        let remote = Arc::new(remote);

        let outbox = OutboxManager::open(
            store.clone(),
            remote.clone(),
            breakers.clone(),
            config.scope.clone(),
            node_id.as_str(),
            config.outbox_settings(),
        )?;
        let subscription = Subscription::new(
            store.clone(),
            remote,
            ConflictResolver::new(normalizer.clone(), deny_list, clock.clone()),
            breakers.clone(),
            config.scope.clone(),
            node_id.as_str(),
            config.pull_page_size,
            Vec::new(),
        );
        let writer = LocalWriter::new(store, clock.clone(), normalizer);

        tracing::info!(scope = %config.scope, node_id = %node_id, "Sync engine opened");
        Ok(Self {
            config,
            node_id,
            clock,
            writer,
            outbox,
            subscription,
            breakers,
            activity: Mutex::new(Activity::default()),
        })
    }

    pub const fn writer(&self) -> &LocalWriter {
        &self.writer
    }

    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub const fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn scope(&self) -> &str {
        &self.config.scope
    }

    pub async fn flush(&self) -> Result<FlushReport> {
        self.tracked(self.outbox.flush()).await
    }

    pub async fn catch_up(&self) -> Result<CatchUpReport> {
        self.tracked(self.subscription.catch_up()).await
    }

    pub async fn rescan(&self) -> Result<CatchUpReport> {
        self.tracked(self.subscription.rescan()).await
    }

    /// Push everything due, then pull everything new
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let flush = self.flush().await?;
        let catch_up = self.catch_up().await?;
        Ok(SyncReport { flush, catch_up })
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let pending_ops = self.outbox.queue_len()?;
        let cursor = self.subscription.cursors().get_cursor(&self.config.scope)?;
        let breaker = self.breakers.state(&self.config.scope);
        let activity = self.activity();

        let state = if breaker == BreakerState::Open {
            SyncState::Paused
        } else if activity.running > 0 {
            SyncState::Syncing
        } else if activity.last_error.is_some() {
            SyncState::Error
        } else {
            SyncState::Idle
        };

        Ok(SyncStatus {
            scope: self.config.scope.clone(),
            state,
            pending_ops,
            cursor,
            breaker,
            last_error: activity.last_error.clone(),
        })
    }

    /// Interval until the next flush, shortened while the queue is backed up
    pub fn next_flush_delay(&self) -> Duration {
        match self.outbox.queue_len() {
            Ok(len) if len > self.config.backpressure_threshold => {
                tracing::debug!(queued = len, "Outbox backpressure; flushing on fast interval");
                self.config.fast_flush_interval
            }
            _ => self.config.flush_interval,
        }
    }

    async fn tracked<T>(&self, work: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.activity().running += 1;
        let result = work.await;
        let mut activity = self.activity();
        activity.running = activity.running.saturating_sub(1);
        match &result {
            Ok(_) => activity.last_error = None,
            Err(error) => activity.last_error = Some(compact_text(&error.to_string())),
        }
        result
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Remote> SyncEngine<R> {
    /// Run the flush and catch-up loops until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> SyncHandle {
        let flush = {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let delay = engine.next_flush_delay();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(error) = engine.flush().await {
                        tracing::warn!(%error, "Background flush failed");
                    }
                }
                tracing::debug!("Flush loop stopped");
            })
        };

        let catch_up = {
            let engine = self;
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                loop {
                    if let Err(error) = engine.catch_up().await {
                        tracing::warn!(%error, "Background catch-up failed");
                    }
                    tokio::select! {
                        () = tokio::time::sleep(engine.config.pull_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                tracing::debug!("Catch-up loop stopped");
            })
        };

        SyncHandle {
            tasks: vec![flush, catch_up],
        }
    }
}

impl<R> Drop for SyncEngine<R> {
    fn drop(&mut self) {
        self.breakers.evict(&self.config.scope);
    }
}

/// Background tasks started by [`SyncEngine::spawn`]
#[derive(Debug)]
pub struct SyncHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Wait for both loops to exit after shutdown was signalled
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::error!(%error, "Sync task panicked");
            }
        }
    }
}
