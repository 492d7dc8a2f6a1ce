//! Incremental catch-up from the remote change log

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::breaker::BreakerRegistry;
use crate::cursor::{advance_cursor, CursorManager};
use crate::db::{prune_tombstones, Store, WriteOrigin};
use crate::error::{Error, Result};
use crate::protocol::{PullRequest, MAX_PULL_LIMIT};
use crate::remote::{Remote, TransportError};
use crate::resolver::{ApplyResult, ConflictResolver};

/// Result of one catch-up run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatchUpReport {
    pub pages: usize,
    pub changes: ApplyResult,
    pub cursor: i64,
    /// Local tombstones dropped once the cursor moved past them
    pub pruned: usize,
    pub paused: bool,
}

/// Streams remote changes into the local store for one scope
pub struct Subscription<R> {
    store: Arc<Store>,
    remote: Arc<R>,
    resolver: ConflictResolver,
    cursors: CursorManager,
    breakers: Arc<BreakerRegistry>,
    scope: String,
    device_id: String,
    page_size: u32,
    tables: Vec<String>,
    lock: Mutex<()>,
}

impl<R: Remote> Subscription<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        remote: Arc<R>,
        resolver: ConflictResolver,
        breakers: Arc<BreakerRegistry>,
        scope: impl Into<String>,
        device_id: impl Into<String>,
        page_size: u32,
        tables: Vec<String>,
    ) -> Self {
        Self {
            cursors: CursorManager::new(store.clone()),
            store,
            remote,
            resolver,
            breakers,
            scope: scope.into(),
            device_id: device_id.into(),
            page_size: page_size.clamp(1, MAX_PULL_LIMIT),
            tables,
            lock: Mutex::new(()),
        }
    }

    pub const fn cursors(&self) -> &CursorManager {
        &self.cursors
    }

    /// Pull and apply pages until the remote reports nothing more
    pub async fn catch_up(&self) -> Result<CatchUpReport> {
        let _guard = self.lock.lock().await;
        self.run().await
    }

    /// Rewind the cursor and replay the whole log through the same path
    ///
    /// Local rows are never cleared; replayed changes go through conflict
    /// resolution like any other.
    pub async fn rescan(&self) -> Result<CatchUpReport> {
        let _guard = self.lock.lock().await;
        self.cursors.reset(&self.scope)?;
        self.run().await
    }

    async fn run(&self) -> Result<CatchUpReport> {
        let mut report = CatchUpReport {
            cursor: self.cursors.get_cursor(&self.scope)?,
            ..CatchUpReport::default()
        };

        loop {
            if !self.breakers.allow(&self.scope) {
                tracing::debug!(scope = %self.scope, "Catch-up paused by open circuit");
                report.paused = true;
                return Ok(report);
            }

            let cursor = report.cursor;
            let request = PullRequest {
                scope: self.scope.clone(),
                device_id: self.device_id.clone(),
                cursor,
                limit: self.page_size,
                tables: self.tables.clone(),
            };
            let page = match self.remote.pull(request).await {
                Ok(page) => page,
                Err(error) => {
                    self.breakers.record_failure(&self.scope);
                    tracing::warn!(scope = %self.scope, %error, "Pull failed");
                    return Err(error.into());
                }
            };
            self.breakers.record_success(&self.scope);

            if page.next_cursor < cursor {
                return Err(protocol_error(format!(
                    "pull moved cursor backwards ({cursor} -> {})",
                    page.next_cursor
                )));
            }
            if page.has_more && page.next_cursor == cursor {
                return Err(protocol_error(format!(
                    "pull reported more changes without advancing past {cursor}"
                )));
            }

            let (applied, stored) = self.store.write(WriteOrigin::Remote, |txn| {
                let applied = self.resolver.apply_in(txn, &page.changes)?;
                let stored = advance_cursor(txn.connection(), &self.scope, page.next_cursor)?;
                Ok((applied, stored))
            })?;

            report.pages += 1;
            report.cursor = stored;
            report.changes.merge(applied);

            if !page.has_more {
                break;
            }
        }

        let through = report.cursor;
        report.pruned = self
            .store
            .transaction(|conn| prune_tombstones(conn, through))?;

        tracing::debug!(
            scope = %self.scope,
            pages = report.pages,
            cursor = report.cursor,
            applied = report.changes.applied,
            deleted = report.changes.deleted,
            stale = report.changes.stale,
            pruned = report.pruned,
            "Catch-up complete"
        );
        Ok(report)
    }
}

fn protocol_error(message: String) -> Error {
    Error::Transport(TransportError::Protocol(message))
}
