//! Scheduled change-log garbage collection

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::authority::Authority;

/// Run a GC pass every `interval` until `shutdown` flips to true
pub fn spawn_gc_task(
    authority: Arc<Authority>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let authority = authority.clone();
                    match tokio::task::spawn_blocking(move || authority.collect_garbage()).await {
                        Ok(Ok(report)) => {
                            tracing::debug!(scopes = report.scopes, "GC pass complete");
                        }
                        Ok(Err(error)) => tracing::warn!(%error, "GC pass failed"),
                        Err(error) => tracing::error!(%error, "GC task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("GC task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebb_core::registry::TableRegistry;

    #[tokio::test]
    async fn gc_task_stops_on_shutdown() {
        let authority = Arc::new(Authority::open_in_memory(Arc::new(TableRegistry::builtin())).unwrap());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_gc_task(authority, Duration::from_secs(3_600), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
