use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Fixed-window limiter keyed by `(operation, identity)`
///
/// Identities come from request credentials, so the window map is bounded:
/// entries are kept in window-start order, expired windows are purged from
/// the front, and the oldest entry is evicted once `max_entries` is reached.
#[derive(Clone)]
pub struct EndpointRateLimiter {
    state: Arc<Mutex<IndexMap<String, RateWindow>>>,
    window: Duration,
    push_limit: u32,
    pull_limit: u32,
    max_entries: usize,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Push,
    Pull,
}

#[derive(Default)]
struct RateLimitMetrics {
    push_allowed: AtomicU64,
    push_limited: AtomicU64,
    pull_allowed: AtomicU64,
    pull_limited: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub push_allowed: u64,
    pub push_limited: u64,
    pub pull_allowed: u64,
    pub pull_limited: u64,
    pub evicted: u64,
    pub tracked: usize,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.push_rate_limit_per_window,
            config.pull_rate_limit_per_window,
            config.rate_limit_max_identities,
        )
    }

    pub fn new(window: Duration, push_limit: u32, pull_limit: u32, max_entries: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(IndexMap::new())),
            window,
            push_limit,
            pull_limit,
            max_entries: max_entries.max(1),
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, operation: SyncOperation, identity: &str) -> Result<(), AppError> {
        self.check_at(operation, identity, Instant::now()).await
    }

    async fn check_at(
        &self,
        operation: SyncOperation,
        identity: &str,
        now: Instant,
    ) -> Result<(), AppError> {
        let limit = match operation {
            SyncOperation::Push => self.push_limit,
            SyncOperation::Pull => self.pull_limit,
        };
        let key = format!("{}:{identity}", operation.label());
        let mut guard = self.state.lock().await;

        self.purge_expired(&mut guard, now);

        if let Some(window) = guard.get_mut(&key) {
            if now.duration_since(window.started_at) < self.window {
                if window.count >= limit {
                    let retry_after_secs = self
                        .window
                        .saturating_sub(now.duration_since(window.started_at))
                        .as_secs();
                    return Err(self.deny(operation, identity, retry_after_secs));
                }
                window.count += 1;
                self.mark_allowed(operation);
                return Ok(());
            }
            // A restarted window moves to the back so the front stays oldest.
            guard.shift_remove(&key);
        }

        if limit == 0 {
            return Err(self.deny(operation, identity, self.window.as_secs()));
        }
        while guard.len() >= self.max_entries {
            if guard.shift_remove_index(0).is_none() {
                break;
            }
            self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.insert(
            key,
            RateWindow {
                started_at: now,
                count: 1,
            },
        );
        self.mark_allowed(operation);
        Ok(())
    }

    fn deny(&self, operation: SyncOperation, identity: &str, retry_after_secs: u64) -> AppError {
        self.mark_limited(operation);
        tracing::warn!(
            operation = operation.label(),
            identity = identity_fingerprint(identity),
            retry_after_secs,
            "Rate limit exceeded"
        );
        AppError::too_many_requests(
            format!("Rate limit exceeded for {}", operation.label()),
            retry_after_secs,
        )
    }

    pub async fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        let tracked = self.state.lock().await.len();
        RateLimitMetricsSnapshot {
            push_allowed: self.metrics.push_allowed.load(Ordering::Relaxed),
            push_limited: self.metrics.push_limited.load(Ordering::Relaxed),
            pull_allowed: self.metrics.pull_allowed.load(Ordering::Relaxed),
            pull_limited: self.metrics.pull_limited.load(Ordering::Relaxed),
            evicted: self.metrics.evicted.load(Ordering::Relaxed),
            tracked,
        }
    }

    fn purge_expired(&self, windows: &mut IndexMap<String, RateWindow>, now: Instant) {
        while let Some((_, window)) = windows.first() {
            if now.duration_since(window.started_at) < self.window {
                break;
            }
            windows.shift_remove_index(0);
        }
    }

    fn mark_allowed(&self, operation: SyncOperation) {
        match operation {
            SyncOperation::Push => {
                self.metrics.push_allowed.fetch_add(1, Ordering::Relaxed);
            }
            SyncOperation::Pull => {
                self.metrics.pull_allowed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn mark_limited(&self, operation: SyncOperation) {
        match operation {
            SyncOperation::Push => {
                self.metrics.push_limited.fetch_add(1, Ordering::Relaxed);
            }
            SyncOperation::Pull => {
                self.metrics.pull_limited.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl SyncOperation {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

pub fn identity_fingerprint(identity: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    identity.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_blocks_after_limit() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(60), 2, 5, 100);

        limiter.check(SyncOperation::Push, "user-a").await.unwrap();
        limiter.check(SyncOperation::Push, "user-a").await.unwrap();

        let err = limiter
            .check(SyncOperation::Push, "user-a")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, _)));

        // Pull has its own window for the same identity.
        limiter.check(SyncOperation::Pull, "user-a").await.unwrap();

        let metrics = limiter.metrics_snapshot().await;
        assert_eq!(metrics.push_allowed, 2);
        assert_eq!(metrics.push_limited, 1);
        assert_eq!(metrics.pull_allowed, 1);
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(10), 1, 1, 100);
        let start = Instant::now();

        limiter
            .check_at(SyncOperation::Push, "user-a", start)
            .await
            .unwrap();
        assert!(limiter
            .check_at(SyncOperation::Push, "user-a", start + Duration::from_secs(5))
            .await
            .is_err());
        limiter
            .check_at(SyncOperation::Push, "user-a", start + Duration::from_secs(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn map_is_bounded_by_evicting_oldest() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(60), 1, 1, 2);
        let start = Instant::now();

        for (offset, identity) in ["a", "b", "c"].into_iter().enumerate() {
            limiter
                .check_at(
                    SyncOperation::Push,
                    identity,
                    start + Duration::from_secs(offset as u64),
                )
                .await
                .unwrap();
        }

        let metrics = limiter.metrics_snapshot().await;
        assert_eq!(metrics.tracked, 2);
        assert_eq!(metrics.evicted, 1);

        // "a" was evicted, so its window starts over.
        limiter
            .check_at(SyncOperation::Push, "a", start + Duration::from_secs(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_windows_are_purged() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(10), 1, 1, 100);
        let start = Instant::now();

        limiter
            .check_at(SyncOperation::Pull, "a", start)
            .await
            .unwrap();
        limiter
            .check_at(SyncOperation::Pull, "b", start + Duration::from_secs(1))
            .await
            .unwrap();
        limiter
            .check_at(SyncOperation::Pull, "c", start + Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(limiter.metrics_snapshot().await.tracked, 2);
    }

    #[test]
    fn fingerprint_is_stable_and_hides_identity() {
        assert_eq!(identity_fingerprint("user-a"), identity_fingerprint("user-a"));
        assert_ne!(identity_fingerprint("user-a"), identity_fingerprint("user-b"));
    }
}
