//! Per-scope circuit breaker
//!
//! `closed -> open` after a run of consecutive failures, `open -> half_open`
//! once the cooldown elapses (admitting a single trial), then `closed` on a
//! successful trial or back to `open` with a doubled cooldown on failure.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: BreakerState,
    consecutive_failures: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub const fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            cooldown: settings.cooldown,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub const fn state(&self) -> BreakerState {
        self.state
    }

    pub const fn current_cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether a remote call may proceed now
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            tracing::info!("Circuit closed after successful trial");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.cooldown = self.settings.cooldown;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .is_none_or(|opened_at| now.duration_since(opened_at) >= self.cooldown);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                }
                elapsed
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_failure_at(&mut self, now: Instant) {
        self.trial_in_flight = false;
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.settings.failure_threshold {
                    self.open(now);
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                self.cooldown = self
                    .cooldown
                    .saturating_mul(2)
                    .min(self.settings.max_cooldown);
                self.open(now);
                tracing::warn!(
                    cooldown_secs = self.cooldown.as_secs(),
                    "Trial failed; circuit reopened"
                );
            }
            BreakerState::Open => self.opened_at = Some(now),
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
    }
}

/// One breaker per scope, created lazily and evicted on scope switch
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, scope: &str) -> bool {
        self.with(scope, CircuitBreaker::allow)
    }

    pub fn record_success(&self, scope: &str) {
        self.with(scope, CircuitBreaker::record_success);
    }

    pub fn record_failure(&self, scope: &str) {
        self.with(scope, CircuitBreaker::record_failure);
    }

    pub fn state(&self, scope: &str) -> BreakerState {
        self.lock()
            .get(scope)
            .map_or(BreakerState::Closed, CircuitBreaker::state)
    }

    /// Drop the breaker for a scope the host no longer uses
    pub fn evict(&self, scope: &str) -> bool {
        self.lock().remove(scope).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with<T>(&self, scope: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(scope.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.settings));
        f(breaker)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
