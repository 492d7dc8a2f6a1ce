//! Hybrid logical clock
//!
//! Every mutation is stamped with a [`ClockValue`] from a [`HybridClock`]. Values
//! order lexicographically by `(physical_time, logical_counter, node_id)`, so two
//! writes on the same tick from different devices still have a total order:
//! equal `(physical_time, logical_counter)` pairs fall back to a byte-wise
//! comparison of the node id.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// Wide enough for every u64 and u32.
const PHYSICAL_WIDTH: usize = 20;
const COUNTER_WIDTH: usize = 10;

/// How far ahead of local wall time a remote clock may be and still be accepted
pub const MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60 * 60);

/// Stable identifier of one installation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh random node id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing identifier; rejects empty ids and the `:` separator
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.contains(':') {
            return Err(Error::InvalidInput(format!("invalid node id `{value}`")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single hybrid logical clock reading
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockValue {
    /// Wall-clock milliseconds since the Unix epoch
    pub physical_time: u64,
    /// Tie-breaker for events sharing a physical time
    pub logical_counter: u32,
    /// Generating installation
    pub node_id: NodeId,
}

impl ClockValue {
    pub fn new(physical_time: u64, logical_counter: u32, node_id: NodeId) -> Self {
        Self {
            physical_time,
            logical_counter,
            node_id,
        }
    }

    /// Fixed-width text key whose string order matches clock order
    pub fn encode(&self) -> String {
        format!(
            "{:0pw$}:{:0cw$}:{}",
            self.physical_time,
            self.logical_counter,
            self.node_id,
            pw = PHYSICAL_WIDTH,
            cw = COUNTER_WIDTH
        )
    }

    /// Whether this reading lies more than `max_drift` past `wall_millis`
    pub fn is_ahead_of(&self, wall_millis: u64, max_drift: Duration) -> bool {
        let drift = u64::try_from(max_drift.as_millis()).unwrap_or(u64::MAX);
        self.physical_time > wall_millis.saturating_add(drift)
    }
}

impl Ord for ClockValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_time
            .cmp(&other.physical_time)
            .then(self.logical_counter.cmp(&other.logical_counter))
            .then_with(|| self.node_id.as_str().as_bytes().cmp(other.node_id.as_str().as_bytes()))
    }
}

impl PartialOrd for ClockValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ClockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ClockValue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(physical), Some(counter), Some(node)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidInput(format!("malformed clock `{s}`")));
        };

        let physical_time = physical
            .parse()
            .map_err(|_| Error::InvalidInput(format!("malformed clock physical time `{s}`")))?;
        let logical_counter = counter
            .parse()
            .map_err(|_| Error::InvalidInput(format!("malformed clock counter `{s}`")))?;
        Ok(Self {
            physical_time,
            logical_counter,
            node_id: NodeId::parse(node)?,
        })
    }
}

/// Source of wall-clock milliseconds
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Reads the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Manually driven time, for tests and simulations
#[derive(Debug, Default)]
pub struct ManualTimeSource(AtomicU64);

impl ManualTimeSource {
    pub const fn new(millis: u64) -> Self {
        Self(AtomicU64::new(millis))
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ClockState {
    physical_time: u64,
    logical_counter: u32,
}

/// Hybrid logical clock generator owned by one process or session
pub struct HybridClock {
    node_id: NodeId,
    source: Arc<dyn TimeSource>,
    max_drift: Duration,
    state: Mutex<ClockState>,
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("node_id", &self.node_id)
            .field("max_drift", &self.max_drift)
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl HybridClock {
    /// Clock reading the system time
    pub fn new(node_id: NodeId) -> Self {
        Self::with_source(node_id, Arc::new(SystemTimeSource))
    }

    pub fn with_source(node_id: NodeId, source: Arc<dyn TimeSource>) -> Self {
        Self {
            node_id,
            source,
            max_drift: MAX_CLOCK_DRIFT,
            state: Mutex::new(ClockState::default()),
        }
    }

    #[must_use]
    pub const fn with_max_drift(mut self, max_drift: Duration) -> Self {
        self.max_drift = max_drift;
        self
    }

    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Next clock value, strictly greater than every value this instance returned
    pub fn now(&self) -> Result<ClockValue> {
        let wall = self.source.now_millis();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if wall > state.physical_time {
            state.physical_time = wall;
            state.logical_counter = 0;
        } else {
            advance_counter(&mut state)?;
        }

        Ok(ClockValue::new(
            state.physical_time,
            state.logical_counter,
            self.node_id.clone(),
        ))
    }

    /// Whether a remote reading is close enough to local time to be merged
    pub fn admits(&self, remote: &ClockValue) -> bool {
        !remote.is_ahead_of(self.source.now_millis(), self.max_drift)
    }

    /// Merge a clock seen on an incoming change so later local writes dominate it
    pub fn observe(&self, remote: &ClockValue) -> Result<()> {
        if !self.admits(remote) {
            return Err(Error::Clock(format!(
                "remote clock {remote} is more than {}s ahead of local time",
                self.max_drift.as_secs()
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match remote.physical_time.cmp(&state.physical_time) {
            Ordering::Greater => {
                state.physical_time = remote.physical_time;
                state.logical_counter = remote.logical_counter;
            }
            Ordering::Equal if remote.logical_counter > state.logical_counter => {
                state.logical_counter = remote.logical_counter;
            }
            _ => {}
        }
        Ok(())
    }

    /// Forget all history, as if freshly constructed
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ClockState::default();
    }

    fn snapshot(&self) -> ClockState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn advance_counter(state: &mut ClockState) -> Result<()> {
    if let Some(counter) = state.logical_counter.checked_add(1) {
        state.logical_counter = counter;
        return Ok(());
    }
    // Counter exhausted within one millisecond; borrow from the next tick.
    state.physical_time = state
        .physical_time
        .checked_add(1)
        .ok_or_else(|| Error::Clock("clock exhausted its physical range".to_string()))?;
    state.logical_counter = 0;
    Ok(())
}
