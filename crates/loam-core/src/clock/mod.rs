//! Hybrid logical clock producing schema-version-tagged causal timestamps.
//!
//! Each replica owns one [`HybridClock`]. Minting combines the physical wall
//! time, a per-millisecond counter and the replica id, so two calls never
//! collide and max-timestamp-wins is well defined. [`HybridClock::update`]
//! applies the Lamport rule on every remote timestamp: the next locally
//! minted timestamp is strictly greater than anything observed so far.
//!
//! Wall-clock accuracy is not required for correctness. A replica whose
//! clock runs behind simply advances through the counter; large skew only
//! produces a warning.

pub mod skew;
pub mod timestamp;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

pub use timestamp::{MAX_COUNTER, MAX_VERSION, MAX_WALL_MS, Timestamp};

use crate::error::ErrorCode;

/// Maximum length of a replica identifier.
pub const MAX_REPLICA_ID_LEN: usize = 64;

/// Errors raised while parsing or minting timestamps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// The text is not a canonical timestamp.
    #[error("malformed timestamp {raw:?}: {reason}")]
    Malformed { raw: String, reason: String },

    /// A component does not fit the fixed-width encoding.
    #[error("timestamp component {0} out of range: {1}")]
    OutOfRange(&'static str, u64),

    /// The replica id contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid replica id {0:?}")]
    InvalidReplicaId(String),
}

impl ClockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidTimestamp
    }
}

// ---------------------------------------------------------------------------
// ReplicaId
// ---------------------------------------------------------------------------

/// Unique discriminator for a replica, embedded in every timestamp it mints.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Validate and wrap a replica id.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidReplicaId`] for empty, overlong or
    /// non-`[A-Za-z0-9_-]` ids.
    pub fn new(raw: &str) -> Result<Self, ClockError> {
        if Self::is_valid(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ClockError::InvalidReplicaId(raw.to_string()))
        }
    }

    /// Generate a fresh random replica id.
    #[must_use]
    pub fn generate() -> Self {
        let raw: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(raw)
    }

    #[must_use]
    pub fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw.len() <= MAX_REPLICA_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ReplicaId {
    type Error = ClockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ReplicaId> for String {
    fn from(value: ReplicaId) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Wall clocks
// ---------------------------------------------------------------------------

/// Source of physical time in milliseconds since the Unix epoch.
pub trait WallClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Manually driven wall clock for tests and simulation.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualWallClock {
    now: Arc<AtomicU64>,
}

impl ManualWallClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// HybridClock
// ---------------------------------------------------------------------------

/// Per-replica hybrid logical clock.
pub struct HybridClock {
    replica: ReplicaId,
    wall: Arc<dyn WallClock>,
    last_wall_ms: u64,
    counter: u32,
    skew_threshold_ms: u64,
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("replica", &self.replica)
            .field("last_wall_ms", &self.last_wall_ms)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl HybridClock {
    #[must_use]
    pub fn new(replica: ReplicaId, wall: Arc<dyn WallClock>) -> Self {
        Self {
            replica,
            wall,
            last_wall_ms: 0,
            counter: 0,
            skew_threshold_ms: skew::DEFAULT_SKEW_THRESHOLD_SECS * 1_000,
        }
    }

    /// Override the skew warning threshold.
    #[must_use]
    pub const fn with_skew_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.skew_threshold_ms = threshold_ms;
        self
    }

    #[must_use]
    pub const fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Mint a fresh timestamp tagged with `version`.
    ///
    /// Strictly greater than every timestamp this clock minted or observed
    /// (for observed versions not above `version`).
    pub fn now(&mut self, version: u32) -> Timestamp {
        let physical = self.wall.now_ms().min(MAX_WALL_MS);
        if physical > self.last_wall_ms {
            self.last_wall_ms = physical;
            self.counter = 0;
        } else if self.counter >= MAX_COUNTER {
            self.last_wall_ms = self.last_wall_ms.saturating_add(1).min(MAX_WALL_MS);
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        Timestamp::new(version.min(MAX_VERSION), self.last_wall_ms, self.counter, &self.replica)
            .unwrap_or_else(|_| Timestamp::zero(version))
    }

    /// The lowest timestamp for `version`; see [`Timestamp::zero`].
    #[must_use]
    pub fn zero(version: u32) -> Timestamp {
        Timestamp::zero(version)
    }

    /// Observe a remote timestamp so that the next [`now`](Self::now) is
    /// strictly greater than it.
    pub fn update(&mut self, remote: &Timestamp) {
        let local_physical = self.wall.now_ms();
        if let Some(warning) =
            skew::check_clock_skew(remote.wall_ms(), local_physical, self.skew_threshold_ms)
        {
            if warning.skew_ms > 0 {
                tracing::warn!(
                    remote = %remote,
                    skew_ms = warning.skew_ms,
                    "{}",
                    warning.message
                );
            }
        }

        match remote.wall_ms().cmp(&self.last_wall_ms) {
            std::cmp::Ordering::Greater => {
                self.last_wall_ms = remote.wall_ms();
                self.counter = remote.counter();
            }
            std::cmp::Ordering::Equal => {
                self.counter = self.counter.max(remote.counter());
            }
            std::cmp::Ordering::Less => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_at(id: &str, start_ms: u64) -> (HybridClock, ManualWallClock) {
        let wall = ManualWallClock::new(start_ms);
        let clock = HybridClock::new(ReplicaId::new(id).expect("id"), Arc::new(wall.clone()));
        (clock, wall)
    }

    #[test]
    fn successive_calls_never_collide() {
        let (mut clock, _wall) = clock_at("a", 1_000);
        let mut prev = clock.now(1);
        for _ in 0..100 {
            let next = clock.now(1);
            assert!(next > prev, "{next} <= {prev}");
            prev = next;
        }
        assert_eq!(prev.wall_ms(), 1_000);
        assert_eq!(prev.counter(), 100);
    }

    #[test]
    fn wall_advance_resets_counter() {
        let (mut clock, wall) = clock_at("a", 1_000);
        let _ = clock.now(1);
        let _ = clock.now(1);
        wall.advance(5);
        let t = clock.now(1);
        assert_eq!(t.wall_ms(), 1_005);
        assert_eq!(t.counter(), 0);
    }

    #[test]
    fn clock_going_backwards_still_monotonic() {
        let (mut clock, wall) = clock_at("a", 5_000);
        let first = clock.now(1);
        wall.set(1_000);
        let second = clock.now(1);
        assert!(second > first);
        assert_eq!(second.wall_ms(), 5_000);
    }

    #[test]
    fn update_makes_next_timestamp_greater_than_remote() {
        let (mut clock, _wall) = clock_at("a", 1_000);
        let local = clock.now(1);
        let remote =
            Timestamp::new(1, 9_000, 17, &ReplicaId::new("b").expect("id")).expect("ts");
        clock.update(&remote);
        let next = clock.now(1);
        assert!(next > remote);
        assert!(next > local);
    }

    #[test]
    fn update_with_same_wall_takes_max_counter() {
        let (mut clock, _wall) = clock_at("a", 1_000);
        let _ = clock.now(1);
        let remote =
            Timestamp::new(1, 1_000, 40, &ReplicaId::new("zzz").expect("id")).expect("ts");
        clock.update(&remote);
        let next = clock.now(1);
        assert_eq!(next.counter(), 41);
        assert!(next > remote);
    }

    #[test]
    fn counter_overflow_bumps_wall() {
        let (mut clock, _wall) = clock_at("a", 1_000);
        let remote =
            Timestamp::new(1, 1_000, MAX_COUNTER, &ReplicaId::new("b").expect("id")).expect("ts");
        clock.update(&remote);
        let next = clock.now(1);
        assert_eq!(next.wall_ms(), 1_001);
        assert_eq!(next.counter(), 0);
        assert!(next > remote);
    }

    #[test]
    fn organic_timestamps_sort_after_zero() {
        let (mut clock, _wall) = clock_at("a", 0);
        let t = clock.now(3);
        assert!(t > HybridClock::zero(3));
        assert!(HybridClock::zero(4) > t);
    }

    #[test]
    fn replica_id_validation() {
        assert!(ReplicaId::new("device_01-x").is_ok());
        assert!(ReplicaId::new("").is_err());
        assert!(ReplicaId::new("has space").is_err());
        assert!(ReplicaId::new(&"x".repeat(MAX_REPLICA_ID_LEN + 1)).is_err());
        let generated = ReplicaId::generate();
        assert!(ReplicaId::is_valid(generated.as_str()));
    }
}
