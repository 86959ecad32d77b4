use std::sync::Arc;

use loam_core::clock::{ManualWallClock, WallClock};
use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Ranges from which each replica's clock is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Wall time at round zero, in milliseconds.
    pub base_millis: u64,
    /// Milliseconds a round advances an undrifted clock.
    pub tick_millis: u64,
    /// Maximum absolute drift in parts per million.
    pub max_abs_drift_ppm: i32,
    /// Maximum absolute constant offset in milliseconds.
    pub max_abs_skew_millis: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            base_millis: 1_700_000_000_000,
            tick_millis: 100,
            max_abs_drift_ppm: 100,
            max_abs_skew_millis: 25,
        }
    }
}

/// The drift and skew assigned to one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSpec {
    pub base_millis: u64,
    pub tick_millis: u64,
    pub drift_ppm: i32,
    pub skew_millis: i64,
}

impl ClockSpec {
    /// An exact clock, used for the hub.
    #[must_use]
    pub const fn exact(config: &ClockConfig) -> Self {
        Self {
            base_millis: config.base_millis,
            tick_millis: config.tick_millis,
            drift_ppm: 0,
            skew_millis: 0,
        }
    }

    /// Draw a skewed, drifting clock within `config`'s bounds.
    #[must_use]
    pub fn draw(config: &ClockConfig, rng: &mut DeterministicRng) -> Self {
        let drift_span = u64::from(config.max_abs_drift_ppm.unsigned_abs()) * 2 + 1;
        let skew_span = config.max_abs_skew_millis.unsigned_abs() * 2 + 1;
        let drift = i64::try_from(rng.next_bounded(drift_span)).unwrap_or(0)
            - i64::from(config.max_abs_drift_ppm.abs());
        let skew = i64::try_from(rng.next_bounded(skew_span)).unwrap_or(0)
            - config.max_abs_skew_millis.abs();
        Self {
            base_millis: config.base_millis,
            tick_millis: config.tick_millis,
            drift_ppm: i32::try_from(drift).unwrap_or(0),
            skew_millis: skew,
        }
    }
}

/// A replica's wall clock, stepped once per round.
///
/// The engine reads it through a shared [`ManualWallClock`] handle, so
/// freezing here freezes what the replica's hybrid clock observes.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    spec: ClockSpec,
    frozen_until: Option<u64>,
    wall: ManualWallClock,
}

impl SimulatedClock {
    #[must_use]
    pub fn new(spec: ClockSpec) -> Self {
        Self {
            spec,
            frozen_until: None,
            wall: ManualWallClock::new(Self::millis_at(spec, 0)),
        }
    }

    #[must_use]
    pub const fn spec(&self) -> ClockSpec {
        self.spec
    }

    /// The handle the engine reads.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn WallClock> {
        Arc::new(self.wall.clone())
    }

    #[must_use]
    pub fn now_millis(&self) -> u64 {
        self.wall.now_ms()
    }

    /// Move to `round`, unless frozen through it.
    pub fn tick(&mut self, round: u64) {
        if let Some(until) = self.frozen_until {
            if round < until {
                return;
            }
            self.frozen_until = None;
        }
        self.wall.set(Self::millis_at(self.spec, round));
    }

    /// Stop the clock for `rounds` rounds starting at `round`.
    pub const fn freeze(&mut self, round: u64, rounds: u64) {
        self.frozen_until = Some(round.saturating_add(rounds));
    }

    pub const fn unfreeze(&mut self) {
        self.frozen_until = None;
    }

    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen_until.is_some()
    }

    fn millis_at(spec: ClockSpec, round: u64) -> u64 {
        let progress = i128::from(spec.tick_millis) * i128::from(round);
        let drift = progress * i128::from(spec.drift_ppm) / 1_000_000;
        let millis = i128::from(spec.base_millis) + i128::from(spec.skew_millis) + progress + drift;
        u64::try_from(millis.max(0)).unwrap_or(u64::MAX)
    }
}
