//! Lexicographically sortable causal timestamps.
//!
//! # Text format
//!
//! ```text
//! VVVVVV-WWWWWWWWWWWWW-CCCCCC-<replica>
//! ```
//!
//! - `V`: schema version active when the timestamp was minted (6 digits)
//! - `W`: hybrid wall-clock milliseconds since the Unix epoch (13 digits)
//! - `C`: per-millisecond logical counter (6 digits)
//! - `replica`: the minting replica's id (empty for [`Timestamp::zero`])
//!
//! Every numeric field is zero-padded to a fixed width, so comparing two
//! encoded timestamps as strings gives the same answer as comparing the
//! parsed structs. Stores rely on this to filter by timestamp in SQL.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ClockError, ReplicaId};

/// Largest schema version representable in the text encoding.
pub const MAX_VERSION: u32 = 999_999;
/// Largest wall-clock value representable in the text encoding.
pub const MAX_WALL_MS: u64 = 9_999_999_999_999;
/// Largest per-millisecond counter before the wall component is bumped.
pub const MAX_COUNTER: u32 = 999_999;

const VERSION_WIDTH: usize = 6;
const WALL_WIDTH: usize = 13;
const COUNTER_WIDTH: usize = 6;

/// A causal timestamp.
///
/// Field order matters: the derived `Ord` compares version, then wall time,
/// then counter, then replica, which is exactly the order of the text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    version: u32,
    wall_ms: u64,
    counter: u32,
    replica: String,
}

impl Timestamp {
    /// Build a timestamp from its components.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::OutOfRange`] when a component does not fit the
    /// fixed-width encoding.
    pub fn new(
        version: u32,
        wall_ms: u64,
        counter: u32,
        replica: &ReplicaId,
    ) -> Result<Self, ClockError> {
        check_range(version, wall_ms, counter)?;
        Ok(Self {
            version,
            wall_ms,
            counter,
            replica: replica.as_str().to_string(),
        })
    }

    /// The lowest timestamp for `version`.
    ///
    /// Used to tag seed and migration-authored data so it sorts before every
    /// organically minted timestamp of the same version. All replicas produce
    /// the identical zero timestamp, which keeps migration output idempotent.
    #[must_use]
    pub fn zero(version: u32) -> Self {
        Self {
            version: version.min(MAX_VERSION),
            wall_ms: 0,
            counter: 0,
            replica: String::new(),
        }
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub const fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    #[must_use]
    pub const fn counter(&self) -> u32 {
        self.counter
    }

    /// Replica discriminator; empty for zero timestamps.
    #[must_use]
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// True for timestamps produced by [`Timestamp::zero`].
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.wall_ms == 0 && self.counter == 0 && self.replica.is_empty()
    }

    /// Encode to the canonical sortable text form.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{:0vw$}-{:0ww$}-{:0cw$}-{}",
            self.version,
            self.wall_ms,
            self.counter,
            self.replica,
            vw = VERSION_WIDTH,
            ww = WALL_WIDTH,
            cw = COUNTER_WIDTH,
        )
    }

    /// Parse the canonical text form.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Malformed`] if the text is not a valid
    /// timestamp. Non-canonical encodings (wrong field widths) are rejected
    /// because they would break string ordering.
    pub fn parse(raw: &str) -> Result<Self, ClockError> {
        let malformed = |reason: &str| ClockError::Malformed {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = raw.splitn(4, '-');
        let version = parts.next().ok_or_else(|| malformed("missing version"))?;
        let wall = parts.next().ok_or_else(|| malformed("missing wall time"))?;
        let counter = parts.next().ok_or_else(|| malformed("missing counter"))?;
        let replica = parts.next().ok_or_else(|| malformed("missing replica"))?;

        let version = parse_fixed(version, VERSION_WIDTH).ok_or_else(|| malformed("bad version"))?;
        let wall_ms = parse_fixed(wall, WALL_WIDTH).ok_or_else(|| malformed("bad wall time"))?;
        let counter = parse_fixed(counter, COUNTER_WIDTH).ok_or_else(|| malformed("bad counter"))?;

        if !replica.is_empty() && !ReplicaId::is_valid(replica) {
            return Err(malformed("bad replica id"));
        }
        if replica.is_empty() && (wall_ms != 0 || counter != 0) {
            return Err(malformed("only zero timestamps may omit the replica"));
        }

        Ok(Self {
            version: u32::try_from(version).map_err(|_| malformed("bad version"))?,
            wall_ms,
            counter: u32::try_from(counter).map_err(|_| malformed("bad counter"))?,
            replica: replica.to_string(),
        })
    }
}

fn check_range(version: u32, wall_ms: u64, counter: u32) -> Result<(), ClockError> {
    if version > MAX_VERSION {
        return Err(ClockError::OutOfRange("version", u64::from(version)));
    }
    if wall_ms > MAX_WALL_MS {
        return Err(ClockError::OutOfRange("wall_ms", wall_ms));
    }
    if counter > MAX_COUNTER {
        return Err(ClockError::OutOfRange("counter", u64::from(counter)));
    }
    Ok(())
}

fn parse_fixed(raw: &str, width: usize) -> Option<u64> {
    if raw.len() != width || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.wall_ms.cmp(&other.wall_ms))
            .then(self.counter.cmp(&other.counter))
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Timestamp {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = ClockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.encode()
    }
}
