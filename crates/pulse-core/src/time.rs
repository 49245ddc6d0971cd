// SPDX-License-Identifier: Apache-2.0

//! Engine time: the discrete evaluation timeline.
//!
//! [`EngineTime`] is a logical timestamp in nanoseconds since the engine
//! epoch. Every engine cycle runs at exactly one `EngineTime`; two cycles
//! never share a timestamp, which is what makes "modified this cycle" a
//! simple stamp comparison.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Nanosecond timestamp on the engine's evaluation timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineTime(u64);

impl EngineTime {
    /// The engine epoch. Also doubles as the "never written" stamp on
    /// outputs, which is why cycle times are always strictly positive.
    pub const ZERO: EngineTime = EngineTime(0);

    /// The largest representable time; used as an "end of time" bound.
    pub const MAX: EngineTime = EngineTime(u64::MAX);

    /// Builds a time from raw nanoseconds since the epoch.
    #[must_use]
    pub fn from_nanos(nanos: u64) -> Self {
        EngineTime(nanos)
    }

    /// Builds a time a whole number of seconds after the epoch.
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        EngineTime(secs.saturating_mul(1_000_000_000))
    }

    /// Returns raw nanoseconds since the epoch.
    #[must_use]
    pub fn nanos(self) -> u64 {
        self.0
    }

    /// The smallest representable step after `self`, saturating at the end
    /// of time.
    #[must_use]
    pub fn next(self) -> Self {
        EngineTime(self.0.saturating_add(1))
    }

    /// Saturating addition of a duration.
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        EngineTime(self.0.saturating_add(nanos))
    }

    /// Elapsed engine time since `earlier`, or `Duration::ZERO` if `earlier`
    /// is in the future.
    #[must_use]
    pub fn since(self, earlier: EngineTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for EngineTime {
    type Output = EngineTime;

    fn add(self, d: Duration) -> EngineTime {
        self.saturating_add(d)
    }
}

impl Sub<EngineTime> for EngineTime {
    type Output = Duration;

    fn sub(self, earlier: EngineTime) -> Duration {
        self.since(earlier)
    }
}

impl fmt::Display for EngineTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}ns", self.0)
    }
}
