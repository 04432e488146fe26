// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments and intervals.
use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;
/// The number of nanoseconds in a second.
pub const NANOS: u64 = 1_000_000_000;
/// The conversion from milliseconds to nanoseconds.
pub const NANOS_TO_MILLIS: u64 = NANOS / MILLIS;

/// A moment in time, on a monotonic clock.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self - earlier` and return as
    /// milliseconds. An `earlier` which is actually later yields zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    /// The time left from `self` until `later`, or zero if `later` has
    /// already passed.
    pub fn saturating_until(&self, later: Moment) -> Duration {
        later.inner.saturating_duration_since(self.inner)
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}

// Periodic work in the kernel is only supported at a 10ms resolution;
// the sweep interval keeps to the same contract.
const PERIODIC_RESOLUTION_IN_NANOS: u64 = 10 * NANOS_TO_MILLIS;

/// An interval between runs of periodic work.
///
/// Always a non-zero multiple of 10ms.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interval(u64);

impl Interval {
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub const fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Build an interval from a millisecond count, as found in
    /// configuration.
    pub const fn from_millis(ms: u64) -> Option<Self> {
        let nanos = ms.saturating_mul(NANOS_TO_MILLIS);

        if nanos == 0 || nanos % PERIODIC_RESOLUTION_IN_NANOS != 0 {
            return None;
        }

        Some(Self(nanos))
    }

    pub const fn from_duration(dur: Duration) -> Self {
        let secs = dur.as_secs();
        let nanos = dur.subsec_nanos() as u64;

        assert!(
            nanos % PERIODIC_RESOLUTION_IN_NANOS == 0,
            "interval is not multiple of 10ms"
        );

        Self((secs * NANOS) + nanos)
    }
}
