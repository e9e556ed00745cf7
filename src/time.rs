// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Timestamp arithmetic. Timestamps are microseconds on an arbitrary
//! per-host origin; QoS bounds, intervals and deadlines are expressed in
//! `Units` of `USECS_PER_UNIT` microseconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Microseconds per time unit.
pub const USECS_PER_UNIT: u64 = 1000;

/// Interval or duration measured in time units.
pub type Units = u64;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_micros(us: u64) -> Self {
        Timestamp(us)
    }

    pub fn from_units(u: Units) -> Self {
        Timestamp(u.saturating_mul(USECS_PER_UNIT))
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    /// The zero timestamp doubles as "unset".
    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    pub fn add_units(self, u: Units) -> Self {
        Timestamp(self.0.saturating_add(u.saturating_mul(USECS_PER_UNIT)))
    }

    pub fn sub_units(self, u: Units) -> Self {
        Timestamp(self.0.saturating_sub(u.saturating_mul(USECS_PER_UNIT)))
    }

    pub fn add_micros(self, us: u64) -> Self {
        Timestamp(self.0.saturating_add(us))
    }

    /// Signed difference `self - earlier` in microseconds. Remote clocks are
    /// not synchronised, so this is negative often enough to matter.
    pub fn delta(self, earlier: Timestamp) -> i64 {
        (self.0 as i128 - earlier.0 as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Whole units elapsed since `earlier`, saturating at zero.
    pub fn units_since(self, earlier: Timestamp) -> Units {
        self.0.saturating_sub(earlier.0) / USECS_PER_UNIT
    }

    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Offset by a signed number of microseconds, clamped to the valid range.
    pub fn offset(self, us: i64) -> Self {
        let v = self.0 as i128 + us as i128;
        Timestamp(v.clamp(0, u64::MAX as i128) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

pub fn units_to_micros(u: Units) -> u64 {
    u.saturating_mul(USECS_PER_UNIT)
}

/// Converts a signed microsecond quantity into fractional units.
pub fn micros_to_units_f64(us: i64) -> f64 {
    us as f64 / USECS_PER_UNIT as f64
}
