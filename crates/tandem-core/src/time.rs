//! Logical simulation time.
//!
//! [`LogicalTime`] is both an instant ("time since simulation start") and
//! a duration, exactly like the kernel's own clock. The resolution is
//! fixed at one picosecond. Time never moves backwards, and none of the
//! arithmetic here can panic: additions saturate at [`LogicalTime::MAX`],
//! which doubles as "never".

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// Picoseconds per nanosecond.
const PS_PER_NS: u64 = 1_000;
/// Picoseconds per microsecond.
const PS_PER_US: u64 = 1_000_000;
/// Picoseconds per millisecond.
const PS_PER_MS: u64 = 1_000_000_000;
/// Picoseconds per second.
const PS_PER_S: u64 = 1_000_000_000_000;

/// A point in (or span of) simulated time, in picoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// The start of simulation, and the empty duration.
    pub const ZERO: LogicalTime = LogicalTime(0);

    /// The largest representable time. Used as "never" / "no limit".
    pub const MAX: LogicalTime = LogicalTime(u64::MAX);

    /// Create a time from raw resolution units (picoseconds).
    #[inline]
    pub const fn new(ps: u64) -> Self {
        Self(ps)
    }

    /// Create a time from picoseconds.
    #[inline]
    pub const fn from_ps(ps: u64) -> Self {
        Self(ps)
    }

    /// Create a time from nanoseconds, saturating on overflow.
    #[inline]
    pub const fn from_ns(ns: u64) -> Self {
        Self(ns.saturating_mul(PS_PER_NS))
    }

    /// Create a time from microseconds, saturating on overflow.
    #[inline]
    pub const fn from_us(us: u64) -> Self {
        Self(us.saturating_mul(PS_PER_US))
    }

    /// Create a time from milliseconds, saturating on overflow.
    #[inline]
    pub const fn from_ms(ms: u64) -> Self {
        Self(ms.saturating_mul(PS_PER_MS))
    }

    /// Create a time from whole seconds, saturating on overflow.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(PS_PER_S))
    }

    /// Convert a wall-clock span, saturating on overflow.
    pub fn from_duration(d: Duration) -> Self {
        let ps = d.as_nanos().saturating_mul(u128::from(PS_PER_NS));
        Self(u64::try_from(ps).unwrap_or(u64::MAX))
    }

    /// Raw value in picoseconds.
    #[inline]
    pub const fn as_ps(self) -> u64 {
        self.0
    }

    /// Whether this is [`LogicalTime::ZERO`].
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whether this is [`LogicalTime::MAX`].
    #[inline]
    pub const fn is_max(self) -> bool {
        self.0 == u64::MAX
    }

    /// Checked addition. Returns `None` on overflow.
    #[inline]
    pub fn checked_add(self, rhs: LogicalTime) -> Option<LogicalTime> {
        self.0.checked_add(rhs.0).map(LogicalTime)
    }

    /// Checked subtraction. Returns `None` if `rhs > self`.
    #[inline]
    pub fn checked_sub(self, rhs: LogicalTime) -> Option<LogicalTime> {
        self.0.checked_sub(rhs.0).map(LogicalTime)
    }

    /// Saturating addition, clamped at [`LogicalTime::MAX`].
    #[inline]
    pub const fn saturating_add(self, rhs: LogicalTime) -> LogicalTime {
        LogicalTime(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction, clamped at [`LogicalTime::ZERO`].
    #[inline]
    pub const fn saturating_sub(self, rhs: LogicalTime) -> LogicalTime {
        LogicalTime(self.0.saturating_sub(rhs.0))
    }

    /// Saturating multiplication by an integer factor.
    #[inline]
    pub const fn saturating_mul(self, factor: u64) -> LogicalTime {
        LogicalTime(self.0.saturating_mul(factor))
    }

    /// Span from `earlier` to `self`, or `None` if `earlier` is later.
    #[inline]
    pub fn duration_since(self, earlier: LogicalTime) -> Option<LogicalTime> {
        self.checked_sub(earlier)
    }
}

impl Add for LogicalTime {
    type Output = LogicalTime;

    /// Saturating: `MAX + x == MAX`.
    #[inline]
    fn add(self, rhs: LogicalTime) -> LogicalTime {
        self.saturating_add(rhs)
    }
}

impl AddAssign for LogicalTime {
    #[inline]
    fn add_assign(&mut self, rhs: LogicalTime) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub for LogicalTime {
    type Output = LogicalTime;

    /// Saturating: never goes below zero.
    #[inline]
    fn sub(self, rhs: LogicalTime) -> LogicalTime {
        self.saturating_sub(rhs)
    }
}

impl From<u64> for LogicalTime {
    fn from(ps: u64) -> Self {
        Self(ps)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            return write!(f, "never");
        }
        let ps = self.0;
        if ps == 0 {
            return write!(f, "0 s");
        }
        // Largest unit that represents the value exactly.
        let units = [
            (PS_PER_S, "s"),
            (PS_PER_MS, "ms"),
            (PS_PER_US, "us"),
            (PS_PER_NS, "ns"),
        ];
        for (scale, suffix) in units {
            if ps % scale == 0 {
                return write!(f, "{} {suffix}", ps / scale);
            }
        }
        write!(f, "{ps} ps")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unit_constructors_agree() {
        assert_eq!(LogicalTime::from_ns(1), LogicalTime::from_ps(1_000));
        assert_eq!(LogicalTime::from_us(1), LogicalTime::from_ns(1_000));
        assert_eq!(LogicalTime::from_ms(1), LogicalTime::from_us(1_000));
        assert_eq!(LogicalTime::from_secs(1), LogicalTime::from_ms(1_000));
    }

    #[test]
    fn wall_clock_spans_convert() {
        assert_eq!(
            LogicalTime::from_duration(Duration::from_micros(3)),
            LogicalTime::from_us(3)
        );
        assert_eq!(
            LogicalTime::from_duration(Duration::from_secs(u64::MAX)),
            LogicalTime::MAX
        );
    }

    #[test]
    fn add_saturates_at_max() {
        assert_eq!(LogicalTime::MAX + LogicalTime::new(1), LogicalTime::MAX);
        assert_eq!(LogicalTime::from_secs(u64::MAX), LogicalTime::MAX);
    }

    #[test]
    fn sub_saturates_at_zero() {
        assert_eq!(LogicalTime::new(3) - LogicalTime::new(5), LogicalTime::ZERO);
        assert_eq!(
            LogicalTime::new(3).checked_sub(LogicalTime::new(5)),
            None
        );
    }

    #[test]
    fn duration_since_orders() {
        let a = LogicalTime::new(10);
        let b = LogicalTime::new(30);
        assert_eq!(b.duration_since(a), Some(LogicalTime::new(20)));
        assert_eq!(a.duration_since(b), None);
    }

    #[test]
    fn display_picks_exact_unit() {
        assert_eq!(LogicalTime::ZERO.to_string(), "0 s");
        assert_eq!(LogicalTime::from_ms(20).to_string(), "20 ms");
        assert_eq!(LogicalTime::from_ns(1_500).to_string(), "1500 ns");
        assert_eq!(LogicalTime::new(7).to_string(), "7 ps");
        assert_eq!(LogicalTime::MAX.to_string(), "never");
    }

    proptest! {
        #[test]
        fn add_then_sub_roundtrips_without_overflow(a in 0u64..u64::MAX / 2, b in 0u64..u64::MAX / 2) {
            let sum = LogicalTime::new(a) + LogicalTime::new(b);
            prop_assert_eq!(sum - LogicalTime::new(b), LogicalTime::new(a));
            prop_assert!(sum >= LogicalTime::new(a));
        }
    }
}
