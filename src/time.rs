//! Simulated-clock values.
//!
//! The simulator's clock is monotonic and microsecond-resolution; [`SimTime`]
//! is an instant on that clock.  Script-facing deadlines (`TIMEOUT(ms)`) are
//! expressed in milliseconds, so both unit views are provided.

use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// An instant on the simulated clock, in microseconds since simulation start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(u64);

impl SimTime {
    /// Simulation start.
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Saturates at the end of the clock's range.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms.saturating_mul(1_000))
    }

    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Whole milliseconds (truncating).
    pub fn as_millis(self) -> u64 {
        self.0 / 1_000
    }

    /// Simulated time elapsed since `earlier`, saturating at zero.
    pub fn since(self, earlier: SimTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    /// Saturates at the end of the clock's range.
    fn add(self, rhs: Duration) -> SimTime {
        let us = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        SimTime(self.0.saturating_add(us))
    }
}

impl fmt::Display for SimTime {
    /// Seconds with millisecond precision, e.g. `12.345s`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.as_millis();
        write!(f, "{}.{:03}s", ms / 1_000, ms % 1_000)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_micros_roundtrip() {
        let t = SimTime::from_millis(1_500);
        assert_eq!(t.as_micros(), 1_500_000);
        assert_eq!(t.as_millis(), 1_500);
        assert_eq!(SimTime::from_micros(1_500_000), t);
    }

    #[test]
    fn arithmetic_saturates_at_the_clock_edge() {
        let far = SimTime::from_millis(u64::MAX);
        assert_eq!(far.as_micros(), u64::MAX);
        assert_eq!(far + Duration::from_secs(1), far);
    }

    #[test]
    fn add_duration() {
        let t = SimTime::from_millis(100) + Duration::from_millis(400);
        assert_eq!(t, SimTime::from_millis(500));
    }

    #[test]
    fn since_saturates() {
        let a = SimTime::from_millis(100);
        let b = SimTime::from_millis(300);
        assert_eq!(b.since(a), Duration::from_millis(200));
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn display_format() {
        assert_eq!(SimTime::from_millis(12_345).to_string(), "12.345s");
        assert_eq!(SimTime::ZERO.to_string(), "0.000s");
    }
}
