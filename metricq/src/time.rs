//! Nanosecond-precision time primitives shared by every role.
//!
//! [`Timestamp`] and [`Timedelta`] wrap a plain `i64` count of nanoseconds and
//! never widen to floating point except at the explicit `.s`/`.ms`/`.us`
//! accessors, so chunk encoding and decoding stay exact.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// A point in time: nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

/// A signed duration in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timedelta(i64);

#[derive(Error, Debug)]
pub enum DurationParseError {
    #[error("invalid duration string {0:?}, expected \"<number> <unit>\"")]
    Malformed(String),
    #[error("invalid duration unit {0:?}")]
    UnknownUnit(String),
    #[error("invalid numeric duration value in {0:?}")]
    InvalidNumber(String),
}

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Constructs a timestamp from a raw nanosecond count.
    pub const fn from_ns(posix_ns: i64) -> Self {
        Timestamp(posix_ns)
    }

    pub fn from_posix_seconds(seconds: f64) -> Self {
        Timestamp((seconds * 1e9) as i64)
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch");
        Timestamp(since_epoch.as_nanos() as i64)
    }

    pub const fn posix_ns(self) -> i64 {
        self.0
    }

    pub fn posix_us(self) -> f64 {
        self.0 as f64 / 1e3
    }

    pub fn posix_ms(self) -> f64 {
        self.0 as f64 / 1e6
    }

    pub fn posix(self) -> f64 {
        self.0 as f64 / 1e9
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Add<Timedelta> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Timedelta) -> Timestamp {
        Timestamp(self.0 + rhs.0)
    }
}

impl Sub<Timedelta> for Timestamp {
    type Output = Timestamp;
    fn sub(self, rhs: Timedelta) -> Timestamp {
        Timestamp(self.0 - rhs.0)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Timedelta;
    fn sub(self, rhs: Timestamp) -> Timedelta {
        Timedelta(self.0 - rhs.0)
    }
}

impl Timedelta {
    pub const ZERO: Timedelta = Timedelta(0);

    pub const fn from_ns(ns: i64) -> Self {
        Timedelta(ns)
    }

    pub fn from_us(value: f64) -> Self {
        Timedelta((value * 1e3) as i64)
    }

    pub fn from_ms(value: f64) -> Self {
        Timedelta((value * 1e6) as i64)
    }

    pub fn from_s(value: f64) -> Self {
        Timedelta((value * 1e9) as i64)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Timedelta(duration.as_nanos() as i64)
    }

    /// Parses strings of the form `"10s"`, `"500 ms"`, `"2h"`, `"3 d"`, or a
    /// bare number (interpreted as seconds), matching the broker-side
    /// configuration format.
    pub fn from_str_duration(input: &str) -> Result<Self, DurationParseError> {
        let trimmed = input.trim();
        let split_at = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ',' || c == '+' || c == '-'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split_at);
        if number.is_empty() {
            return Err(DurationParseError::Malformed(input.to_string()));
        }
        let value: f64 = number
            .replace(',', ".")
            .parse()
            .map_err(|_| DurationParseError::InvalidNumber(input.to_string()))?;
        let unit = unit.trim();
        let ns = match unit {
            "" | "s" | "second" | "seconds" => value * 1_000_000_000.0,
            "ms" | "millisecond" | "milliseconds" => value * 1_000_000.0,
            "us" | "microsecond" | "microseconds" => value * 1_000.0,
            "ns" | "nanosecond" | "nanoseconds" => value,
            "min" | "minute" | "minutes" => value * 1_000_000_000.0 * 60.0,
            "h" | "hour" | "hours" => value * 1_000_000_000.0 * 3600.0,
            "d" | "day" | "days" => value * 1_000_000_000.0 * 3600.0 * 24.0,
            other => return Err(DurationParseError::UnknownUnit(other.to_string())),
        };
        Ok(Timedelta(ns as i64))
    }

    pub const fn ns(self) -> i64 {
        self.0
    }

    pub fn us(self) -> f64 {
        self.0 as f64 / 1e3
    }

    pub fn ms(self) -> f64 {
        self.0 as f64 / 1e6
    }

    pub fn s(self) -> f64 {
        self.0 as f64 / 1e9
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0.unsigned_abs())
    }
}

impl fmt::Display for Timedelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.s())
    }
}

impl Add for Timedelta {
    type Output = Timedelta;
    fn add(self, rhs: Timedelta) -> Timedelta {
        Timedelta(self.0 + rhs.0)
    }
}

impl Sub for Timedelta {
    type Output = Timedelta;
    fn sub(self, rhs: Timedelta) -> Timedelta {
        Timedelta(self.0 - rhs.0)
    }
}

impl Mul<i64> for Timedelta {
    type Output = Timedelta;
    fn mul(self, factor: i64) -> Timedelta {
        Timedelta(self.0 * factor)
    }
}

impl Div<i64> for Timedelta {
    type Output = Timedelta;
    fn div(self, factor: i64) -> Timedelta {
        Timedelta(self.0 / factor)
    }
}

/// A single `(timestamp, value)` sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeValue {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl TimeValue {
    pub const fn new(timestamp: Timestamp, value: f64) -> Self {
        TimeValue { timestamp, value }
    }
}

/// A pre-aggregated window `(timestamp, min, max, sum, count, integral, active_time)`.
///
/// `mean` prefers the integral-weighted average when the window covered any
/// active time, and falls back to the plain arithmetic mean otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeAggregate {
    pub timestamp: Timestamp,
    pub minimum: f64,
    pub maximum: f64,
    pub sum: f64,
    pub count: i64,
    pub integral: f64,
    pub active_time: Timedelta,
}

impl TimeAggregate {
    pub fn from_value(timestamp: Timestamp, value: f64) -> Self {
        TimeAggregate {
            timestamp,
            minimum: value,
            maximum: value,
            sum: value,
            count: 1,
            integral: 0.0,
            active_time: Timedelta::ZERO,
        }
    }

    /// Builds a one-sample aggregate spanning from `timestamp_before` to
    /// `timestamp`, as used when re-projecting a plain value timeline into
    /// aggregates.
    ///
    /// Panics if `timestamp <= timestamp_before`: callers only ever see
    /// strictly increasing timestamps within one metric's timeline.
    pub fn from_value_pair(timestamp_before: Timestamp, timestamp: Timestamp, value: f64) -> Self {
        assert!(timestamp > timestamp_before);
        let delta = timestamp - timestamp_before;
        TimeAggregate {
            timestamp: timestamp_before,
            minimum: value,
            maximum: value,
            sum: value,
            count: 1,
            integral: delta.ns() as f64 * value,
            active_time: delta,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.active_time.ns() > 0 {
            self.mean_integral()
        } else {
            self.mean_sum()
        }
    }

    pub fn mean_integral(&self) -> f64 {
        self.integral / self.active_time.ns() as f64
    }

    pub fn mean_sum(&self) -> f64 {
        self.sum / self.count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timedelta_parses_units() {
        assert_eq!(Timedelta::from_str_duration("10s").unwrap(), Timedelta::from_s(10.0));
        assert_eq!(Timedelta::from_str_duration("500ms").unwrap(), Timedelta::from_ms(500.0));
        assert_eq!(Timedelta::from_str_duration("2 h").unwrap(), Timedelta::from_s(2.0 * 3600.0));
        assert_eq!(Timedelta::from_str_duration("3d").unwrap(), Timedelta::from_s(3.0 * 86400.0));
        assert_eq!(Timedelta::from_str_duration("42").unwrap(), Timedelta::from_s(42.0));
    }

    #[test]
    fn timedelta_rejects_unknown_unit() {
        assert!(matches!(
            Timedelta::from_str_duration("10 fortnights"),
            Err(DurationParseError::UnknownUnit(_))
        ));
    }

    #[test]
    fn timestamp_arithmetic_round_trips() {
        let t0 = Timestamp::from_ns(1_000);
        let t1 = t0 + Timedelta::from_ns(500);
        assert_eq!(t1.posix_ns(), 1_500);
        assert_eq!(t1 - t0, Timedelta::from_ns(500));
    }

    #[test]
    fn aggregate_mean_prefers_integral_when_active() {
        let agg = TimeAggregate::from_value_pair(
            Timestamp::from_ns(0),
            Timestamp::from_ns(1_000_000_000),
            2.0,
        );
        assert_eq!(agg.mean(), 2.0);
        assert_eq!(agg.active_time, Timedelta::from_s(1.0));
    }

    #[test]
    fn aggregate_mean_falls_back_to_sum_without_active_time() {
        let agg = TimeAggregate::from_value(Timestamp::from_ns(0), 4.0);
        assert_eq!(agg.mean(), agg.mean_sum());
    }
}
