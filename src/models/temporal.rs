//! Bitemporal types for state versioning.
//!
//! Each state of an entity carries two independent time dimensions:
//!
//! | Dimension | Question Answered | Field |
//! |-----------|-------------------|-------|
//! | **Valid Time** | When was this snapshot true in the real world? | [`Validity`] |
//! | **Transaction Time** | When was this snapshot written? | `State::recorded_at` |
//!
//! # Valid Time Semantics
//!
//! Validity is the half-open interval `[start, end)`. An open `end` marks the
//! current state. The validity intervals of one entity partition time from the
//! entity's creation onwards: writing a new state closes the current interval
//! at the new state's start.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use versioned_kg::models::temporal::Validity;
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let t1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
//!
//! let first = Validity::open(t0);
//! assert!(first.is_current());
//!
//! let closed = first.close_at(t1);
//! assert!(closed.contains(t0));
//! assert!(!closed.contains(t1));
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instant on the valid-time and transaction-time axes.
pub type Timestamp = DateTime<Utc>;

/// Wire format of timestamps inside versioner queries.
pub const VERSIONER_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Half-open validity interval `[start, end)` of one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validity {
    /// Start of validity (inclusive).
    pub start: Timestamp,
    /// End of validity (exclusive), `None` while the state is current.
    pub end: Option<Timestamp>,
}

impl Validity {
    /// Creates an open-ended interval starting at `start`.
    #[must_use]
    pub const fn open(start: Timestamp) -> Self {
        Self { start, end: None }
    }

    /// Creates a closed interval.
    #[must_use]
    pub const fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Checks if the instant falls within this interval.
    ///
    /// Uses half-open interval semantics: `[start, end)`.
    #[must_use]
    pub fn contains(&self, at: Timestamp) -> bool {
        at >= self.start && self.end.is_none_or(|end| at < end)
    }

    /// Returns `true` while the interval is open-ended.
    #[must_use]
    pub const fn is_current(&self) -> bool {
        self.end.is_none()
    }

    /// Ends this interval at the given instant.
    #[must_use]
    pub const fn close_at(self, end: Timestamp) -> Self {
        Self {
            start: self.start,
            end: Some(end),
        }
    }

    /// Returns `true` if the two intervals share at least one instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let starts_before_other_ends = other.end.is_none_or(|end| self.start < end);
        let other_starts_before_end = self.end.is_none_or(|end| other.start < end);
        starts_before_other_ends && other_starts_before_end
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", format_timestamp(self.start), format_timestamp(end)),
            None => write!(f, "[{}, now)", format_timestamp(self.start)),
        }
    }
}

/// Formats an instant the way versioner queries expect it.
#[must_use]
pub fn format_timestamp(at: Timestamp) -> String {
    at.naive_utc().format(VERSIONER_DATE_FORMAT).to_string()
}

/// Parses a timestamp from common textual forms.
///
/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` (read as UTC, with
/// `T` or a space as separator) and bare dates (midnight UTC).
///
/// # Errors
///
/// Returns [`crate::Error::InvalidInput`] if no form matches.
pub fn parse_timestamp(s: &str) -> crate::Result<Timestamp> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| crate::Error::InvalidInput(format!("unparsable timestamp: {s}")))
}

/// Converts an instant to microseconds since the Unix epoch.
#[must_use]
pub fn to_micros(at: Timestamp) -> i64 {
    at.timestamp_micros()
}

/// Converts microseconds since the Unix epoch back to an instant.
#[must_use]
pub fn from_micros(micros: i64) -> Option<Timestamp> {
    DateTime::from_timestamp_micros(micros)
}

/// Returns the current instant truncated to microsecond precision.
///
/// Stores keep microseconds, so truncating here makes freshly written
/// timestamps compare equal to their stored form.
#[must_use]
pub fn now() -> Timestamp {
    let now = Utc::now();
    from_micros(to_micros(now)).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_half_open_contains() {
        let v = Validity::between(at(1), at(5));
        assert!(v.contains(at(1)));
        assert!(v.contains(at(4)));
        assert!(!v.contains(at(5)));
        assert!(!v.contains(at(1) - Duration::microseconds(1)));
    }

    #[test]
    fn test_open_interval() {
        let v = Validity::open(at(3));
        assert!(v.is_current());
        assert!(v.contains(at(30)));
        assert!(!v.close_at(at(4)).is_current());
    }

    #[test]
    fn test_adjacent_intervals_do_not_overlap() {
        let a = Validity::between(at(1), at(5));
        let b = Validity::open(at(5));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(Validity::between(at(1), at(6)).overlaps(&b));
    }

    #[test]
    fn test_format_and_parse() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap();
        assert_eq!(format_timestamp(t), "2024-03-09T12:30:05.000000");
        assert_eq!(parse_timestamp("2024-03-09T12:30:05.000000").unwrap(), t);
        assert_eq!(parse_timestamp("2024-03-09T12:30:05Z").unwrap(), t);
        assert_eq!(parse_timestamp("2024-03-09 12:30:05").unwrap(), t);
        assert_eq!(
            parse_timestamp("2024-03-09").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_micros_roundtrip_truncates() {
        let t = now();
        assert_eq!(from_micros(to_micros(t)), Some(t));
    }
}
