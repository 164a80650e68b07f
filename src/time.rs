//! Local-time helpers: wall-clock slots, local date keys, minute rounding.
//!
//! Rate limits are a human "per day" concept, so every date the engine
//! reasons about is a *local* calendar date in the configured zone, never a
//! UTC date. Instants are always `DateTime<Utc>` and serialize as RFC 3339.
//!
//! The zone is a [`FixedOffset`] captured from configuration (or from the
//! host at startup), so every helper here is a pure function of its inputs.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from parsing wall-clock values.
#[derive(Debug, Error, Diagnostic)]
pub enum TimeError {
    #[error("invalid time of day: \"{value}\"")]
    #[diagnostic(
        code(nudge::time::time_of_day),
        help("Times of day use 24-hour \"HH:mm\", e.g. \"09:00\" or \"18:30\".")
    )]
    InvalidTimeOfDay { value: String },

    #[error("invalid date key: \"{value}\"")]
    #[diagnostic(
        code(nudge::time::date_key),
        help("Date keys are local calendar dates formatted \"YYYY-MM-DD\".")
    )]
    InvalidDateKey { value: String },

    #[error("invalid instant: \"{value}\"")]
    #[diagnostic(
        code(nudge::time::instant),
        help("Instants are RFC 3339 timestamps, e.g. \"2026-01-01T07:00:00Z\".")
    )]
    InvalidInstant { value: String },
}

pub type TimeResult<T> = std::result::Result<T, TimeError>;

// ---------------------------------------------------------------------------
// TimeOfDay
// ---------------------------------------------------------------------------

/// A local wall-clock slot with minute precision, written `"HH:mm"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(NaiveTime::MIN);

    /// Build from hour and minute; `None` if out of range.
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    /// Parse `"HH:mm"` (a single-digit hour is accepted).
    pub fn parse(s: &str) -> TimeResult<Self> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map(Self)
            .map_err(|_| TimeError::InvalidTimeOfDay {
                value: s.to_string(),
            })
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeError;

    fn from_str(s: &str) -> TimeResult<Self> {
        Self::parse(s)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// DateKey
// ---------------------------------------------------------------------------

/// A local calendar date used as a ledger key, written `"YYYY-MM-DD"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateKey(NaiveDate);

impl DateKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn parse(s: &str) -> TimeResult<Self> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Self)
            .map_err(|_| TimeError::InvalidDateKey {
                value: s.to_string(),
            })
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl From<NaiveDate> for DateKey {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for DateKey {
    type Err = TimeError;

    fn from_str(s: &str) -> TimeResult<Self> {
        Self::parse(s)
    }
}

impl Serialize for DateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Local calendar date of an instant.
pub fn local_date(instant: DateTime<Utc>, zone: FixedOffset) -> NaiveDate {
    instant.with_timezone(&zone).date_naive()
}

/// Ledger key for the local date of an instant.
pub fn date_key(instant: DateTime<Utc>, zone: FixedOffset) -> DateKey {
    DateKey(local_date(instant, zone))
}

/// Wall-clock slot of an instant, truncated to the minute.
pub fn time_of_day_of(instant: DateTime<Utc>, zone: FixedOffset) -> TimeOfDay {
    let local = instant.with_timezone(&zone);
    TimeOfDay::from_hm(local.hour(), local.minute()).unwrap_or(TimeOfDay::MIDNIGHT)
}

/// The instant at which `time` occurs on local `date`.
pub fn local_instant(date: NaiveDate, time: TimeOfDay, zone: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(time.as_naive());
    let utc = local - Duration::seconds(i64::from(zone.local_minus_utc()));
    Utc.from_utc_datetime(&utc)
}

/// Whether `time` has already passed (or is now) on `now`'s local date.
pub fn has_local_time_passed(now: DateTime<Utc>, time: TimeOfDay, zone: FixedOffset) -> bool {
    now >= local_instant(local_date(now, zone), time, zone)
}

/// Next occurrence of `time`: today if still ahead, otherwise tomorrow.
pub fn next_local_occurrence(
    now: DateTime<Utc>,
    time: TimeOfDay,
    zone: FixedOffset,
) -> DateTime<Utc> {
    let today = local_date(now, zone);
    let candidate = local_instant(today, time, zone);
    if candidate > now {
        candidate
    } else {
        local_instant(today + Duration::days(1), time, zone)
    }
}

/// Drop seconds and sub-seconds; local notification triggers are minute-grained.
pub fn round_down_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(instant)
}

/// Parse an RFC 3339 instant.
pub fn parse_instant(s: &str) -> TimeResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimeError::InvalidInstant {
            value: s.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for the engine entry points.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
