//! Bar interval and the per-interval lookup tables.
//!
//! Unknown interval strings are accepted and fall back to conservative
//! defaults (60s nominal duration, 30min buffer, 30 day maximum span) rather
//! than being rejected; the external source decides whether it can serve them.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar interval as understood by the external data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
    /// Any other non-empty interval string, passed through verbatim.
    Other(String),
}

impl Interval {
    pub fn as_str(&self) -> &str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
            Self::Other(s) => s,
        }
    }

    /// Nominal spacing between consecutive bars.
    pub fn nominal_duration(&self) -> Duration {
        match self {
            Self::OneMinute => Duration::seconds(60),
            Self::FiveMinutes => Duration::seconds(300),
            Self::FifteenMinutes => Duration::seconds(900),
            Self::OneHour => Duration::seconds(3_600),
            Self::OneDay => Duration::seconds(86_400),
            Self::Other(_) => Duration::seconds(60),
        }
    }

    /// Extra minutes requested on both sides of a ranged fetch to compensate
    /// for boundary truncation in the source.
    pub fn buffer_minutes(&self) -> i64 {
        match self {
            Self::OneMinute => 15,
            Self::FiveMinutes => 60,
            Self::FifteenMinutes => 180,
            Self::OneHour => 720,
            Self::OneDay => 1_440,
            Self::Other(_) => 30,
        }
    }

    /// Largest allowed request span in days.
    pub fn max_span_days(&self) -> i64 {
        match self {
            Self::OneMinute | Self::FiveMinutes | Self::FifteenMinutes | Self::OneHour => 365,
            Self::OneDay => 1_825,
            Self::Other(_) => 30,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an empty interval string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("interval must not be empty")]
pub struct EmptyInterval;

impl FromStr for Interval {
    type Err = EmptyInterval;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s {
            "" => return Err(EmptyInterval),
            "1m" => Self::OneMinute,
            "5m" => Self::FiveMinutes,
            "15m" => Self::FifteenMinutes,
            "1h" => Self::OneHour,
            "1d" => Self::OneDay,
            other => Self::Other(other.to_string()),
        })
    }
}

impl TryFrom<String> for Interval {
    type Error = EmptyInterval;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_str().to_string()
    }
}
