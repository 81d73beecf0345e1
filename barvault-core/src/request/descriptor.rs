//! Raw request parameters and their normalized form.

use crate::domain::Interval;
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::key::{CanonicalKey, RangeBucket};

/// Exchanges queried when the caller does not name one.
pub const DEFAULT_EXCHANGES: [&str; 2] = ["NSE", "BSE"];

/// Parameters as they arrive from the transport layer, unvalidated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRequest {
    pub instrument: Option<String>,
    /// Single exchange or comma-separated list.
    pub exchange: Option<String>,
    pub interval: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub indicators: Vec<String>,
    /// Restrict the result to the first minutes of the session.
    pub first_window: bool,
}

/// Requested time span, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// True if `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &DateRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// True if `ts` lies inside this range, bounds included.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Span in fractional days.
    pub fn span_days(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 86_400_000.0
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Normalized, upper-cased, de-duplicated set of exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeSet(BTreeSet<String>);

impl ExchangeSet {
    /// Parse a comma-separated list. Blank input yields the default pair.
    pub fn parse(raw: Option<&str>) -> Self {
        let set: BTreeSet<String> = raw
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if set.is_empty() {
            Self::default()
        } else {
            Self(set)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Comma-joined form passed to the data source.
    pub fn to_arg(&self) -> String {
        self.iter().collect::<Vec<_>>().join(",")
    }
}

impl Default for ExchangeSet {
    fn default() -> Self {
        Self(DEFAULT_EXCHANGES.iter().map(|s| s.to_string()).collect())
    }
}

/// A validated request. Construct via [`RequestDescriptor::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub instrument: String,
    pub exchanges: ExchangeSet,
    pub interval: Interval,
    pub range: Option<DateRange>,
    pub first_window: bool,
    /// Sorted, de-duplicated indicator names.
    pub indicators: Vec<String>,
}

impl RequestDescriptor {
    /// Validate and normalize raw parameters.
    pub fn normalize(raw: &RawRequest) -> Result<Self, ValidationError> {
        let instrument = raw
            .instrument
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingInstrument)?
            .to_string();

        let interval: Interval = raw
            .interval
            .as_deref()
            .ok_or(ValidationError::MissingInterval)?
            .parse()
            .map_err(|_| ValidationError::MissingInterval)?;

        let range = match (raw.start, raw.end) {
            (Some(start), Some(end)) => {
                if start >= end {
                    return Err(ValidationError::StartNotBeforeEnd);
                }
                let range = DateRange { start, end };
                let max_days = interval.max_span_days();
                if range.span_days() > max_days as f64 {
                    return Err(ValidationError::RangeTooLarge {
                        interval: interval.to_string(),
                        max_days,
                    });
                }
                Some(range)
            }
            (None, None) => None,
            _ => return Err(ValidationError::IncompleteRange),
        };

        let indicators: BTreeSet<String> = raw
            .indicators
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            instrument,
            exchanges: ExchangeSet::parse(raw.exchange.as_deref()),
            interval,
            range,
            first_window: raw.first_window,
            indicators: indicators.into_iter().collect(),
        })
    }

    /// Cache and coalescing identity of this request.
    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey {
            instrument: self.instrument.clone(),
            interval: self.interval.clone(),
            exchanges: self.exchanges.clone(),
            range: match self.range {
                Some(r) => RangeBucket::Explicit(r),
                None => RangeBucket::All,
            },
            first_window: self.first_window,
            indicators: self.indicators.clone(),
        }
    }
}
