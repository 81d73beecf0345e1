//! Canonical key: the shared identity for caching and coalescing.
//!
//! Two descriptors that would produce identical output map to the same key.
//! Exchange sets and indicator lists are already normalized by the time a
//! key is built, so equality here is plain structural equality.

use crate::domain::Interval;
use serde::{Serialize, Serializer};
use std::fmt;

use super::descriptor::{DateRange, ExchangeSet};

/// The time component of a key: an explicit range or the "all data" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeBucket {
    Explicit(DateRange),
    All,
}

/// Deterministic identity derived from a [`super::RequestDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    pub instrument: String,
    pub interval: Interval,
    pub exchanges: ExchangeSet,
    pub range: RangeBucket,
    pub first_window: bool,
    pub indicators: Vec<String>,
}

impl CanonicalKey {
    /// Short BLAKE3 fingerprint of the rendered key, used as a log field.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.to_string().as_bytes());
        hash.to_hex()[..12].to_string()
    }

    /// True if both keys describe the same series and differ at most in range.
    pub fn same_series(&self, other: &CanonicalKey) -> bool {
        self.instrument == other.instrument
            && self.interval == other.interval
            && self.exchanges == other.exchanges
            && self.first_window == other.first_window
            && self.indicators == other.indicators
    }

    /// The explicit range of this key, if any.
    pub fn requested_range(&self) -> Option<DateRange> {
        match self.range {
            RangeBucket::Explicit(r) => Some(r),
            RangeBucket::All => None,
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_",
            self.instrument,
            self.interval,
            self.exchanges.iter().collect::<Vec<_>>().join("-")
        )?;
        match self.range {
            RangeBucket::Explicit(r) => write!(
                f,
                "{}-{}",
                r.start.timestamp_millis(),
                r.end.timestamp_millis()
            )?,
            RangeBucket::All => f.write_str("all")?,
        }
        if self.first_window {
            f.write_str("_first15")?;
        }
        if !self.indicators.is_empty() {
            write!(f, "_{}", self.indicators.join(","))?;
        }
        Ok(())
    }
}

impl Serialize for CanonicalKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
