//! Post-processing of parsed bars: sort, dedupe, first-window clip, gap scan.
//!
//! Every step is total and leaves its input untouched. Running the whole
//! pipeline on its own output yields the same bars.

use crate::domain::{Bar, Gap};
use crate::request::RequestDescriptor;
use chrono::Duration;

use super::gaps::detect_gaps;

/// Length of the opening window kept when the first-window flag is set.
pub const FIRST_WINDOW_MINUTES: i64 = 15;

/// Post-processed series plus the gaps found in it.
#[derive(Debug, Clone, Default)]
pub struct Processed {
    pub bars: Vec<Bar>,
    pub gaps: Vec<Gap>,
}

/// Canonicalizer for bar data
pub struct Canonicalizer;

impl Canonicalizer {
    /// Sort ascending by timestamp and keep the first bar of each timestamp.
    ///
    /// The sort is stable, so "first" means first in source order among bars
    /// sharing a timestamp.
    pub fn canonicalize(bars: &[Bar]) -> Vec<Bar> {
        let mut out = bars.to_vec();
        out.sort_by_key(|b| b.timestamp);
        out.dedup_by_key(|b| b.timestamp);
        out
    }

    /// Keep bars within `[first, first + 15min]`. Expects sorted input.
    pub fn clip_first_window(bars: &[Bar]) -> Vec<Bar> {
        let Some(first) = bars.first() else {
            return Vec::new();
        };
        let start = first.timestamp;
        let end = start + Duration::minutes(FIRST_WINDOW_MINUTES);
        bars.iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Run the full pipeline for a request.
    pub fn process(bars: &[Bar], descriptor: &RequestDescriptor) -> Processed {
        let mut bars = Self::canonicalize(bars);
        if descriptor.first_window {
            bars = Self::clip_first_window(&bars);
            tracing::debug!(
                instrument = %descriptor.instrument,
                "filtered to first {FIRST_WINDOW_MINUTES} minutes: {} data points",
                bars.len()
            );
        }
        let gaps = detect_gaps(&bars, &descriptor.interval);
        if !gaps.is_empty() {
            tracing::warn!(
                instrument = %descriptor.instrument,
                interval = %descriptor.interval,
                "detected {} data gaps",
                gaps.len()
            );
        }
        Processed { bars, gaps }
    }
}
