//! Interior gap detection.

use crate::domain::{Bar, Gap, GapKind, Interval};

/// Flag every consecutive pair whose spacing exceeds 1.5x the nominal
/// interval. Expects bars sorted ascending.
pub fn detect_gaps(bars: &[Bar], interval: &Interval) -> Vec<Gap> {
    let nominal_ms = interval.nominal_duration().num_milliseconds();

    bars.windows(2)
        .filter_map(|pair| {
            let delta_ms = (pair[1].timestamp - pair[0].timestamp).num_milliseconds();
            // delta > 1.5 * nominal, kept in integer arithmetic
            (delta_ms * 2 > nominal_ms * 3).then(|| Gap {
                start: pair[0].timestamp,
                end: pair[1].timestamp,
                kind: GapKind::Within,
            })
        })
        .collect()
}
