use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a gap sits relative to the requested range.
///
/// The interior scanner only ever produces `Within`; `Before` and `After`
/// are reserved for boundary gaps against the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    Before,
    After,
    Within,
}

/// A discontinuity between two consecutive bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// Timestamp of the last bar before the gap.
    pub start: DateTime<Utc>,
    /// Timestamp of the first bar after the gap.
    pub end: DateTime<Utc>,
    pub kind: GapKind,
}
