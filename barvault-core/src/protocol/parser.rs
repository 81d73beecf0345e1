//! Stdout protocol parser and validator.
//!
//! Each data line has the form
//! `Interval:<ts>,Open:<o>,High:<h>,Low:<l>,Close:<c>,Volume:<v>`.
//! A line starting with `ERROR:` or `FATAL:` aborts parsing immediately.
//! Anything else is progress chatter and is ignored.
//!
//! Malformed data lines are skipped and counted; the parse fails once the
//! count reaches the error budget. Well-formed bars outside an explicit
//! requested range are clipped without counting as errors.

use crate::domain::Bar;
use crate::error::ParseError;
use crate::request::RequestDescriptor;
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use thiserror::Error;

/// Default number of malformed lines tolerated before the parse fails.
pub const DEFAULT_ERROR_BUDGET: usize = 10;

const DATA_PREFIX: &str = "Interval:";
const FATAL_PREFIXES: [&str; 2] = ["ERROR:", "FATAL:"];
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Why a single data line was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LineError {
    #[error("insufficient data fields: expected 6, got {0}")]
    TooFewFields(usize),

    #[error("invalid numeric value in {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("invalid timestamp format: {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid OHLC relationship")]
    OhlcViolation,
}

/// Outcome of a successful parse.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    /// Accepted bars in source order, prices rounded to two decimals.
    pub bars: Vec<Bar>,
    /// Malformed lines skipped.
    pub skipped: usize,
    /// Valid bars dropped for falling outside the requested range.
    pub clipped: usize,
}

/// Parse the data source's stdout into bars.
pub fn parse_output(
    stdout: &str,
    descriptor: &RequestDescriptor,
    error_budget: usize,
) -> Result<ParsedOutput, ParseError> {
    let mut out = ParsedOutput::default();

    for line in stdout.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            match parse_fields(rest) {
                Ok(bar) => {
                    if let Some(range) = descriptor.range {
                        if !range.contains(bar.timestamp) {
                            out.clipped += 1;
                            continue;
                        }
                    }
                    out.bars.push(bar.rounded());
                }
                Err(err) => {
                    out.skipped += 1;
                    tracing::warn!(
                        instrument = %descriptor.instrument,
                        "skipping invalid data line ({}/{}): {} - {err}",
                        out.skipped,
                        error_budget,
                        truncate(line, 100),
                    );
                    if out.skipped >= error_budget {
                        return Err(ParseError::BudgetExceeded {
                            errors: out.skipped,
                            budget: error_budget,
                            last_error: err.to_string(),
                        });
                    }
                }
            }
        } else if FATAL_PREFIXES.iter().any(|p| line.starts_with(p)) {
            return Err(ParseError::Fatal(line.to_string()));
        }
    }

    if out.skipped > 0 {
        tracing::warn!(
            instrument = %descriptor.instrument,
            skipped = out.skipped,
            "parsed data with errors"
        );
    }

    Ok(out)
}

/// Parse the comma-separated fields following the `Interval:` prefix.
pub fn parse_fields(rest: &str) -> Result<Bar, LineError> {
    let parts: Vec<&str> = rest.split(',').collect();
    if parts.len() < 6 {
        return Err(LineError::TooFewFields(parts.len()));
    }

    let open = price(parts[1], "Open:", "open")?;
    let high = price(parts[2], "High:", "high")?;
    let low = price(parts[3], "Low:", "low")?;
    let close = price(parts[4], "Close:", "close")?;
    let volume = volume(parts[5])?;
    let timestamp = parse_timestamp(parts[0].trim())?;

    let bar = Bar {
        timestamp,
        open,
        high,
        low,
        close,
        volume,
    };
    if !bar.is_sane() {
        return Err(LineError::OhlcViolation);
    }
    Ok(bar)
}

/// Parse an ISO-8601 timestamp, truncated to whole seconds.
///
/// Offset-less timestamps are taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, LineError> {
    let ts = DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(|| LineError::InvalidTimestamp(s.to_string()))
        })?;
    Ok(ts.with_nanosecond(0).unwrap_or(ts))
}

fn strip_label<'a>(field: &'a str, label: &str) -> &'a str {
    let field = field.trim();
    field.strip_prefix(label).unwrap_or(field).trim()
}

fn price(field: &str, label: &str, name: &'static str) -> Result<f64, LineError> {
    let raw = strip_label(field, label);
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| LineError::InvalidNumber {
            field: name,
            value: raw.to_string(),
        })
}

fn volume(field: &str) -> Result<u64, LineError> {
    let raw = strip_label(field, "Volume:");
    if raw.is_empty() {
        return Ok(0);
    }
    let v = raw
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| LineError::InvalidNumber {
            field: "volume",
            value: raw.to_string(),
        })?;
    Ok(v.round().max(0.0) as u64)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
