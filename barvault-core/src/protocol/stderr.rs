//! Stderr line classification.
//!
//! The data source writes free-text diagnostics to stderr. Lines are sorted
//! into errors, warnings and informational messages by keyword. Any error
//! line fails the whole invocation even when stdout parsed cleanly.

use serde::Serialize;

/// Class of a single stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineClass {
    Error,
    Warning,
    Info,
}

const ERROR_MARKERS: [&str; 7] = [
    "error:",
    "traceback",
    "exception:",
    "failed:",
    "critical:",
    "database connection failed",
    "no company found",
];

const WARNING_MARKERS: [&str; 3] = ["warning", "userwarning", "deprecation"];

const INFO_MARKERS: [&str; 12] = [
    "fetching",
    "data range:",
    "successfully",
    "query executed",
    "looking up",
    "processing",
    "completed",
    "data points",
    "querying",
    "filtered to",
    "adjusted for",
    "records for company",
];

/// Classify one stderr line. Blank lines yield `None`.
///
/// Lines that match no keyword set are treated as warnings.
pub fn classify_line(line: &str) -> Option<LineClass> {
    if line.trim().is_empty() {
        return None;
    }
    let lower = line.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if ERROR_MARKERS.iter().any(|m| has(m)) || lower.starts_with("error ") {
        return Some(LineClass::Error);
    }

    if WARNING_MARKERS.iter().any(|m| has(m)) || (has("skipped") && has("invalid")) {
        return Some(LineClass::Warning);
    }

    let info = INFO_MARKERS.iter().any(|m| has(m))
        || (has("found") && has("company"))
        || (has("applied") && has("buffer"))
        || (has("in ") && has("s"));
    if info {
        return Some(LineClass::Info);
    }

    Some(LineClass::Warning)
}

/// Stderr split by class, original line text preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StderrReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

impl StderrReport {
    pub fn from_stderr(stderr: &str) -> Self {
        let mut report = Self::default();
        for line in stderr.lines() {
            let bucket = match classify_line(line) {
                Some(LineClass::Error) => &mut report.errors,
                Some(LineClass::Warning) => &mut report.warnings,
                Some(LineClass::Info) => &mut report.info,
                None => continue,
            };
            bucket.push(line.to_string());
        }
        report
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Emit the classified lines through `tracing`, one event per class.
    pub fn log(&self, instrument: &str) {
        if !self.info.is_empty() {
            tracing::info!(%instrument, "data source info: {}", self.info.join("; "));
        }
        if !self.warnings.is_empty() {
            tracing::warn!(%instrument, "data source warnings: {}", self.warnings.join("; "));
        }
        if !self.errors.is_empty() {
            tracing::error!(%instrument, "data source errors: {}", self.errors.join("; "));
        }
    }
}
