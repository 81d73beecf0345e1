//! Structured error types for the fetch path.
//!
//! Every error is `Clone`: a single failed fetch is handed to all coalesced
//! callers of the same in-flight operation, and each of them receives the
//! identical value.

use std::time::Duration;
use thiserror::Error;

/// Request rejected before any external invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("instrument code is required")]
    MissingInstrument,

    #[error("interval is required")]
    MissingInterval,

    #[error("start and end must be given together")]
    IncompleteRange,

    #[error("start must be before end")]
    StartNotBeforeEnd,

    #[error("date range too large for interval {interval}: maximum {max_days} days allowed")]
    RangeTooLarge { interval: String, max_days: i64 },
}

/// Stdout of the data source could not be turned into bars.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("too many malformed lines ({errors}/{budget}), last: {last_error}")]
    BudgetExceeded {
        errors: usize,
        budget: usize,
        last_error: String,
    },

    #[error("data source reported: {0}")]
    Fatal(String),
}

/// Errors produced by a fetch, propagated identically to every caller.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("data fetch timed out after {}ms, try a smaller date range", .0.as_millis())]
    Timeout(Duration),

    #[error("data source could not be started: {0}")]
    ProcessSpawn(String),

    #[error("data source failed: {message}")]
    ProcessExecution {
        message: String,
        /// Stderr lines classified as errors, if any.
        errors: Vec<String>,
    },

    #[error("failed to parse data source output: {0}")]
    Parse(#[from] ParseError),
}

/// Coarse classification used by the transport layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request; never retried.
    Client,
    /// Deadline exceeded; the caller may retry with a smaller range.
    Timeout,
    /// Execution environment or data source failure.
    Server,
    /// Data source output was unusable.
    DataFormat,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Client,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ProcessSpawn(_) | Self::ProcessExecution { .. } => ErrorKind::Server,
            Self::Parse(_) => ErrorKind::DataFormat,
        }
    }

    /// Only timeouts are worth retrying, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
