//! barvault core — domain types and pure processing for the historical bar engine.
//!
//! This crate holds everything that does not touch a runtime:
//! - Domain types (bars, intervals, gaps)
//! - Request normalization and canonical cache/coalescing keys
//! - The data source's output protocol (stdout bar lines, stderr diagnostics)
//! - Post-processing (sort, dedupe, first-window clip, gap detection)
//! - The fetch error taxonomy shared with the runner

pub mod data;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod request;

pub use data::{Canonicalizer, Processed};
pub use domain::{Bar, Gap, GapKind, Interval};
pub use error::{ErrorKind, FetchError, ParseError, ValidationError};
pub use protocol::{parse_output, ParsedOutput, StderrReport};
pub use request::{CanonicalKey, DateRange, ExchangeSet, RawRequest, RequestDescriptor};
