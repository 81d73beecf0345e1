//! Bar post-processing

pub mod canonicalize;
pub mod gaps;

pub use canonicalize::{Canonicalizer, Processed, FIRST_WINDOW_MINUTES};
pub use gaps::detect_gaps;
