//! Data source output protocol: stdout bar lines and stderr diagnostics.

pub mod parser;
pub mod stderr;

pub use parser::{parse_output, LineError, ParsedOutput, DEFAULT_ERROR_BUDGET};
pub use stderr::{classify_line, LineClass, StderrReport};
