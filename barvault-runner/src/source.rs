//! The seam between the engine and whatever produces raw bar text.

use async_trait::async_trait;
use barvault_core::{FetchError, RequestDescriptor, StderrReport};
use std::time::Duration;

/// Captured output of one successful invocation.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub stdout: String,
    /// Classified stderr lines. Never contains errors on a successful return.
    pub diagnostics: StderrReport,
    pub elapsed: Duration,
}

/// Produces the line-oriented bar text for a validated request.
///
/// Implementations must be safe to call concurrently. The engine never calls
/// `invoke` twice at once for the same canonical key.
#[async_trait]
pub trait BarSource: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &str;

    async fn invoke(&self, descriptor: &RequestDescriptor) -> Result<RawOutput, FetchError>;
}
