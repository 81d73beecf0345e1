//! Barvault Runner — the asynchronous fetch engine.
//!
//! This crate builds on `barvault-core` to provide:
//! - A TTL result cache with range-containment hits
//! - Coalescing of concurrent identical requests into one invocation
//! - The child-process data source with span-scaled deadlines
//! - `BarService`, which ties them together and owns the background sweep
//! - `EngineConfig`, loaded from TOML and `BARVAULT_*` variables

pub mod cache;
pub mod config;
pub mod inflight;
pub mod invoker;
pub mod service;
pub mod source;

pub use cache::{CacheEntry, CacheStats, EntryStats, ResultCache};
pub use config::{CacheConfig, ConfigError, EngineConfig, SourceConfig};
pub use inflight::{FetchOutcome, InFlight, JoinRole, SharedFetch};
pub use invoker::{InvocationPlan, ProcessInvoker};
pub use service::BarService;
pub use source::{BarSource, RawOutput};
