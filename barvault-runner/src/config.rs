//! Engine configuration.
//!
//! Loaded from an optional TOML file, then overridden by `BARVAULT_*`
//! environment variables, then validated. Every field has a default, so an
//! empty file (or no file at all) yields a working engine.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use barvault_core::protocol::DEFAULT_ERROR_BUDGET;

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Maximum number of live entries.
    pub capacity: usize,
    /// Period of the background expiry sweep, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 100,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// External data source settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    /// Executable to launch.
    pub program: String,
    /// Leading arguments, before the per-request flags.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Offset added to UTC bounds before they are handed to the source.
    pub utc_offset_minutes: i64,
    /// Local session open, used to anchor first-window requests.
    #[serde(with = "hhmm")]
    pub session_open: NaiveTime,
    pub base_timeout_ms: u64,
    pub per_day_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Row cap for open-ended requests.
    pub row_limit: usize,
    /// Stdout larger than this fails the invocation.
    pub max_output_bytes: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            program: "python".into(),
            args: vec!["data_fetch.py".into()],
            working_dir: None,
            utc_offset_minutes: 330,
            session_open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            base_timeout_ms: 60_000,
            per_day_timeout_ms: 2_000,
            max_timeout_ms: 300_000,
            row_limit: 2_500,
            max_output_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Malformed stdout lines tolerated before a parse fails.
    pub error_budget: usize,
    pub cache: CacheConfig,
    pub source: SourceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_budget: DEFAULT_ERROR_BUDGET,
            cache: CacheConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Optional file, then environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `BARVAULT_*` process environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Override fields from an arbitrary variable lookup. Unparseable values
    /// are ignored and the current value is kept.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        fn num<T: std::str::FromStr>(raw: Option<String>, current: T) -> T {
            raw.and_then(|s| s.parse().ok()).unwrap_or(current)
        }

        self.cache.ttl_secs = num(var("BARVAULT_CACHE_TTL_SECS"), self.cache.ttl_secs);
        self.cache.capacity = num(var("BARVAULT_CACHE_CAPACITY"), self.cache.capacity);
        self.cache.sweep_interval_secs = num(
            var("BARVAULT_SWEEP_INTERVAL_SECS"),
            self.cache.sweep_interval_secs,
        );

        if let Some(program) = var("BARVAULT_PROGRAM") {
            self.source.program = program;
        }
        if let Some(args) = var("BARVAULT_PROGRAM_ARGS") {
            self.source.args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(dir) = var("BARVAULT_WORKING_DIR") {
            self.source.working_dir = Some(PathBuf::from(dir));
        }
        self.source.utc_offset_minutes = num(
            var("BARVAULT_UTC_OFFSET_MINUTES"),
            self.source.utc_offset_minutes,
        );
        self.source.base_timeout_ms =
            num(var("BARVAULT_BASE_TIMEOUT_MS"), self.source.base_timeout_ms);
        self.source.max_timeout_ms =
            num(var("BARVAULT_MAX_TIMEOUT_MS"), self.source.max_timeout_ms);
        self.error_budget = num(var("BARVAULT_ERROR_BUDGET"), self.error_budget);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.cache.capacity == 0 {
            return invalid("cache.capacity", "must be at least 1");
        }
        if self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs", "must be positive");
        }
        if self.cache.sweep_interval_secs == 0 {
            return invalid("cache.sweep_interval_secs", "must be positive");
        }
        if self.source.program.trim().is_empty() {
            return invalid("source.program", "must not be empty");
        }
        if self.source.max_timeout_ms < self.source.base_timeout_ms {
            return invalid("source.max_timeout_ms", "must not be below base_timeout_ms");
        }
        if self.source.row_limit == 0 {
            return invalid("source.row_limit", "must be at least 1");
        }
        if self.error_budget == 0 {
            return invalid("error_budget", "must be at least 1");
        }
        Ok(())
    }
}

/// `HH:MM` wall-clock times.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&time.format("%H:%M"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(serde::de::Error::custom)
    }
}
