//! Barvault CLI — operate the fetch engine from the command line.
//!
//! Commands:
//! - `fetch` — fetch bars through the cached, coalescing engine
//! - `plan` — show the invocation a request would produce, without running it
//! - `parse` — parse captured data-source stdout from a file
//! - `classify` — classify captured data-source stderr from a file
//! - `config` — print the effective configuration

use anyhow::{bail, Context, Result};
use barvault_core::{parse_output, Bar, Canonicalizer, RawRequest, RequestDescriptor, StderrReport};
use barvault_runner::{BarService, EngineConfig, ProcessInvoker};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "barvault", about = "Barvault CLI — cached OHLCV bar fetching")]
struct Cli {
    /// Path to a TOML config file. BARVAULT_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. debug, barvault_runner=trace). Defaults to RUST_LOG, then info.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch bars through the engine.
    Fetch {
        #[command(flatten)]
        request: RequestArgs,

        /// Output format.
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,

        /// Issue this many identical requests concurrently.
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Print cache statistics to stderr afterwards.
        #[arg(long, default_value_t = false)]
        stats: bool,
    },
    /// Show the arguments and deadline a request would use.
    Plan {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Parse captured stdout of the data source.
    Parse {
        /// File holding the captured stdout.
        #[arg(long)]
        file: PathBuf,

        #[command(flatten)]
        request: RequestArgs,

        /// Output format.
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Classify captured stderr of the data source.
    Classify {
        /// File holding the captured stderr.
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args)]
struct RequestArgs {
    /// Instrument code (e.g. TCS).
    #[arg(long)]
    instrument: String,

    /// Bar interval: 1m, 5m, 15m, 1h, 1d.
    #[arg(long, default_value = "1m")]
    interval: String,

    /// Exchange or comma-separated list. Defaults to NSE,BSE.
    #[arg(long)]
    exchange: Option<String>,

    /// Range start (RFC 3339 or YYYY-MM-DD, UTC).
    #[arg(long, value_parser = parse_time)]
    start: Option<DateTime<Utc>>,

    /// Range end (RFC 3339 or YYYY-MM-DD, UTC).
    #[arg(long, value_parser = parse_time)]
    end: Option<DateTime<Utc>>,

    /// Indicator names, comma-separated.
    #[arg(long, value_delimiter = ',')]
    indicators: Vec<String>,

    /// Keep only the first 15 minutes of the session.
    #[arg(long, default_value_t = false)]
    first_window: bool,
}

impl RequestArgs {
    fn descriptor(&self) -> Result<RequestDescriptor> {
        let raw = RawRequest {
            instrument: Some(self.instrument.clone()),
            exchange: self.exchange.clone(),
            interval: Some(self.interval.clone()),
            start: self.start,
            end: self.end,
            indicators: self.indicators.clone(),
            first_window: self.first_window,
        };
        Ok(RequestDescriptor::normalize(&raw)?)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
        .ok_or_else(|| format!("invalid time '{s}', expected RFC 3339 or YYYY-MM-DD"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Fetch {
            request,
            format,
            repeat,
            stats,
        } => run_fetch(&config, &request, format, repeat, stats).await,
        Commands::Plan { request } => run_plan(&config, &request),
        Commands::Parse {
            file,
            request,
            format,
        } => run_parse(&config, &file, &request, format),
        Commands::Classify { file } => run_classify(&file),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run_fetch(
    config: &EngineConfig,
    request: &RequestArgs,
    format: Format,
    repeat: usize,
    stats: bool,
) -> Result<()> {
    if repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    let descriptor = request.descriptor()?;
    let service = BarService::with_process_source(config);

    let started = Instant::now();
    let results =
        futures::future::join_all((0..repeat).map(|_| service.fetch(&descriptor))).await;
    let elapsed = started.elapsed();

    let mut bars = None;
    for result in results {
        let fetched = result.with_context(|| format!("fetch failed for {}", descriptor.instrument))?;
        bars.get_or_insert(fetched);
    }
    let bars = bars.unwrap_or_else(|| std::sync::Arc::from(Vec::new()));

    tracing::info!(
        rows = bars.len(),
        callers = repeat,
        elapsed_ms = elapsed.as_millis() as u64,
        "fetch complete"
    );
    write_bars(&bars, format)?;

    if stats {
        eprintln!("{}", serde_json::to_string_pretty(&service.cache_stats())?);
    }
    service.shutdown().await;
    Ok(())
}

fn run_plan(config: &EngineConfig, request: &RequestArgs) -> Result<()> {
    let descriptor = request.descriptor()?;
    let invoker = ProcessInvoker::new(config.source.clone());
    let plan = invoker.plan(&descriptor);

    println!("key:     {}", descriptor.canonical_key());
    println!("timeout: {}ms", plan.timeout.as_millis());
    println!("command: {}", invoker.config().program);
    for arg in invoker.config().args.iter().chain(&plan.args) {
        println!("  {arg}");
    }
    Ok(())
}

fn run_parse(config: &EngineConfig, file: &Path, request: &RequestArgs, format: Format) -> Result<()> {
    let descriptor = request.descriptor()?;
    let stdout = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let parsed = parse_output(&stdout, &descriptor, config.error_budget)?;
    let processed = Canonicalizer::process(&parsed.bars, &descriptor);

    eprintln!(
        "parsed {} bars (skipped {}, clipped {}), {} after post-processing",
        parsed.bars.len(),
        parsed.skipped,
        parsed.clipped,
        processed.bars.len()
    );
    for gap in &processed.gaps {
        eprintln!("gap: {} -> {}", gap.start.to_rfc3339(), gap.end.to_rfc3339());
    }
    write_bars(&processed.bars, format)
}

fn run_classify(file: &Path) -> Result<()> {
    let stderr = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let report = StderrReport::from_stderr(&stderr);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.has_errors() {
        bail!("{} error line(s) found", report.errors.len());
    }
    Ok(())
}

fn write_bars(bars: &[Bar], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(bars)?),
        Format::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout().lock());
            for bar in bars {
                wtr.serialize(bar)?;
            }
            wtr.flush()?;
        }
    }
    Ok(())
}
