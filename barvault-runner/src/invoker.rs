//! Launches the external data source as a child process.
//!
//! One invocation per request: flags are derived from the descriptor, the
//! child runs under a deadline sized to the requested span, stdout and
//! stderr are captured in full (stdout up to a byte limit), and stderr is
//! classified before the exit status is trusted.

use async_trait::async_trait;
use barvault_core::data::FIRST_WINDOW_MINUTES;
use barvault_core::{DateRange, FetchError, RequestDescriptor, StderrReport};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::SourceConfig;
use crate::source::{BarSource, RawOutput};

const ARG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Everything needed to launch one invocation, computed up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationPlan {
    /// Per-request flags, appended after the configured leading arguments.
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// [`BarSource`] backed by a child process.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    config: SourceConfig,
}

impl ProcessInvoker {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Deadline for a request: base plus a per-day allowance, capped.
    /// Open-ended requests get the cap.
    pub fn timeout_for(&self, descriptor: &RequestDescriptor) -> Duration {
        let max = self.config.max_timeout_ms;
        let ms = match descriptor.range {
            Some(range) => {
                let scaled = self.config.base_timeout_ms as f64
                    + range.span_days() * self.config.per_day_timeout_ms as f64;
                (scaled.round() as u64).min(max)
            }
            None => max,
        };
        Duration::from_millis(ms)
    }

    /// Command-line flags for a request.
    pub fn build_args(&self, descriptor: &RequestDescriptor) -> Vec<String> {
        let mut args = vec![
            format!("--company_code={}", descriptor.instrument),
            format!("--interval={}", descriptor.interval),
            format!("--exchange={}", descriptor.exchanges.to_arg()),
        ];

        match descriptor.range {
            Some(range) => {
                let (start, end) = self.local_bounds(range, descriptor.first_window);
                args.push(format!("--start_date={}", start.format(ARG_TIME_FORMAT)));
                args.push(format!("--end_date={}", end.format(ARG_TIME_FORMAT)));
                args.push("--optimize_for_range=true".into());
                args.push(format!(
                    "--buffer_minutes={}",
                    descriptor.interval.buffer_minutes()
                ));
                if descriptor.first_window {
                    args.push("--first_fifteen_minutes=true".into());
                }
            }
            None => {
                args.push("--fetch_all_data=true".into());
                args.push(format!("--limit={}", self.config.row_limit));
            }
        }

        args.push("--enable_cache=true".into());
        args.push("--compression=true".into());
        args.push("--validate_data=true".into());

        if !descriptor.indicators.is_empty() {
            args.push(format!("--indicators={}", descriptor.indicators.join(",")));
        }
        args
    }

    pub fn plan(&self, descriptor: &RequestDescriptor) -> InvocationPlan {
        InvocationPlan {
            args: self.build_args(descriptor),
            timeout: self.timeout_for(descriptor),
        }
    }

    /// Shift UTC bounds into the source's local clock. First-window requests
    /// start at the session open on the start date, or at the requested
    /// start when that is later, so the window never precedes the range.
    fn local_bounds(&self, range: DateRange, first_window: bool) -> (NaiveDateTime, NaiveDateTime) {
        let offset = ChronoDuration::minutes(self.config.utc_offset_minutes);
        let local = |ts: DateTime<Utc>| (ts + offset).naive_utc();
        if first_window {
            let start = local(range.start);
            let open = start.date().and_time(self.config.session_open).max(start);
            (open, open + ChronoDuration::minutes(FIRST_WINDOW_MINUTES))
        } else {
            (local(range.start), local(range.end))
        }
    }

    async fn run(
        &self,
        descriptor: &RequestDescriptor,
        plan: &InvocationPlan,
    ) -> Result<RawOutput, FetchError> {
        let started = Instant::now();
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .args(&plan.args)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            program = %self.config.program,
            args = ?plan.args,
            timeout_ms = plan.timeout.as_millis() as u64,
            "launching data source"
        );

        let mut child = cmd.spawn().map_err(|e| {
            let reason = match e.kind() {
                std::io::ErrorKind::NotFound => {
                    format!("{} not found, check the execution environment", self.config.program)
                }
                _ => format!("{}: {e}", self.config.program),
            };
            FetchError::ProcessSpawn(reason)
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.config.max_output_bytes;
        let collected = tokio::time::timeout(plan.timeout, async {
            tokio::try_join!(
                read_capped(stdout, limit),
                read_capped(stderr, limit),
                child.wait()
            )
        })
        .await;

        let (stdout, stderr, status) = match collected {
            Err(_) => {
                let _ = child.kill().await;
                tracing::warn!(
                    instrument = %descriptor.instrument,
                    timeout_ms = plan.timeout.as_millis() as u64,
                    "data source timed out"
                );
                return Err(FetchError::Timeout(plan.timeout));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(FetchError::ProcessExecution {
                    message: format!("failed to collect output: {e}"),
                    errors: Vec::new(),
                });
            }
            Ok(Ok(collected)) => collected,
        };

        let diagnostics = StderrReport::from_stderr(&stderr);
        diagnostics.log(&descriptor.instrument);

        if !status.success() {
            return Err(FetchError::ProcessExecution {
                message: describe_exit(status),
                errors: diagnostics.errors,
            });
        }
        if diagnostics.has_errors() {
            return Err(FetchError::ProcessExecution {
                message: "data processing failed with errors".into(),
                errors: diagnostics.errors,
            });
        }

        Ok(RawOutput {
            stdout,
            diagnostics,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl BarSource for ProcessInvoker {
    fn name(&self) -> &str {
        "process"
    }

    async fn invoke(&self, descriptor: &RequestDescriptor) -> Result<RawOutput, FetchError> {
        let plan = self.plan(descriptor);
        self.run(descriptor, &plan).await
    }
}

/// Read a pipe to the end, failing once more than `limit` bytes arrive.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> std::io::Result<String> {
    let Some(pipe) = pipe else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("output exceeded {limit} bytes"),
        ));
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "terminated abnormally".into()
}
