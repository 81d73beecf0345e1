//! Integration tests for `BarService` against a scripted in-memory source.
//!
//! Covers caching, coalescing of concurrent identical requests, error
//! propagation to every attached caller, caller cancellation, the
//! interaction between `clear_cache` and fetches still running, and the
//! background expiry sweep.

use async_trait::async_trait;
use barvault_core::{ErrorKind, FetchError, RawRequest, RequestDescriptor};
use barvault_runner::{BarService, BarSource, EngineConfig, ProcessInvoker, RawOutput, SourceConfig};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Scripted source ──────────────────────────────────────────────────

struct ScriptedSource {
    calls: AtomicUsize,
    delay: Duration,
    reply: Result<String, FetchError>,
    last: Mutex<Option<RequestDescriptor>>,
}

impl ScriptedSource {
    fn ok(stdout: impl Into<String>) -> Arc<Self> {
        Self::with(Ok(stdout.into()), Duration::ZERO)
    }

    fn with(reply: Result<String, FetchError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            reply,
            last: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BarSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, descriptor: &RequestDescriptor) -> Result<RawOutput, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(descriptor.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone().map(|stdout| RawOutput {
            stdout,
            ..Default::default()
        })
    }
}

/// Answers with one bar per minute for exactly the window the process
/// invoker would ask for, inclusive of both ends.
struct WindowSource {
    invoker: ProcessInvoker,
}

#[async_trait]
impl BarSource for WindowSource {
    fn name(&self) -> &str {
        "window"
    }

    async fn invoke(&self, descriptor: &RequestDescriptor) -> Result<RawOutput, FetchError> {
        let args = self.invoker.build_args(descriptor);
        let bound = |flag: &str| {
            let raw = args.iter().find_map(|a| a.strip_prefix(flag)).unwrap();
            let local = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.3fZ").unwrap();
            local.and_utc()
                - ChronoDuration::minutes(self.invoker.config().utc_offset_minutes)
        };
        let (start, end) = (bound("--start_date="), bound("--end_date="));
        let minutes = (end - start).num_minutes();
        let stdout = (0..=minutes)
            .map(|m| line(start + ChronoDuration::minutes(m), 3_600.0 + m as f64))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(RawOutput {
            stdout,
            ..Default::default()
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn t(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
}

fn line(ts: DateTime<Utc>, close: f64) -> String {
    format!(
        "Interval:{},Open:{:.2},High:{:.2},Low:{:.2},Close:{:.2},Volume:1500",
        ts.to_rfc3339(),
        close - 0.5,
        close + 1.0,
        close - 1.0,
        close
    )
}

/// One bar per listed minute past 03:45Z (09:15 local).
fn stdout_for(minutes: &[i64]) -> String {
    minutes
        .iter()
        .map(|&m| line(t(3, 45) + ChronoDuration::minutes(m), 3_500.0 + m as f64))
        .collect::<Vec<_>>()
        .join("\n")
}

fn ranged(start: DateTime<Utc>, end: DateTime<Utc>) -> RequestDescriptor {
    RequestDescriptor::normalize(&RawRequest {
        instrument: Some("TCS".into()),
        interval: Some("1m".into()),
        start: Some(start),
        end: Some(end),
        ..Default::default()
    })
    .unwrap()
}

fn open_ended() -> RequestDescriptor {
    RequestDescriptor::normalize(&RawRequest {
        instrument: Some("TCS".into()),
        interval: Some("1m".into()),
        ..Default::default()
    })
    .unwrap()
}

// ── Caching ──────────────────────────────────────────────────────────

#[tokio::test]
async fn second_identical_request_is_served_from_cache() {
    let source = ScriptedSource::ok(stdout_for(&[0, 1, 2, 3, 4]));
    let service = BarService::new(&EngineConfig::default(), source.clone());
    let d = ranged(t(3, 45), t(3, 50));

    let first = service.fetch(&d).await.unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(first[0].timestamp, t(3, 45));
    assert_eq!(first[0].close, 3_500.0);
    assert!(first.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let second = service.fetch(&d).await.unwrap();
    assert_eq!(source.calls(), 1);
    assert!(Arc::ptr_eq(&first, &second));

    let stats = service.cache_stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.entries[0].instrument, "TCS");
    assert_eq!(stats.entries[0].rows, 5);
}

#[tokio::test]
async fn contained_range_is_served_without_invocation() {
    let minutes: Vec<i64> = (0..60).collect();
    let source = ScriptedSource::ok(stdout_for(&minutes));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    service.fetch(&ranged(t(3, 45), t(4, 44))).await.unwrap();
    let narrow = service.fetch(&ranged(t(4, 0), t(4, 10))).await.unwrap();

    assert_eq!(source.calls(), 1);
    assert_eq!(narrow.len(), 11);
    assert_eq!(narrow.first().unwrap().timestamp, t(4, 0));
    assert_eq!(narrow.last().unwrap().timestamp, t(4, 10));
}

#[tokio::test]
async fn sparse_cached_range_is_served_without_gap_check() {
    // Covered range claims 03:45..04:00 but bars between 03:47 and 03:55 are missing.
    let source = ScriptedSource::ok(stdout_for(&[0, 1, 10, 15]));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    service.fetch(&ranged(t(3, 45), t(4, 0))).await.unwrap();
    let inner = service.fetch(&ranged(t(3, 46), t(3, 55))).await.unwrap();

    assert_eq!(source.calls(), 1);
    let ts: Vec<_> = inner.iter().map(|b| b.timestamp).collect();
    assert_eq!(ts, vec![t(3, 46), t(3, 55)]);
}

#[tokio::test]
async fn empty_result_is_returned_but_not_cached() {
    let source = ScriptedSource::ok("Fetching data for TCS\n");
    let service = BarService::new(&EngineConfig::default(), source.clone());

    assert!(service.fetch(&open_ended()).await.unwrap().is_empty());
    assert!(service.fetch(&open_ended()).await.unwrap().is_empty());
    assert_eq!(source.calls(), 2);
    assert_eq!(service.cache_stats().size, 0);
}

#[tokio::test]
async fn failures_are_not_cached() {
    let source = ScriptedSource::with(
        Err(FetchError::ProcessExecution {
            message: "exited with code 1".into(),
            errors: vec!["ERROR: boom".into()],
        }),
        Duration::ZERO,
    );
    let service = BarService::new(&EngineConfig::default(), source.clone());

    assert!(service.fetch(&open_ended()).await.is_err());
    assert!(service.fetch(&open_ended()).await.is_err());
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn clear_cache_forces_a_new_invocation() {
    let source = ScriptedSource::ok(stdout_for(&[0, 1, 2]));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    service.fetch(&open_ended()).await.unwrap();
    service.clear_cache();
    assert_eq!(service.cache_stats().size, 0);
    service.fetch(&open_ended()).await.unwrap();
    assert_eq!(source.calls(), 2);
}

// ── Coalescing ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_share_one_invocation() {
    let source = ScriptedSource::with(Ok(stdout_for(&[0, 1, 2, 3, 4])), Duration::from_millis(100));
    let service = BarService::new(&EngineConfig::default(), source.clone());
    let d = ranged(t(3, 45), t(3, 50));

    let results = futures::future::join_all((0..10).map(|_| service.fetch(&d))).await;

    assert_eq!(source.calls(), 1);
    let first = results[0].as_ref().unwrap();
    for r in &results {
        assert!(Arc::ptr_eq(first, r.as_ref().unwrap()));
    }
}

#[tokio::test]
async fn concurrent_callers_receive_the_same_error() {
    let source = ScriptedSource::with(
        Err(FetchError::ProcessSpawn("python not found".into())),
        Duration::from_millis(50),
    );
    let service = BarService::new(&EngineConfig::default(), source.clone());
    let d = open_ended();

    let results = futures::future::join_all((0..5).map(|_| service.fetch(&d))).await;

    assert_eq!(source.calls(), 1);
    for r in results {
        let err = r.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.to_string(), "data source could not be started: python not found");
    }
}

#[tokio::test]
async fn different_keys_invoke_independently() {
    let source = ScriptedSource::with(Ok(stdout_for(&[0, 1])), Duration::from_millis(20));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    let req_a = open_ended();
    let req_b = ranged(t(3, 45), t(3, 50));
    let (a, b) = tokio::join!(service.fetch(&req_a), service.fetch(&req_b));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn abandoned_caller_does_not_cancel_shared_fetch() {
    let source = ScriptedSource::with(Ok(stdout_for(&[0, 1, 2])), Duration::from_millis(150));
    let service = BarService::new(&EngineConfig::default(), source.clone());
    let d = open_ended();

    let gave_up = tokio::time::timeout(Duration::from_millis(20), service.fetch(&d)).await;
    assert!(gave_up.is_err());
    assert_eq!(service.cache_stats().in_flight, 1);

    let bars = service.fetch(&d).await.unwrap();
    assert_eq!(bars.len(), 3);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn clear_during_fetch_delivers_but_does_not_cache() {
    let source = ScriptedSource::with(Ok(stdout_for(&[0, 1, 2])), Duration::from_millis(100));
    let service = BarService::new(&EngineConfig::default(), source.clone());
    let d = open_ended();

    let (bars, _) = tokio::join!(service.fetch(&d), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.clear_cache();
    });
    assert_eq!(bars.unwrap().len(), 3);

    let stats = service.cache_stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.in_flight, 0);
}

// ── Validation, parsing, incremental ─────────────────────────────────

#[tokio::test]
async fn invalid_request_never_reaches_source() {
    let source = ScriptedSource::ok(stdout_for(&[0]));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    let err = service
        .fetch_raw(&RawRequest {
            interval: Some("1m".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Client);
    assert!(!err.is_retryable());
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn malformed_output_is_a_data_format_error() {
    let garbage = (0..10)
        .map(|i| format!("Interval:not-a-date-{i},1,2,0,1,5"))
        .collect::<Vec<_>>()
        .join("\n");
    let source = ScriptedSource::ok(garbage);
    let service = BarService::new(&EngineConfig::default(), source.clone());

    let err = service.fetch(&open_ended()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataFormat);
}

#[tokio::test]
async fn incremental_fetch_builds_a_ranged_request() {
    let source = ScriptedSource::ok(stdout_for(&[0, 1, 2]));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    let bars = service
        .fetch_incremental("TCS", t(3, 45), t(3, 50), "1m", Some("nse"), &["rsi".to_string()])
        .await
        .unwrap();
    assert_eq!(bars.len(), 3);

    let seen = source.last.lock().unwrap().clone().unwrap();
    assert!(!seen.first_window);
    assert_eq!(seen.exchanges.to_arg(), "NSE");
    assert_eq!(seen.range.unwrap().start, t(3, 45));
    assert_eq!(seen.indicators, vec!["rsi".to_string()]);
}

#[tokio::test]
async fn first_window_request_is_clipped() {
    let minutes: Vec<i64> = (0..30).collect();
    let source = ScriptedSource::ok(stdout_for(&minutes));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    let d = RequestDescriptor::normalize(&RawRequest {
        instrument: Some("TCS".into()),
        interval: Some("1m".into()),
        first_window: true,
        ..Default::default()
    })
    .unwrap();
    let bars = service.fetch(&d).await.unwrap();
    assert_eq!(bars.len(), 16);
    assert_eq!(bars.last().unwrap().timestamp, t(4, 0));
}

#[tokio::test]
async fn first_window_starting_after_open_keeps_its_bars() {
    let source = Arc::new(WindowSource {
        invoker: ProcessInvoker::new(SourceConfig::default()),
    });
    let service = BarService::new(&EngineConfig::default(), source);

    // 04:30Z is 10:00 local, after the 09:15 open
    let d = RequestDescriptor::normalize(&RawRequest {
        instrument: Some("TCS".into()),
        interval: Some("1m".into()),
        start: Some(t(4, 30)),
        end: Some(t(9, 0)),
        first_window: true,
        ..Default::default()
    })
    .unwrap();
    let bars = service.fetch(&d).await.unwrap();

    assert_eq!(bars.len(), 16);
    assert_eq!(bars.first().unwrap().timestamp, t(4, 30));
    assert_eq!(bars.last().unwrap().timestamp, t(4, 45));
}

#[tokio::test]
async fn first_window_starting_before_open_uses_session_open() {
    let source = Arc::new(WindowSource {
        invoker: ProcessInvoker::new(SourceConfig::default()),
    });
    let service = BarService::new(&EngineConfig::default(), source);

    let d = RequestDescriptor::normalize(&RawRequest {
        instrument: Some("TCS".into()),
        interval: Some("1m".into()),
        start: Some(t(2, 0)),
        end: Some(t(9, 0)),
        first_window: true,
        ..Default::default()
    })
    .unwrap();
    let bars = service.fetch(&d).await.unwrap();

    assert_eq!(bars.len(), 16);
    assert_eq!(bars.first().unwrap().timestamp, t(3, 45));
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_sweeper_and_keeps_cache_usable() {
    let source = ScriptedSource::ok(stdout_for(&[0, 1]));
    let service = BarService::new(&EngineConfig::default(), source.clone());

    service.shutdown().await;
    service.shutdown().await;

    service.fetch(&open_ended()).await.unwrap();
    service.fetch(&open_ended()).await.unwrap();
    assert_eq!(source.calls(), 1);
    assert_eq!(service.sweep(), 0);
}

#[tokio::test]
async fn background_sweep_expires_entries_without_traffic() {
    let source = ScriptedSource::ok(stdout_for(&[0, 1]));
    let mut config = EngineConfig::default();
    config.cache.ttl_secs = 1;
    config.cache.sweep_interval_secs = 1;
    let service = BarService::new(&config, source.clone());

    service.fetch(&open_ended()).await.unwrap();
    assert_eq!(service.cache_stats().size, 1);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(service.cache_stats().size, 0);
    assert_eq!(source.calls(), 1);
    service.shutdown().await;
}
