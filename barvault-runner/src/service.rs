//! Request orchestration: cache lookup, coalescing, invocation, caching.
//!
//! `BarService` owns the result cache, the in-flight registry and the
//! background sweep task. Both maps sit behind one mutex that is never held
//! across an await point.
//!
//! A fetch runs as its own spawned task. Callers only await a shared handle
//! to it, so a caller that gives up does not cancel the fetch for anyone
//! else attached to the same key.

use barvault_core::{
    parse_output, Bar, CanonicalKey, Canonicalizer, DateRange, FetchError, RawRequest,
    RequestDescriptor,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::cache::{CacheEntry, CacheStats, ResultCache};
use crate::config::EngineConfig;
use crate::inflight::{FetchOutcome, InFlight, JoinRole};
use crate::invoker::ProcessInvoker;
use crate::source::BarSource;

struct State {
    cache: ResultCache,
    in_flight: InFlight,
}

struct Inner {
    state: Mutex<State>,
    source: Arc<dyn BarSource>,
    error_budget: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Every critical section leaves both maps consistent, so a poisoned
        // lock is still safe to use.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invoke the source, parse and post-process.
    async fn load(&self, descriptor: &RequestDescriptor) -> FetchOutcome {
        let started = Instant::now();
        let raw = self.source.invoke(descriptor).await?;
        let parsed = parse_output(&raw.stdout, descriptor, self.error_budget)?;
        let processed = Canonicalizer::process(&parsed.bars, descriptor);

        if processed.bars.is_empty() {
            tracing::warn!(
                instrument = %descriptor.instrument,
                interval = %descriptor.interval,
                "no data found"
            );
        }
        tracing::info!(
            instrument = %descriptor.instrument,
            interval = %descriptor.interval,
            source = self.source.name(),
            rows = processed.bars.len(),
            skipped = parsed.skipped,
            clipped = parsed.clipped,
            gaps = processed.gaps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched bars"
        );
        Ok(Arc::from(processed.bars))
    }

    /// Unregister generation `id` and cache its result, unless the
    /// registration was superseded in the meantime.
    fn complete(&self, key: &CanonicalKey, id: u64, bars: &Arc<[Bar]>, requested: Option<DateRange>) {
        let mut state = self.lock();
        if !state.in_flight.finish(key, id) {
            tracing::debug!(key = %key.fingerprint(), "registration superseded, result not cached");
            return;
        }
        if bars.is_empty() {
            return;
        }
        if let Some(entry) = CacheEntry::new(Arc::clone(bars), requested, Instant::now()) {
            state.cache.put(key.clone(), entry);
        }
    }
}

/// Unregisters an in-flight operation however its task ends.
struct Registration {
    inner: Arc<Inner>,
    key: CanonicalKey,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.lock().in_flight.finish(&self.key, self.id);
    }
}

fn start_fetch(
    inner: &Arc<Inner>,
    key: CanonicalKey,
    descriptor: RequestDescriptor,
    id: u64,
) -> BoxFuture<'static, FetchOutcome> {
    let registration = Registration {
        inner: Arc::clone(inner),
        key,
        id,
    };
    let task = tokio::spawn(async move {
        let inner = Arc::clone(&registration.inner);
        let outcome = inner.load(&descriptor).await;
        if let Ok(bars) = &outcome {
            inner.complete(&registration.key, registration.id, bars, descriptor.range);
        }
        drop(registration);
        outcome
    });
    join_task(task).boxed()
}

async fn join_task(task: JoinHandle<FetchOutcome>) -> FetchOutcome {
    task.await.unwrap_or_else(|e| {
        Err(FetchError::ProcessExecution {
            message: format!("fetch task failed: {e}"),
            errors: Vec::new(),
        })
    })
}

/// Cached, coalescing front for a [`BarSource`].
///
/// Must be constructed inside a tokio runtime; construction starts the
/// periodic cache sweep.
pub struct BarService {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BarService {
    pub fn new(config: &EngineConfig, source: Arc<dyn BarSource>) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                cache: ResultCache::new(config.cache.ttl(), config.cache.capacity),
                in_flight: InFlight::new(),
            }),
            source,
            error_budget: config.error_budget,
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), config.cache.sweep_interval());
        Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Service backed by the configured external process.
    pub fn with_process_source(config: &EngineConfig) -> Self {
        Self::new(config, Arc::new(ProcessInvoker::new(config.source.clone())))
    }

    /// Bars for a validated request, from cache, from an operation already
    /// running for the same key, or from a new invocation.
    pub async fn fetch(&self, descriptor: &RequestDescriptor) -> FetchOutcome {
        let key = descriptor.canonical_key();
        let shared = {
            let mut state = self.inner.lock();
            if let Some(bars) = state.cache.get(&key) {
                tracing::debug!(key = %key.fingerprint(), rows = bars.len(), "cache hit");
                return Ok(bars);
            }
            let inner = &self.inner;
            let (shared, role) = state.in_flight.join(&key, |id| {
                start_fetch(inner, key.clone(), descriptor.clone(), id)
            });
            match role {
                JoinRole::Leader => {
                    tracing::debug!(key = %key.fingerprint(), canonical = %key, "cache miss, invoking source")
                }
                JoinRole::Follower => {
                    tracing::debug!(key = %key.fingerprint(), "attached to in-flight fetch")
                }
            }
            shared
        };
        shared.await
    }

    /// Validate raw parameters, then [`BarService::fetch`].
    pub async fn fetch_raw(&self, raw: &RawRequest) -> FetchOutcome {
        let descriptor = RequestDescriptor::normalize(raw)?;
        self.fetch(&descriptor).await
    }

    /// Ranged fetch without the first-window restriction.
    pub async fn fetch_incremental(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: &str,
        exchange: Option<&str>,
        indicators: &[String],
    ) -> FetchOutcome {
        self.fetch_raw(&RawRequest {
            instrument: Some(instrument.to_string()),
            exchange: exchange.map(String::from),
            interval: Some(interval.to_string()),
            start: Some(start),
            end: Some(end),
            indicators: indicators.to_vec(),
            first_window: false,
        })
        .await
    }

    /// Drop every cached entry and forget in-flight registrations. Fetches
    /// already running still deliver to their callers but are not cached.
    pub fn clear_cache(&self) {
        let mut state = self.inner.lock();
        state.cache.clear();
        state.in_flight.clear();
        tracing::info!("cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        let state = self.inner.lock();
        state.cache.stats(state.in_flight.len())
    }

    /// Run one expiry sweep now. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.inner.lock().cache.sweep()
    }

    /// Stop the background sweep and wait for it to finish.
    pub async fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            tracing::debug!("cache sweeper stopped");
        }
    }
}

impl Drop for BarService {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn spawn_sweeper(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let removed = inner.lock().cache.sweep();
            if removed > 0 {
                tracing::debug!(removed, "swept expired cache entries");
            }
        }
    })
}
