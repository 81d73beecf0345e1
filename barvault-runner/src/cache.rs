//! In-memory result cache with TTL expiry and FIFO eviction.
//!
//! Entries are keyed by [`CanonicalKey`]. A lookup first tries the exact
//! key; if that misses and the request names an explicit range, any live
//! entry of the same series whose covered range contains the request is
//! served, clipped to the requested bounds.

use barvault_core::{Bar, CanonicalKey, DateRange, Interval};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bars: Arc<[Bar]>,
    /// Time span the bars were fetched for.
    pub covered: DateRange,
    pub created_at: Instant,
}

impl CacheEntry {
    /// Entry covering the requested range, or the span of the bars for
    /// open-ended requests. `None` for an empty open-ended result.
    pub fn new(bars: Arc<[Bar]>, requested: Option<DateRange>, created_at: Instant) -> Option<Self> {
        let covered = match requested {
            Some(range) => range,
            None => DateRange {
                start: bars.first()?.timestamp,
                end: bars.last()?.timestamp,
            },
        };
        Some(Self {
            bars,
            covered,
            created_at,
        })
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }
}

/// Per-entry view for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub key: String,
    pub instrument: String,
    pub interval: Interval,
    pub rows: usize,
    pub age_ms: u64,
    pub covered: String,
}

/// Snapshot of the cache for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub in_flight: usize,
    pub entries: Vec<EntryStats>,
}

pub struct ResultCache {
    entries: HashMap<CanonicalKey, CacheEntry>,
    /// Insertion order. May hold keys that were already removed; those are
    /// skipped when evicting and dropped on compaction.
    order: VecDeque<CanonicalKey>,
    ttl: Duration,
    capacity: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &CanonicalKey) -> Option<Arc<[Bar]>> {
        self.get_at(key, Instant::now())
    }

    /// Lookup as of `now`. Expired entries touched by the lookup are removed.
    pub fn get_at(&mut self, key: &CanonicalKey, now: Instant) -> Option<Arc<[Bar]>> {
        let requested = key.requested_range();

        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(now, self.ttl) {
                self.entries.remove(key);
            } else {
                return Some(Arc::clone(&entry.bars));
            }
        }

        // Range containment only for explicit ranges. First-window results
        // depend on the requested start, so they never stand in for another.
        let requested = requested?;
        if key.first_window {
            return None;
        }

        let ttl = self.ttl;
        let mut expired = Vec::new();
        let mut hit = None;
        for (other, entry) in &self.entries {
            if !other.same_series(key) {
                continue;
            }
            if entry.is_expired(now, ttl) {
                expired.push(other.clone());
                continue;
            }
            if entry.covered.contains_range(&requested) {
                hit = Some(
                    entry
                        .bars
                        .iter()
                        .filter(|b| requested.contains(b.timestamp))
                        .cloned()
                        .collect::<Arc<[Bar]>>(),
                );
                break;
            }
        }
        for k in expired {
            self.entries.remove(&k);
        }
        hit
    }

    pub fn put(&mut self, key: CanonicalKey, entry: CacheEntry) {
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
        if self.order.len() > self.capacity * 2 {
            self.compact();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now, ttl));
        self.compact();
        before - self.entries.len()
    }

    pub fn stats(&self, in_flight: usize) -> CacheStats {
        let now = Instant::now();
        let mut entries: Vec<EntryStats> = self
            .entries
            .iter()
            .map(|(key, e)| EntryStats {
                key: key.to_string(),
                instrument: key.instrument.clone(),
                interval: key.interval.clone(),
                rows: e.bars.len(),
                age_ms: now.saturating_duration_since(e.created_at).as_millis() as u64,
                covered: e.covered.to_string(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        CacheStats {
            size: self.entries.len(),
            capacity: self.capacity,
            ttl_ms: self.ttl.as_millis() as u64,
            in_flight,
            entries,
        }
    }

    /// Remove the oldest live entry. False if nothing was left to evict.
    fn evict_oldest(&mut self) -> bool {
        while let Some(key) = self.order.pop_front() {
            if self.entries.remove(&key).is_some() {
                tracing::debug!(key = %key, "evicted oldest cache entry");
                return true;
            }
        }
        false
    }

    /// Keep one queue slot per live key, at its latest insertion.
    fn compact(&mut self) {
        let mut seen = HashSet::new();
        let mut kept: VecDeque<CanonicalKey> = VecDeque::with_capacity(self.entries.len());
        for key in self.order.drain(..).rev() {
            if self.entries.contains_key(&key) && seen.insert(key.clone()) {
                kept.push_front(key);
            }
        }
        self.order = kept;
    }
}
