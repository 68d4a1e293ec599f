//! Per-token response cache.
//!
//! Maps request fingerprints to captured upstream responses. Entries expire
//! after a fixed TTL, are evicted in batches under LRU pressure, and are
//! invalidated explicitly when a mutating request passes through the proxy.
//!
//! Locking discipline: lookups share a read lock; inserts, invalidations,
//! and the expired-entry sweep take the write lock. Hit bookkeeping updates
//! an atomic so the read path never escalates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{CACHE_DEFAULT_EXPIRATION_SECS, CACHE_PURGE_FREQUENCY_SECS, CACHE_SIZE};

/// A fully-buffered upstream response.
///
/// The body is materialized at capture time so the upstream stream can be
/// released and the same bytes can be served repeatedly.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct CacheEntry {
    response: CapturedResponse,
    /// Millis on the cache clock past which this entry must not be served.
    expires_at_ms: u64,
    /// Millis on the cache clock of insertion or the most recent hit.
    last_used_ms: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Thread-safe fingerprint → response map with TTL and LRU eviction.
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    purge_frequency: Duration,
    /// All entry timestamps are millis since this instant.
    epoch: Instant,
    last_sweep_ms: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    /// Creates a cache with the configured capacity, TTL, and sweep cadence.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(
            CACHE_SIZE,
            Duration::from_secs(CACHE_DEFAULT_EXPIRATION_SECS),
            Duration::from_secs(CACHE_PURGE_FREQUENCY_SECS),
        )
    }

    /// Creates a cache with explicit sizing and timing.
    #[must_use]
    pub fn with_settings(capacity: usize, ttl: Duration, purge_frequency: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
            ttl,
            purge_frequency,
            epoch: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Returns the cached response for `fingerprint` if present and fresh.
    ///
    /// A hit advances the entry's last-used time. Expired entries are left
    /// in place for the sweeper; they are never returned.
    pub fn lookup(&self, fingerprint: &str) -> Option<CapturedResponse> {
        self.sweep_expired();

        let now = self.now_ms();
        let entries = self.entries.read();
        let entry = entries.get(fingerprint)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.last_used_ms.store(now, Ordering::Relaxed);
        Some(entry.response.clone())
    }

    /// Stores a captured response under `fingerprint`.
    ///
    /// Only exact-200 responses are cached; anything else is dropped here so
    /// the invariant holds no matter what the caller captured. When the map
    /// is at capacity an LRU pass evicts the least-recently-used quarter
    /// before the new entry goes in.
    pub fn insert(&self, fingerprint: &str, response: CapturedResponse) {
        if response.status != StatusCode::OK {
            debug!(status = %response.status, "skipping cache insert for non-200 response");
            return;
        }

        let now = self.now_ms();
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let mut entries = self.entries.write();
        self.evict_lru(&mut entries);
        entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                response,
                expires_at_ms: now.saturating_add(ttl_ms),
                last_used_ms: AtomicU64::new(now),
            },
        );
    }

    /// Removes the entry for `fingerprint`. Absence is not an error.
    pub fn invalidate(&self, fingerprint: &str) {
        let mut entries = self.entries.write();
        if entries.remove(fingerprint).is_some() {
            info!(cache_key = %fingerprint, "cache entry invalidated");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.read().contains_key(fingerprint)
    }

    /// Deletes every expired entry, at most once per purge interval.
    ///
    /// The first read-path operation to cross the interval claims the sweep
    /// via compare-exchange and runs it under the write lock; concurrent
    /// callers carry on without blocking. Sweeping does not advance
    /// last-used times.
    fn sweep_expired(&self) {
        let now = self.now_ms();
        let frequency_ms = u64::try_from(self.purge_frequency.as_millis()).unwrap_or(u64::MAX);
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < frequency_ms.max(1) {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "swept expired cache entries");
        }
    }

    /// Evicts the ⌈size/4⌉ least-recently-used entries when at capacity.
    ///
    /// Batching the eviction amortizes the sort across many inserts.
    fn evict_lru(&self, entries: &mut HashMap<String, CacheEntry>) {
        if entries.len() < self.capacity {
            return;
        }

        info!(size = entries.len(), capacity = self.capacity, "cache full, evicting LRU batch");
        let mut keys: Vec<(String, u64)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_used_ms.load(Ordering::Relaxed)))
            .collect();
        keys.sort_by_key(|(_, last_used)| *last_used);

        let evict_count = entries.len().div_ceil(4);
        for (key, _) in keys.into_iter().take(evict_count) {
            entries.remove(&key);
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
