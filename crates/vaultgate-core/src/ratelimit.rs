//! Per-token rate limiting.
//!
//! Each visitor (token) gets a composite limiter made of a burst bucket and
//! a sustained bucket; a request is allowed only when every bucket allows
//! it. The registry tracks visitors in a bounded map with the same LRU and
//! idle-purge bookkeeping as the response cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{
    BURST_LIMIT_PER_SECOND, RATE_LIMITER_BUCKET_SIZE, RATE_LIMITER_CACHE_SIZE,
    RATE_LIMITER_DEFAULT_EXPIRATION_SECS, RATE_LIMITER_PURGE_FREQUENCY_SECS,
    RATE_LIMIT_PER_MINUTE,
};

/// Token bucket with continuous refill.
///
/// Holds up to `capacity` tokens, replenished at `rate` tokens per second.
/// The bucket starts full.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate_per_sec: f64, capacity: u32) -> Self {
        Self {
            rate: rate_per_sec.max(0.0),
            capacity: f64::from(capacity),
            state: Mutex::new(BucketState { tokens: f64::from(capacity), last_refill: Instant::now() }),
        }
    }

    /// Consumes one token if available. Never blocks.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until one token can be consumed, then consumes it.
    ///
    /// Cancellation is dropping the future. Unused on the request path,
    /// where the non-blocking [`allow`](Self::allow) decides.
    pub async fn wait(&self) {
        loop {
            let deficit = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                1.0 - state.tokens
            };

            let pause = if self.rate > 0.0 {
                Duration::from_secs_f64((deficit / self.rate).min(1.0))
            } else {
                Duration::from_secs(1)
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Steady-state rate in tokens per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let replenished = elapsed.as_secs_f64() * self.rate;
        if replenished > 0.0 {
            state.tokens = (state.tokens + replenished).min(self.capacity);
            state.last_refill = now;
        }
    }
}

/// Ordered set of token buckets that allows iff every bucket allows.
///
/// Buckets are sorted ascending by steady-state rate at construction, so
/// blocking waits hit the most restrictive bucket first and the compound
/// rate is the first bucket's.
pub struct MultiLimiter {
    limiters: Vec<TokenBucket>,
}

impl MultiLimiter {
    #[must_use]
    pub fn new(mut limiters: Vec<TokenBucket>) -> Self {
        limiters.sort_by(|a, b| {
            a.rate().partial_cmp(&b.rate()).unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { limiters }
    }

    /// Consumes one token from every bucket; denies at the first empty one.
    pub fn allow(&self) -> bool {
        self.limiters.iter().all(TokenBucket::allow)
    }

    /// Waits on each bucket in most-restrictive-first order.
    pub async fn wait(&self) {
        for limiter in &self.limiters {
            limiter.wait().await;
        }
    }

    /// Compound steady-state rate: that of the most restrictive bucket.
    #[must_use]
    pub fn limit(&self) -> f64 {
        self.limiters.first().map_or(0.0, TokenBucket::rate)
    }
}

struct Visitor {
    limiter: Arc<MultiLimiter>,
    last_used_ms: AtomicU64,
}

/// Bounded registry of per-token composite limiters.
pub struct VisitorRegistry {
    visitors: RwLock<HashMap<String, Visitor>>,
    burst_per_sec: u32,
    rate_per_min: u32,
    bucket_size: u32,
    capacity: usize,
    idle_expiration: Duration,
    purge_frequency: Duration,
    epoch: Instant,
    last_purge_ms: AtomicU64,
}

impl Default for VisitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VisitorRegistry {
    /// Creates a registry with the configured rates and sizing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(
            BURST_LIMIT_PER_SECOND,
            RATE_LIMIT_PER_MINUTE,
            RATE_LIMITER_BUCKET_SIZE,
            RATE_LIMITER_CACHE_SIZE,
            Duration::from_secs(RATE_LIMITER_DEFAULT_EXPIRATION_SECS),
            Duration::from_secs(RATE_LIMITER_PURGE_FREQUENCY_SECS),
        )
    }

    /// Creates a registry with explicit rates, sizing, and timing.
    #[must_use]
    pub fn with_settings(
        burst_per_sec: u32,
        rate_per_min: u32,
        bucket_size: u32,
        capacity: usize,
        idle_expiration: Duration,
        purge_frequency: Duration,
    ) -> Self {
        Self {
            visitors: RwLock::new(HashMap::with_capacity(capacity)),
            burst_per_sec,
            rate_per_min,
            bucket_size,
            capacity,
            idle_expiration,
            purge_frequency,
            epoch: Instant::now(),
            last_purge_ms: AtomicU64::new(0),
        }
    }

    /// Returns the visitor's limiter, creating it on first sight.
    ///
    /// The hit path runs under the read lock and only touches the atomic
    /// last-used stamp; a miss upgrades to the write lock with a re-check,
    /// pruning the least-recently-used quarter first when at capacity.
    pub fn get_or_create(&self, fingerprint: &str) -> Arc<MultiLimiter> {
        {
            let visitors = self.visitors.read();
            if let Some(visitor) = visitors.get(fingerprint) {
                visitor.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
                return visitor.limiter.clone();
            }
        }

        let mut visitors = self.visitors.write();
        if let Some(visitor) = visitors.get(fingerprint) {
            visitor.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
            return visitor.limiter.clone();
        }

        self.prune_lru(&mut visitors);
        debug!(limiter_key = %fingerprint, "tracking new visitor");
        let limiter = Arc::new(self.new_limiter());
        visitors.insert(
            fingerprint.to_string(),
            Visitor { limiter: limiter.clone(), last_used_ms: AtomicU64::new(self.now_ms()) },
        );
        limiter
    }

    /// Deletes visitors idle past the expiration, at most once per purge
    /// interval.
    ///
    /// Deleting a visitor resets its accounting, which is only correct for
    /// idle tokens; the expiration threshold keeps hot visitors safe.
    pub fn purge_idle(&self) {
        let now = self.now_ms();
        let frequency_ms = u64::try_from(self.purge_frequency.as_millis()).unwrap_or(u64::MAX);
        let last = self.last_purge_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < frequency_ms.max(1) {
            return;
        }
        if self
            .last_purge_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let expiration_ms = u64::try_from(self.idle_expiration.as_millis()).unwrap_or(u64::MAX);
        let mut visitors = self.visitors.write();
        let before = visitors.len();
        visitors.retain(|_, visitor| {
            visitor.last_used_ms.load(Ordering::Relaxed).saturating_add(expiration_ms) >= now
        });
        let removed = before - visitors.len();
        if removed > 0 {
            info!(removed, remaining = visitors.len(), "purged idle rate limiters");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.visitors.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visitors.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.visitors.read().contains_key(fingerprint)
    }

    fn new_limiter(&self) -> MultiLimiter {
        MultiLimiter::new(vec![
            // Burst: a single-token bucket refilled at the burst rate.
            TokenBucket::new(f64::from(self.burst_per_sec), 1),
            // Sustained: the per-minute budget with room for a full bucket.
            TokenBucket::new(f64::from(self.rate_per_min) / 60.0, self.bucket_size),
        ])
    }

    fn prune_lru(&self, visitors: &mut HashMap<String, Visitor>) {
        if visitors.len() < self.capacity {
            return;
        }

        info!(size = visitors.len(), capacity = self.capacity, "visitor map full, pruning LRU batch");
        let mut keys: Vec<(String, u64)> = visitors
            .iter()
            .map(|(key, visitor)| (key.clone(), visitor.last_used_ms.load(Ordering::Relaxed)))
            .collect();
        keys.sort_by_key(|(_, last_used)| *last_used);

        let prune_count = visitors.len().div_ceil(4);
        for (key, _) in keys.into_iter().take(prune_count) {
            visitors.remove(&key);
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
