//! Per-key token bucket limiter for HTTP request admission
//!
//! Buckets refill lazily at check time; there is no per-bucket ticker. A
//! periodic sweep evicts buckets that have not been touched for a configured
//! idle threshold so the key map cannot grow without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Token bucket limiter configuration
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Maximum burst size (also the initial fill of a new bucket)
    pub capacity: u32,
    /// Steady-state refill rate in tokens per second
    pub refill_per_sec: f64,
    /// When false, every check passes without touching bucket state
    pub enabled: bool,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_per_sec: 1.0,
            enabled: true,
        }
    }
}

/// Outcome of a single admission check
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Configured per-key burst limit, for response headers
    pub limit: u32,
    /// Whole tokens left after this check
    pub remaining: u32,
    /// How long until at least one token is available. Zero when allowed,
    /// and also when the bucket never refills (zero rate): there is no
    /// retry horizon, and the response layer emits no hint rather than an
    /// immediate-retry one.
    pub retry_after: Duration,
    /// How long until the bucket is full again
    pub reset_after: Duration,
}

impl RateLimitDecision {
    fn pass_through(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            retry_after: Duration::ZERO,
            reset_after: Duration::ZERO,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// Keyed token bucket limiter.
///
/// The key map has its own mutex and each bucket has its own, so the eviction
/// sweep and concurrent checks never race on bucket state. `check` holds the
/// map lock only long enough to clone out the bucket handle.
pub struct TokenBucketLimiter {
    capacity: u32,
    /// Shared refill rate as f64 bits; the adaptive layer swaps this at
    /// runtime and both existing and future buckets observe the new value
    rate_bits: AtomicU64,
    enabled: bool,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            rate_bits: AtomicU64::new(config.refill_per_sec.to_bits()),
            enabled: config.enabled,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Current refill rate in tokens per second
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    /// Replace the shared refill rate (used by the adaptive layer)
    pub fn set_rate(&self, refill_per_sec: f64) {
        self.rate_bits.store(refill_per_sec.to_bits(), Ordering::Relaxed);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of keys currently holding a bucket
    pub fn active_keys(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Check whether a request from `key` is admitted, consuming one token
    /// on success. A first-seen key starts with a full bucket.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::pass_through(self.capacity);
        }

        let bucket = {
            let mut buckets = match self.buckets.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    let now = Instant::now();
                    Arc::new(Mutex::new(Bucket {
                        tokens: f64::from(self.capacity),
                        last_refill: now,
                        last_access: now,
                    }))
                })
                .clone()
        };

        let rate = self.rate();
        let mut bucket = match bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        if rate > 0.0 {
            bucket.tokens =
                (bucket.tokens + elapsed.as_secs_f64() * rate).min(f64::from(self.capacity));
        }
        bucket.last_refill = now;
        bucket.last_access = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let remaining = bucket.tokens.floor().max(0.0) as u32;
        let retry_after = if allowed || rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - bucket.tokens).max(0.0) / rate)
        };
        let reset_after = if rate > 0.0 {
            Duration::from_secs_f64((f64::from(self.capacity) - bucket.tokens).max(0.0) / rate)
        } else {
            Duration::ZERO
        };

        RateLimitDecision {
            allowed,
            limit: self.capacity,
            remaining,
            retry_after,
            reset_after,
        }
    }

    /// Evict buckets whose last access is older than `idle_threshold`.
    /// Returns the number of evicted keys.
    pub fn sweep_idle(&self, idle_threshold: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = buckets.len();
        buckets.retain(|_, bucket| match bucket.lock() {
            Ok(b) => now.duration_since(b.last_access) < idle_threshold,
            Err(_) => false,
        });
        before - buckets.len()
    }
}

/// Run the idle-bucket eviction sweep until shutdown is signalled
pub fn spawn_bucket_sweep(
    limiter: Arc<TokenBucketLimiter>,
    interval: Duration,
    idle_threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup does no work
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = limiter.sweep_idle(idle_threshold);
                    if evicted > 0 {
                        debug!(evicted, "evicted idle token buckets");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
