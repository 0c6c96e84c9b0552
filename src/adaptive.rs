//! Load-adaptive wrapper around the token bucket limiter
//!
//! Watches the number of active keys as a cheap aggregate load signal and
//! tightens the shared per-key refill rate under pressure, restoring it
//! toward the configured baseline once load subsides. The rate never rises
//! above the baseline.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::token_bucket::{RateLimitDecision, TokenBucketLimiter};

/// Adaptive adjustment configuration
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Minimum time between adjustment passes
    pub adjust_interval: Duration,
    /// Active-key count above which the shared rate is halved
    pub high_load_keys: usize,
    /// Active-key count below which the shared rate recovers
    pub low_load_keys: usize,
    /// Hard floor for the shared rate under sustained load
    pub min_rate_per_sec: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            adjust_interval: Duration::from_secs(30),
            high_load_keys: 1000,
            low_load_keys: 100,
            min_rate_per_sec: 0.25,
        }
    }
}

/// Wraps a [`TokenBucketLimiter`] and adjusts its shared rate on a
/// check-time cadence: an idle server performs no adjustment work.
pub struct AdaptiveLimiter {
    inner: Arc<TokenBucketLimiter>,
    baseline_rate: f64,
    config: AdaptiveConfig,
    last_adjust: Mutex<Instant>,
}

impl AdaptiveLimiter {
    pub fn new(inner: Arc<TokenBucketLimiter>, config: AdaptiveConfig) -> Self {
        let baseline_rate = inner.rate();
        Self {
            inner,
            baseline_rate,
            config,
            last_adjust: Mutex::new(Instant::now()),
        }
    }

    /// Admission check for `key`, running an adjustment pass first if one
    /// is due.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.maybe_adjust();
        self.inner.check(key)
    }

    /// The shared per-key rate currently in effect (tokens per second)
    pub fn current_limit(&self) -> f64 {
        self.inner.rate()
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.inner
    }

    fn maybe_adjust(&self) {
        {
            let mut last = match self.last_adjust.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.elapsed() < self.config.adjust_interval {
                return;
            }
            *last = Instant::now();
        }

        let active = self.inner.active_keys();
        let current = self.inner.rate();

        if active > self.config.high_load_keys {
            let lowered = (current / 2.0).max(self.config.min_rate_per_sec);
            if lowered < current {
                self.inner.set_rate(lowered);
                warn!(
                    active_keys = active,
                    rate_per_sec = lowered,
                    "high load: lowering shared per-key rate"
                );
            }
        } else if active < self.config.low_load_keys && current < self.baseline_rate {
            let restored = (current * 2.0).min(self.baseline_rate);
            self.inner.set_rate(restored);
            debug!(
                active_keys = active,
                rate_per_sec = restored,
                "load subsided: restoring shared per-key rate"
            );
        }
    }
}
