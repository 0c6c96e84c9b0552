//! Flood detection and temporary block list (DDoS mitigation layer)
//!
//! Sits in front of the rate limiter: a key that floods past a hard
//! threshold within a short observation interval is placed on a block list
//! and rejected outright until the block expires, independent of whatever
//! tokens its bucket may have accumulated in the meantime.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::adaptive::AdaptiveLimiter;
use crate::token_bucket::RateLimitDecision;

/// Abuse guard configuration
#[derive(Debug, Clone)]
pub struct AbuseGuardConfig {
    /// Requests within one observation interval that trigger a block
    pub flood_threshold: u32,
    /// Length of the request-counting interval
    pub observation_window: Duration,
    /// How long a blocked key stays blocked
    pub block_duration: Duration,
}

impl Default for AbuseGuardConfig {
    fn default() -> Self {
        Self {
            flood_threshold: 300,
            observation_window: Duration::from_secs(10),
            block_duration: Duration::from_secs(300),
        }
    }
}

struct RequestCounter {
    count: u32,
    window_start: Instant,
}

/// Combined limiter + flood detector with a temporary block list
pub struct AbuseGuard {
    limiter: Arc<AdaptiveLimiter>,
    config: AbuseGuardConfig,
    /// Short-horizon request counters per key
    counters: DashMap<String, RequestCounter>,
    /// Blocked key -> block expiry
    blocked: DashMap<String, Instant>,
}

impl AbuseGuard {
    pub fn new(limiter: Arc<AdaptiveLimiter>, config: AbuseGuardConfig) -> Self {
        Self {
            limiter,
            config,
            counters: DashMap::new(),
            blocked: DashMap::new(),
        }
    }

    /// Full admission decision for one request from `key`: block list,
    /// flood counter, then the underlying (adaptive) limiter.
    pub fn check_request(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();

        // The Ref must be dropped before remove() or DashMap deadlocks
        let block_state = self.blocked.get(key).map(|expiry| {
            if now < *expiry {
                Some(expiry.duration_since(now))
            } else {
                None
            }
        });
        match block_state {
            Some(Some(remaining)) => {
                return RateLimitDecision {
                    allowed: false,
                    limit: self.limiter.limiter().capacity(),
                    remaining: 0,
                    retry_after: remaining,
                    reset_after: remaining,
                };
            }
            Some(None) => {
                self.blocked.remove(key);
                debug!(key, "block expired");
            }
            None => {}
        }

        let flooding = {
            let mut counter = self
                .counters
                .entry(key.to_string())
                .or_insert_with(|| RequestCounter { count: 0, window_start: now });
            if now.duration_since(counter.window_start) > self.config.observation_window {
                counter.count = 0;
                counter.window_start = now;
            }
            counter.count += 1;
            counter.count > self.config.flood_threshold
        };

        if flooding {
            self.blocked
                .insert(key.to_string(), now + self.config.block_duration);
            warn!(
                key,
                threshold = self.config.flood_threshold,
                block_secs = self.config.block_duration.as_secs(),
                "request flood detected: key blocked"
            );
            return RateLimitDecision {
                allowed: false,
                limit: self.limiter.limiter().capacity(),
                remaining: 0,
                retry_after: self.config.block_duration,
                reset_after: self.config.block_duration,
            };
        }

        self.limiter.check(key)
    }

    /// Whether `key` is currently on the block list
    pub fn is_blocked(&self, key: &str) -> bool {
        self.blocked
            .get(key)
            .is_some_and(|expiry| Instant::now() < *expiry)
    }

    /// Snapshot of currently-blocked keys, for observability
    pub fn blocked_ips(&self) -> Vec<String> {
        let now = Instant::now();
        self.blocked
            .iter()
            .filter(|entry| now < *entry.value())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove a key from the block list before its expiry.
    /// Returns true if the key was blocked.
    pub fn unblock(&self, key: &str) -> bool {
        self.blocked.remove(key).is_some()
    }

    /// Drop expired blocks and stale counters; call periodically
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.blocked.retain(|_, expiry| now < *expiry);
        self.counters.retain(|_, counter| {
            now.duration_since(counter.window_start) <= self.config.observation_window
        });
    }

    pub fn limiter(&self) -> &Arc<AdaptiveLimiter> {
        &self.limiter
    }
}

/// Run the block-list/counter cleanup until shutdown is signalled
pub fn spawn_abuse_sweep(
    guard: Arc<AbuseGuard>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => guard.cleanup_expired(),
                _ = shutdown.changed() => break,
            }
        }
    })
}
