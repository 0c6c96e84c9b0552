//! Shared application state wiring the admission layers together

use std::sync::Arc;
use std::time::Duration;

use crate::abuse::{AbuseGuard, AbuseGuardConfig};
use crate::adaptive::{AdaptiveConfig, AdaptiveLimiter};
use crate::config::Config;
use crate::hub::{ConnectionHub, HubHandle};
use crate::origin::OriginGuard;
use crate::pump::PumpConfig;
use crate::token_bucket::{TokenBucketConfig, TokenBucketLimiter};

/// Shared state handed to every request handler. Cheap to clone; everything
/// inside is a handle or an Arc.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub origin_guard: Arc<OriginGuard>,
    pub abuse_guard: Arc<AbuseGuard>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the state and the hub control loop from resolved configuration.
    /// The caller spawns the returned [`ConnectionHub`]'s run loop.
    pub fn new(config: &Config) -> (AppState, ConnectionHub) {
        let (hub, handle) = ConnectionHub::new(config.max_connections);

        let bucket = Arc::new(TokenBucketLimiter::new(TokenBucketConfig {
            capacity: config.bucket_capacity,
            refill_per_sec: config.bucket_refill_per_sec,
            enabled: config.rate_limit_enabled,
        }));
        let adaptive = Arc::new(AdaptiveLimiter::new(
            bucket,
            AdaptiveConfig {
                adjust_interval: Duration::from_secs(config.adaptive_interval_secs),
                high_load_keys: config.adaptive_high_load_keys,
                low_load_keys: config.adaptive_low_load_keys,
                min_rate_per_sec: config.adaptive_min_rate_per_sec,
            },
        ));
        let abuse_guard = Arc::new(AbuseGuard::new(
            adaptive,
            AbuseGuardConfig {
                flood_threshold: config.abuse_flood_threshold,
                observation_window: Duration::from_secs(config.abuse_observation_secs),
                block_duration: Duration::from_secs(config.abuse_block_secs),
            },
        ));

        let state = AppState {
            hub: handle,
            origin_guard: Arc::new(OriginGuard::new(config.allowed_origins.clone())),
            abuse_guard,
            config: Arc::new(config.clone()),
        };
        (state, hub)
    }

    /// Per-connection pump timing derived from configuration
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
            ping_interval: Duration::from_secs(self.config.ping_interval_secs),
            write_deadline: Duration::from_secs(self.config.write_deadline_secs),
        }
    }
}
