//! Live-update distribution hub for a development preview server.
//!
//! Accepts WebSocket connections from browser clients and fans out reload
//! notifications when the build pipeline reports a change. Every connection
//! passes a layered admission stack before it is accepted, and message
//! traffic on established connections is policed with exponential backoff.

pub mod abuse;
pub mod adaptive;
pub mod admission;
pub mod config;
pub mod error;
pub mod hub;
pub mod message;
pub mod origin;
pub mod pump;
pub mod sliding_window;
pub mod state;
pub mod token_bucket;

pub use abuse::{AbuseGuard, AbuseGuardConfig};
pub use adaptive::{AdaptiveConfig, AdaptiveLimiter};
pub use config::{CliArgs, Config};
pub use error::RelayError;
pub use hub::{ConnId, ConnectionHub, HubHandle, Outbound};
pub use message::ReloadMessage;
pub use origin::OriginGuard;
pub use sliding_window::SlidingWindowRateLimiter;
pub use state::AppState;
pub use token_bucket::{RateLimitDecision, TokenBucketConfig, TokenBucketLimiter};
