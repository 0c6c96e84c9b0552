//! Per-connection message rate limiter with exponential backoff
//!
//! Policies WebSocket message frequency after the handshake. Unlike a plain
//! sliding window, repeated violations impose an exponentially growing
//! backoff, and a violation *during* backoff extends it. Merely waiting for
//! the window to empty therefore never clears an active backoff, which closes
//! the window-boundary bypass a plain counter would allow.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Default first-violation backoff
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Default backoff growth factor per consecutive violation
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Default backoff ceiling (5 minutes)
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Immutable snapshot of a connection's violation state. Replaced wholesale
/// on every update so readers never contend with the limiter's own lock.
#[derive(Debug, Clone, Default)]
pub struct ViolationInfo {
    /// Consecutive violations since the last forgiveness reset
    pub count: u32,
    pub last_violation: Option<Instant>,
    pub backoff_until: Option<Instant>,
}

struct WindowState {
    timestamps: VecDeque<Instant>,
    violations: u32,
    last_violation: Option<Instant>,
    backoff_until: Option<Instant>,
}

/// Sliding-window limiter with exponential backoff.
///
/// Designed to be consulted exactly once per *received* application message,
/// never pre-emptively before I/O, so idle connections are never penalized
/// and attackers cannot burn budget by merely opening connections.
pub struct SlidingWindowRateLimiter {
    max_requests: usize,
    window: Duration,
    base_backoff: Duration,
    backoff_multiplier: f64,
    max_backoff: Duration,
    state: Mutex<WindowState>,
    snapshot: RwLock<Arc<ViolationInfo>>,
}

impl SlidingWindowRateLimiter {
    /// Create a limiter allowing `max_requests` messages per `window`,
    /// with the default backoff shape (1s base, 2x growth, 5 min ceiling).
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            base_backoff: DEFAULT_BASE_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff: DEFAULT_MAX_BACKOFF,
            state: Mutex::new(WindowState {
                timestamps: VecDeque::new(),
                violations: 0,
                last_violation: None,
                backoff_until: None,
            }),
            snapshot: RwLock::new(Arc::new(ViolationInfo::default())),
        }
    }

    /// Override the backoff shape. The exponential-growth-with-ceiling shape
    /// is the behavioral contract; only the constants are tunable.
    pub fn with_backoff(mut self, base: Duration, multiplier: f64, ceiling: Duration) -> Self {
        self.base_backoff = base;
        self.backoff_multiplier = multiplier;
        self.max_backoff = ceiling;
        self
    }

    /// Check whether one received message is within policy.
    ///
    /// Order matters:
    /// 1. An active backoff rejects outright and *extends* on the attempt.
    /// 2. Expired timestamps are dropped from the window.
    /// 3. A full window records a violation and rejects.
    /// 4. A quiet period of 2x the window forgives past violations.
    pub fn is_allowed(&self) -> bool {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(until) = state.backoff_until {
            if now < until {
                self.record_violation(&mut state, now);
                return false;
            }
        }

        while let Some(&front) = state.timestamps.front() {
            if now.duration_since(front) >= self.window {
                state.timestamps.pop_front();
            } else {
                break;
            }
        }

        if state.timestamps.len() >= self.max_requests {
            self.record_violation(&mut state, now);
            return false;
        }

        // Forgiveness: a well-behaved stretch clears the violation history
        if let Some(last) = state.last_violation {
            if now.duration_since(last) > self.window * 2 {
                state.violations = 0;
                state.last_violation = None;
                state.backoff_until = None;
                self.publish(&state);
            }
        }

        state.timestamps.push_back(now);
        true
    }

    /// Whether the connection is currently inside a backoff period
    pub fn is_in_backoff(&self) -> bool {
        self.violation_info()
            .backoff_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Lock-free read of the current violation snapshot
    pub fn violation_info(&self) -> Arc<ViolationInfo> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record_violation(&self, state: &mut WindowState, now: Instant) {
        state.violations += 1;
        state.last_violation = Some(now);

        let exponent = state.violations.saturating_sub(1).min(63);
        let backoff_secs = self.base_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(exponent as i32);
        let backoff = Duration::from_secs_f64(backoff_secs.min(self.max_backoff.as_secs_f64()));

        state.backoff_until = Some(now + backoff);
        self.publish(state);
    }

    fn publish(&self, state: &WindowState) {
        let info = Arc::new(ViolationInfo {
            count: state.violations,
            last_violation: state.last_violation,
            backoff_until: state.backoff_until,
        });
        match self.snapshot.write() {
            Ok(mut guard) => *guard = info,
            Err(poisoned) => *poisoned.into_inner() = info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_allows_exactly_max_in_window() {
        let limiter = SlidingWindowRateLimiter::new(3, Duration::from_millis(100));

        assert!(limiter.is_allowed());
        assert!(limiter.is_allowed());
        assert!(limiter.is_allowed());
        assert!(!limiter.is_allowed());
        assert!(limiter.is_in_backoff());
    }

    #[test]
    fn test_backoff_outlasts_window_expiry() {
        // Window empties after 50ms but the base backoff is 200ms; the
        // limiter must stay closed until the backoff expires.
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_millis(50))
            .with_backoff(Duration::from_millis(200), 2.0, Duration::from_secs(5));

        assert!(limiter.is_allowed());
        assert!(limiter.is_allowed());
        assert!(!limiter.is_allowed());

        // Window has expired, backoff has not
        thread::sleep(Duration::from_millis(80));
        assert!(!limiter.is_allowed());
    }

    #[test]
    fn test_violation_during_backoff_extends_it() {
        let limiter = SlidingWindowRateLimiter::new(1, Duration::from_millis(50))
            .with_backoff(Duration::from_millis(100), 2.0, Duration::from_secs(5));

        assert!(limiter.is_allowed());
        assert!(!limiter.is_allowed()); // violation 1: 100ms backoff
        let first_deadline = limiter.violation_info().backoff_until.unwrap();

        assert!(!limiter.is_allowed()); // violation 2, during backoff: 200ms
        let second_deadline = limiter.violation_info().backoff_until.unwrap();
        assert!(second_deadline > first_deadline);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let ceiling = Duration::from_millis(400);
        let limiter = SlidingWindowRateLimiter::new(1, Duration::from_millis(10))
            .with_backoff(Duration::from_millis(100), 2.0, ceiling);

        assert!(limiter.is_allowed());

        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let before = Instant::now();
            assert!(!limiter.is_allowed());
            let until = limiter.violation_info().backoff_until.unwrap();
            let backoff = until.duration_since(before);

            assert!(backoff >= previous);
            // Small slack for the time between `before` and the internal now
            assert!(backoff <= ceiling + Duration::from_millis(10));
            previous = backoff.min(ceiling);
        }
    }

    #[test]
    fn test_forgiveness_after_quiet_period() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_millis(40))
            .with_backoff(Duration::from_millis(40), 2.0, Duration::from_secs(1));

        assert!(limiter.is_allowed());
        assert!(limiter.is_allowed());
        assert!(!limiter.is_allowed());
        assert_eq!(limiter.violation_info().count, 1);

        // Quiet for > 2x window and past the backoff deadline
        thread::sleep(Duration::from_millis(120));
        assert!(limiter.is_allowed());
        assert_eq!(limiter.violation_info().count, 0);
        assert!(!limiter.is_in_backoff());
    }

    #[test]
    fn test_burst_then_backoff_then_recovery() {
        let limiter = SlidingWindowRateLimiter::new(3, Duration::from_millis(100));

        assert!(limiter.is_allowed());
        assert!(limiter.is_allowed());
        assert!(limiter.is_allowed());
        assert!(!limiter.is_allowed());
        assert!(limiter.is_in_backoff());

        // 50ms later: still inside the 1s base backoff
        thread::sleep(Duration::from_millis(50));
        assert!(!limiter.is_allowed());

        // The rejection above extended the backoff (violation 2: 2s), so
        // wait out the full current deadline before retrying.
        let until = limiter.violation_info().backoff_until.unwrap();
        let now = Instant::now();
        if until > now {
            thread::sleep(until.duration_since(now) + Duration::from_millis(20));
        }
        assert!(limiter.is_allowed());
    }
}
