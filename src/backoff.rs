// =============================================================================
// backoff.rs — THE POLITE RETREAT
// =============================================================================
//
// When the scoring backend starts failing, the worst thing we can do is keep
// asking it the same question every few hundred milliseconds. So every
// failure doubles the quiet period before we ask again:
//
//     delay = min(cap, base × 2^consecutive_failures)
//
// With the defaults (1 s base, 30 s cap) that is 2 s, 4 s, 8 s, 16 s, 30 s,
// 30 s, ... One success and the slate is wiped clean.
//
// There is no half-open state and no trip threshold here. The backend is one
// service, not a fleet, and the tracker already stops on decisive errors.
// =============================================================================

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Shape of the exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// `min(cap, base × 2^failures)`. Zero failures means zero delay.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // 2^31 seconds is already far past any sane cap; clamp the shift so
        // the multiplication cannot overflow.
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Client-local failure bookkeeping for one tracker instance.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: BackoffPolicy,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    total_failures: u64,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            last_failure_at: None,
            total_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// The delay that currently applies after the last failure.
    pub fn current_delay(&self) -> Duration {
        self.policy.delay_for(self.consecutive_failures)
    }

    /// When the next attempt may be dispatched, if we are backing off at all.
    pub fn ready_at(&self) -> Option<Instant> {
        self.last_failure_at.map(|at| at + self.current_delay())
    }

    /// Time still to wait before another attempt, or `None` when clear to go.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let ready = self.ready_at()?;
        if now >= ready {
            None
        } else {
            Some(ready - now)
        }
    }

    pub fn allow_attempt(&self, now: Instant) -> bool {
        self.remaining(now).is_none()
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                failures = self.consecutive_failures,
                "Backend answered again, backoff reset"
            );
        }
        self.consecutive_failures = 0;
        self.last_failure_at = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_failure_at = Some(now);
        let delay = self.current_delay();
        warn!(
            failures = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "Backend call failed, backing off for {} ms",
            delay.as_millis()
        );
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_at = None;
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            current_delay_ms: self.current_delay().as_millis() as u64,
        }
    }
}

/// Serializable view for logs and the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RetrySnapshot {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub current_delay_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    }

    #[test]
    fn attempt_blocked_until_delay_elapses() {
        let mut state = RetryState::new(BackoffPolicy::default());
        let t0 = Instant::now();
        state.record_failure(t0);
        state.record_failure(t0);
        // two failures -> 4 s
        assert!(!state.allow_attempt(t0 + Duration::from_millis(3_999)));
        assert!(state.allow_attempt(t0 + Duration::from_secs(4)));
        assert_eq!(
            state.remaining(t0 + Duration::from_secs(1)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn success_resets_failures() {
        let mut state = RetryState::new(BackoffPolicy::default());
        let t0 = Instant::now();
        state.record_failure(t0);
        state.record_failure(t0);
        state.record_success();
        assert_eq!(state.consecutive_failures(), 0);
        assert!(state.allow_attempt(t0));
        assert_eq!(state.snapshot().total_failures, 2);
    }
}
