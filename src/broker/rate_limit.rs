// =============================================================================
// Rate limiter + circuit breaker — cross-cutting wrapper around the broker
// =============================================================================
//
// Two independent token buckets (market-data ≈19/s,
// trading/account ≈5/s — a burst of quote polling must never starve an order
// submission) and a circuit breaker tripping after 20 consecutive failures,
// auto-resetting after 60s. Built on the same atomic-counter shape as
// atomic-counter style, generalized from header-driven weight tracking to a
// simple token bucket since KIS does not return a used-weight header.
//
// This is an in-process atomic limiter.
// A coordinated Redis-backed limiter would be required for a true
// multi-process deployment of the same account; out of scope here (single
// binary).
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

/// A simple token bucket refilled continuously at `rate_per_sec`.
pub struct TokenBucket {
    capacity: u32,
    rate_per_sec: u32,
    tokens_milli: AtomicU64, // tokens * 1000, for sub-token precision
    last_refill_ms: AtomicU64,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32) -> Self {
        let now = now_ms();
        Self {
            capacity: rate_per_sec,
            rate_per_sec,
            tokens_milli: AtomicU64::new(rate_per_sec as u64 * 1000),
            last_refill_ms: AtomicU64::new(now),
        }
    }

    fn refill(&self) {
        let now = now_ms();
        let last = self.last_refill_ms.swap(now, Ordering::AcqRel);
        let elapsed_ms = now.saturating_sub(last);
        if elapsed_ms == 0 {
            return;
        }
        let added_milli = (elapsed_ms as u128 * self.rate_per_sec as u128) as u64;
        let cap_milli = self.capacity as u64 * 1000;
        let prev = self.tokens_milli.load(Ordering::Acquire);
        let next = (prev + added_milli).min(cap_milli);
        self.tokens_milli.store(next, Ordering::Release);
    }

    /// Try to consume one token. Returns `true` if a token was available.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        loop {
            let current = self.tokens_milli.load(Ordering::Acquire);
            if current < 1000 {
                return false;
            }
            if self
                .tokens_milli
                .compare_exchange(current, current - 1000, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

/// State of the account-global circuit breaker. `Closed` = normal operation,
/// `Open` = failing fast, `HalfOpen` is implicit: once `reset_secs` elapses
/// past the trip we allow the next call through and treat its outcome as the
/// verdict (a binary open/closed model rather than a
/// three-state machine).
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    reset_secs: u64,
    tripped_at_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_secs: u64) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            failure_threshold,
            reset_secs,
            tripped_at_ms: AtomicU64::new(0),
        }
    }

    /// `true` when the breaker is currently open (fail-fast). Automatically
    /// clears after `reset_secs` has elapsed since the trip.
    pub fn is_open(&self) -> bool {
        let tripped_at = self.tripped_at_ms.load(Ordering::Acquire);
        if tripped_at == 0 {
            return false;
        }
        let elapsed = now_ms().saturating_sub(tripped_at);
        if elapsed >= self.reset_secs * 1000 {
            // Reset window elapsed: close the breaker and let the next call
            // through to re-test the broker.
            self.tripped_at_ms.store(0, Ordering::Release);
            self.consecutive_failures.store(0, Ordering::Release);
            info!("circuit breaker reset after cool-down, transitioning Open->Closed");
            return false;
        }
        true
    }

    /// Record a successful call — resets the consecutive-failure counter.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Record a failed call. Trips the breaker once `failure_threshold`
    /// consecutive failures have accumulated.
    pub fn record_failure(&self) {
        let count = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.failure_threshold && self.tripped_at_ms.load(Ordering::Acquire) == 0 {
            self.tripped_at_ms.store(now_ms(), Ordering::Release);
            warn!(
                consecutive_failures = count,
                threshold = self.failure_threshold,
                "circuit breaker tripped, transitioning Closed->Open"
            );
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        let tripped_at = self.tripped_at_ms.load(Ordering::Acquire);
        if tripped_at == 0 {
            return 0;
        }
        let elapsed = Duration::from_millis(now_ms().saturating_sub(tripped_at));
        self.reset_secs.saturating_sub(elapsed.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_allows_burst_up_to_capacity() {
        let bucket = TokenBucket::new(5);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn circuit_breaker_trips_after_threshold() {
        let cb = CircuitBreaker::new(3, 60);
        assert!(!cb.is_open());
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
    }

    #[test]
    fn circuit_breaker_success_resets_counter() {
        let cb = CircuitBreaker::new(3, 60);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open(), "two failures after a reset should not trip a threshold-3 breaker");
    }

    #[test]
    fn retry_after_secs_counts_down_from_reset_window() {
        let cb = CircuitBreaker::new(1, 60);
        cb.record_failure();
        assert!(cb.is_open());
        let remaining = cb.retry_after_secs();
        assert!(remaining <= 60);
    }
}
