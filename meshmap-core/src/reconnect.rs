//! Exponential backoff with jitter for reconnection attempts.
//!
//! `delay = base * multiplier^attempt + uniform(0, delay * jitter_factor)`,
//! capped at `max_delay`. Jitter decorrelates many clients reconnecting to a
//! recovering broker at once.

use parking_lot::Mutex;
use rand::Rng;

use crate::now_ts;

struct StrategyInner {
    attempt: u32,
    total_attempts: u64,
    last_attempt_time: f64,
}

pub struct ReconnectStrategy {
    base_delay: f64,
    max_delay: f64,
    multiplier: f64,
    jitter_factor: f64,
    /// 0 = unbounded retries.
    max_retries: u32,
    inner: Mutex<StrategyInner>,
}

impl ReconnectStrategy {
    pub fn new(
        base_delay: f64,
        max_delay: f64,
        multiplier: f64,
        jitter_factor: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter_factor,
            max_retries,
            inner: Mutex::new(StrategyInner {
                attempt: 0,
                total_attempts: 0,
                last_attempt_time: 0.0,
            }),
        }
    }

    /// Tuned for the broker subscriber: 2 s to 120 s, unbounded retries.
    pub fn for_broker() -> Self {
        Self::new(2.0, 120.0, 2.0, 0.25, 0)
    }

    /// Tuned for HTTP collectors: 1 s to 10 s, 3 retries before cache
    /// fallback.
    pub fn for_collector() -> Self {
        Self::new(1.0, 10.0, 2.0, 0.15, 3)
    }

    /// Compute the next delay in seconds and advance the attempt counter.
    pub fn next_delay(&self) -> f64 {
        let mut inner = self.inner.lock();
        let mut delay = self.base_delay * self.multiplier.powi(inner.attempt as i32);
        delay = delay.min(self.max_delay);
        if self.jitter_factor > 0.0 {
            delay += rand::thread_rng().gen_range(0.0..=(delay * self.jitter_factor));
        }
        inner.attempt += 1;
        inner.total_attempts += 1;
        inner.last_attempt_time = now_ts();
        delay
    }

    /// Whether another retry is allowed under `max_retries` (0 = unlimited).
    pub fn should_retry(&self) -> bool {
        if self.max_retries == 0 {
            return true;
        }
        self.inner.lock().attempt < self.max_retries
    }

    /// Reset the attempt counter after a successful connection. The
    /// total-attempts counter is preserved for diagnostics.
    pub fn reset(&self) {
        self.inner.lock().attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    pub fn total_attempts(&self) -> u64 {
        self.inner.lock().total_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_escalate_and_cap() {
        let strategy = ReconnectStrategy::new(1.0, 10.0, 2.0, 0.0, 0);
        assert_eq!(strategy.next_delay(), 1.0);
        assert_eq!(strategy.next_delay(), 2.0);
        assert_eq!(strategy.next_delay(), 4.0);
        assert_eq!(strategy.next_delay(), 8.0);
        assert_eq!(strategy.next_delay(), 10.0); // capped
        assert_eq!(strategy.next_delay(), 10.0);
    }

    #[test]
    fn test_jitter_bounded() {
        let strategy = ReconnectStrategy::new(2.0, 120.0, 2.0, 0.25, 0);
        for expected_base in [2.0, 4.0, 8.0] {
            let delay = strategy.next_delay();
            assert!(delay >= expected_base);
            assert!(delay <= expected_base * 1.25 + 1e-9);
        }
    }

    #[test]
    fn test_retry_budget() {
        let strategy = ReconnectStrategy::for_collector();
        assert!(strategy.should_retry());
        strategy.next_delay();
        strategy.next_delay();
        strategy.next_delay();
        assert!(!strategy.should_retry());

        strategy.reset();
        assert!(strategy.should_retry());
        assert_eq!(strategy.attempt(), 0);
        assert_eq!(strategy.total_attempts(), 3);
    }

    #[test]
    fn test_unbounded_when_zero() {
        let strategy = ReconnectStrategy::for_broker();
        for _ in 0..50 {
            strategy.next_delay();
        }
        assert!(strategy.should_retry());
    }
}
