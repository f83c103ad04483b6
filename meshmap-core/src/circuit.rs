//! Per-source circuit breaker.
//!
//! When an upstream accumulates consecutive failures the circuit opens and
//! fetches are skipped, preventing timeout cascades across the collection
//! cycle. After `recovery_timeout` the circuit goes half-open and a single
//! trial request decides between CLOSED and OPEN.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::now_ts;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: f64 = 60.0;

/// Maximum tracked breakers; oldest CLOSED entry is evicted at capacity.
const MAX_CIRCUITS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: f64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<f64>,
    pub last_state_change: f64,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: f64,
    last_state_change: f64,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: f64,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, recovery_timeout: f64) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: 0.0,
                last_state_change: now_ts(),
                total_successes: 0,
                total_failures: 0,
                total_rejected: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_recovery(&mut inner);
        inner.state
    }

    /// Whether a request may pass through. OPEN circuits reject (and count
    /// the rejection); CLOSED and HALF_OPEN allow.
    pub fn can_send(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_recovery(&mut inner);
        if inner.state == CircuitState::Open {
            inner.total_rejected += 1;
            return false;
        }
        true
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.failure_count = 0;
        if inner.state != CircuitState::Closed {
            transition(&mut inner, CircuitState::Closed);
            info!(breaker = %self.name, "circuit breaker recovered -> CLOSED");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.last_failure_time = now_ts();

        match inner.state {
            CircuitState::HalfOpen => {
                transition(&mut inner, CircuitState::Open);
                warn!(breaker = %self.name, "recovery trial failed -> OPEN");
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                let failures = inner.failure_count;
                transition(&mut inner, CircuitState::Open);
                warn!(breaker = %self.name, failures, "circuit breaker tripped -> OPEN");
            }
            _ => {}
        }
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        transition(&mut inner, CircuitState::Closed);
    }

    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        self.check_recovery(&mut inner);
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
            last_failure_time: (inner.last_failure_time > 0.0).then_some(inner.last_failure_time),
            last_state_change: inner.last_state_change,
        }
    }

    /// OPEN -> HALF_OPEN once the recovery timeout has elapsed. Lock held by
    /// the caller.
    fn check_recovery(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if now_ts() - inner.last_failure_time >= self.recovery_timeout {
            transition(inner, CircuitState::HalfOpen);
            info!(breaker = %self.name, "recovery timeout elapsed -> HALF_OPEN");
        }
    }
}

fn transition(inner: &mut BreakerInner, new_state: CircuitState) {
    inner.state = new_state;
    inner.last_state_change = now_ts();
}

/// Registry of named breakers, created lazily per upstream source.
pub struct CircuitBreakerRegistry {
    default_failure_threshold: u32,
    default_recovery_timeout: f64,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_failure_threshold: u32, default_recovery_timeout: f64) -> Self {
        Self {
            default_failure_threshold,
            default_recovery_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create a breaker by name.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if !breakers.contains_key(name) && breakers.len() >= MAX_CIRCUITS {
            evict_oldest_closed(&mut breakers);
        }
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.default_failure_threshold,
                    self.default_recovery_timeout,
                ))
            })
            .clone()
    }

    pub fn all_states(&self) -> HashMap<String, CircuitStats> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.stats()))
            .collect()
    }

    pub fn open_circuits(&self) -> HashMap<String, CircuitStats> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .filter(|(_, b)| b.state() != CircuitState::Closed)
            .map(|(name, b)| (name.clone(), b.stats()))
            .collect()
    }

    /// Reset one breaker. Returns false when the name is unknown.
    pub fn reset(&self, name: &str) -> bool {
        let breakers = self.breakers.lock();
        match breakers.get(name) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker; returns how many were not already CLOSED.
    pub fn reset_all(&self) -> usize {
        let breakers = self.breakers.lock();
        let mut count = 0;
        for breaker in breakers.values() {
            if breaker.state() != CircuitState::Closed {
                breaker.reset();
                count += 1;
            }
        }
        count
    }
}

fn evict_oldest_closed(breakers: &mut HashMap<String, Arc<CircuitBreaker>>) {
    let oldest = breakers
        .iter()
        .filter(|(_, b)| b.state() == CircuitState::Closed)
        .min_by(|(_, a), (_, b)| {
            let (sa, sb) = (a.stats().last_state_change, b.stats().last_state_change);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(name, _)| name.clone());
    if let Some(name) = oldest {
        breakers.remove(&name);
        debug!(breaker = %name, "evicted circuit breaker at capacity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("aredn", 5, 60.0);
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.can_send());
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_send());
        assert_eq!(breaker.stats().failure_count, 5);
        assert_eq!(breaker.stats().total_rejected, 1);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let breaker = CircuitBreaker::new("src", 1, 0.0);
        breaker.record_failure();
        // Zero recovery timeout: the next check goes straight to half-open
        // and one trial request is allowed through.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_send());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("src", 1, 0.0);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        // A large timeout would now hold it OPEN, but timeout is zero so the
        // state probe flips it half-open again; check the raw counters.
        assert_eq!(breaker.stats().total_failures, 2);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("src", 3, 60.0);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reset_all_leaves_closed() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("a");
        for _ in 0..5 {
            a.record_failure();
        }
        assert_eq!(a.state(), CircuitState::Open);

        let reset = registry.reset_all();
        assert_eq!(reset, 1);
        registry.get("a").record_success();
        for stats in registry.all_states().values() {
            assert_eq!(stats.state, CircuitState::Closed);
        }
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("meshtastic");
        a.record_failure();
        assert_eq!(registry.get("meshtastic").stats().total_failures, 1);
    }
}
