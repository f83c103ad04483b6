//! Per-host single-holder leases.
//!
//! Some upstream daemons accept exactly one TCP client at a time; concurrent
//! connectors see "connection refused" or broken pipes. The lease manager is
//! a registry of named locks keyed `host:port`; the guard releases on every
//! exit path (drop runs on success, error, and unwind).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};
use tracing::debug;

use crate::now_ts;

#[derive(Default)]
struct SlotState {
    held_by: Option<String>,
    acquired_at: f64,
    total_acquisitions: u64,
    total_timeouts: u64,
    total_releases: u64,
}

struct LeaseSlot {
    key: String,
    state: Mutex<SlotState>,
    freed: Condvar,
}

impl LeaseSlot {
    fn try_acquire(self: &Arc<Self>, holder: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.held_by.is_some() {
            if self.freed.wait_until(&mut state, deadline).timed_out() {
                state.total_timeouts += 1;
                debug!(
                    lease = %self.key,
                    held_by = state.held_by.as_deref().unwrap_or("unknown"),
                    "lease acquire timed out"
                );
                return false;
            }
        }
        state.held_by = Some(if holder.is_empty() { "unknown".into() } else { holder.into() });
        state.acquired_at = now_ts();
        state.total_acquisitions += 1;
        debug!(lease = %self.key, holder = %holder, "lease acquired");
        true
    }

    fn release(&self) {
        let mut state = self.state.lock();
        let holder = state.held_by.take();
        state.acquired_at = 0.0;
        state.total_releases += 1;
        debug!(lease = %self.key, holder = holder.as_deref().unwrap_or("unknown"), "lease released");
        drop(state);
        self.freed.notify_one();
    }

    fn stats(&self) -> Value {
        let state = self.state.lock();
        json!({
            "key": self.key,
            "is_locked": state.held_by.is_some(),
            "holder": state.held_by,
            "held_seconds": (state.acquired_at > 0.0)
                .then(|| ((now_ts() - state.acquired_at) * 10.0).round() / 10.0),
            "total_acquisitions": state.total_acquisitions,
            "total_timeouts": state.total_timeouts,
            "total_releases": state.total_releases,
        })
    }
}

/// RAII lease handle; releasing happens in `Drop`, so the lease is returned
/// on success, error, and panic alike.
pub struct LeaseGuard {
    slot: Arc<LeaseSlot>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Registry of per-`host:port` leases. Each manager instance owns its own
/// slot map; separate managers never share or collide.
pub struct LeaseManager {
    slots: Mutex<HashMap<String, Arc<LeaseSlot>>>,
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseManager {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, host: &str, port: u16) -> Arc<LeaseSlot> {
        let key = format!("{host}:{port}");
        self.slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(LeaseSlot {
                    key,
                    state: Mutex::new(SlotState::default()),
                    freed: Condvar::new(),
                })
            })
            .clone()
    }

    /// Acquire the `host:port` lease, waiting up to `timeout`. Returns `None`
    /// on timeout (the caller falls back to its cache).
    pub fn acquire(
        &self,
        host: &str,
        port: u16,
        holder: &str,
        timeout: Duration,
    ) -> Option<LeaseGuard> {
        let slot = self.slot(host, port);
        slot.try_acquire(holder, timeout)
            .then(|| LeaseGuard { slot })
    }

    pub fn stats(&self) -> Vec<Value> {
        let slots = self.slots.lock();
        slots.values().map(|s| s.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_hold_and_timeout() {
        let manager = LeaseManager::new();
        let guard = manager
            .acquire("localhost", 4403, "collector", Duration::from_millis(50))
            .unwrap();
        assert!(manager
            .acquire("localhost", 4403, "other", Duration::from_millis(20))
            .is_none());
        drop(guard);
        assert!(manager
            .acquire("localhost", 4403, "other", Duration::from_millis(20))
            .is_some());
    }

    #[test]
    fn test_distinct_hosts_independent() {
        let manager = LeaseManager::new();
        let _a = manager
            .acquire("localhost", 4403, "a", Duration::from_millis(20))
            .unwrap();
        let _b = manager
            .acquire("localhost", 4404, "b", Duration::from_millis(20))
            .unwrap();
    }

    #[test]
    fn test_release_on_panic() {
        let manager = Arc::new(LeaseManager::new());
        let m = manager.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = m
                .acquire("localhost", 4403, "panicker", Duration::from_millis(20))
                .unwrap();
            panic!("fetch blew up");
        }));
        assert!(result.is_err());
        // The guard's Drop released the lease during unwind.
        assert!(manager
            .acquire("localhost", 4403, "next", Duration::from_millis(20))
            .is_some());
    }

    #[test]
    fn test_stats_counters() {
        let manager = LeaseManager::new();
        {
            let _g = manager
                .acquire("h", 1, "x", Duration::from_millis(10))
                .unwrap();
            let _ = manager.acquire("h", 1, "y", Duration::from_millis(1));
        }
        let stats = manager.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0]["total_acquisitions"], 1);
        assert_eq!(stats[0]["total_timeouts"], 1);
        assert_eq!(stats[0]["total_releases"], 1);
        assert_eq!(stats[0]["is_locked"], false);
    }

    #[test]
    fn test_instances_isolated() {
        let a = LeaseManager::new();
        let b = LeaseManager::new();
        let _guard = a
            .acquire("localhost", 4403, "a", Duration::from_millis(10))
            .unwrap();
        // A different manager instance has its own slot map.
        assert!(b
            .acquire("localhost", 4403, "b", Duration::from_millis(10))
            .is_some());
    }
}
