//! Server lifecycle state machine.
//!
//! Formalizes startup and shutdown so invalid sequences (double activation,
//! teardown of a never-started server) fail loudly instead of corrupting
//! state. Transition listeners run outside the lock.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{MapsError, MapsResult};
use crate::now_ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Loaded,
    Activating,
    Active,
    Deactivating,
    Stopped,
    Error,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Loaded => "loaded",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Deactivating => "deactivating",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        }
    }

    fn allows(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Loaded, Activating)
                | (Activating, Active)
                | (Activating, Error)
                | (Active, Deactivating)
                | (Deactivating, Stopped)
                | (Deactivating, Error)
                | (Error, Activating)
                | (Stopped, Activating)
        )
    }
}

pub type LifecycleListener = Arc<dyn Fn(LifecycleState, LifecycleState) + Send + Sync>;

struct LifecycleInner {
    state: LifecycleState,
    history: Vec<(LifecycleState, f64)>,
    last_error: Option<String>,
    listeners: Vec<LifecycleListener>,
}

pub struct Lifecycle {
    inner: Mutex<LifecycleInner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: LifecycleState::Loaded,
                history: vec![(LifecycleState::Loaded, now_ts())],
                last_error: None,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn on_transition(&self, listener: LifecycleListener) {
        self.inner.lock().listeners.push(listener);
    }

    /// Transition, validating the edge is legal.
    pub fn transition_to(&self, next: LifecycleState) -> MapsResult<()> {
        let (old, listeners) = {
            let mut inner = self.inner.lock();
            if !inner.state.allows(next) {
                return Err(MapsError::Lifecycle(format!(
                    "cannot transition from {} to {}",
                    inner.state.as_str(),
                    next.as_str()
                )));
            }
            let old = inner.state;
            inner.state = next;
            inner.history.push((next, now_ts()));
            if next != LifecycleState::Error {
                inner.last_error = None;
            }
            (old, inner.listeners.clone())
        };

        debug!(from = old.as_str(), to = next.as_str(), "lifecycle transition");
        for listener in listeners {
            listener(old, next);
        }
        Ok(())
    }

    /// Record an error and enter the Error state when the edge allows it.
    pub fn record_error(&self, error: &str) {
        self.inner.lock().last_error = Some(error.to_string());
        if self.transition_to(LifecycleState::Error).is_err() {
            warn!(state = self.state().as_str(), error, "error recorded outside an error edge");
        }
    }

    /// Seconds since entering Active, or None while not active.
    pub fn uptime_seconds(&self) -> Option<u64> {
        let inner = self.inner.lock();
        if inner.state != LifecycleState::Active {
            return None;
        }
        inner
            .history
            .iter()
            .rev()
            .find(|(state, _)| *state == LifecycleState::Active)
            .map(|(_, at)| (now_ts() - at).max(0.0) as u64)
    }

    pub fn info(&self) -> Value {
        let inner = self.inner.lock();
        let mut info = json!({
            "state": inner.state.as_str(),
            "can_activate": inner.state.allows(LifecycleState::Activating),
            "can_deactivate": inner.state.allows(LifecycleState::Deactivating),
            "transition_count": inner.history.len() - 1,
        });
        if let Some(ref error) = inner.last_error {
            info["last_error"] = json!(error);
        }
        drop(inner);
        if let Some(uptime) = self.uptime_seconds() {
            info["uptime_seconds"] = json!(uptime);
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle_path() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition_to(LifecycleState::Activating).unwrap();
        lifecycle.transition_to(LifecycleState::Active).unwrap();
        assert!(lifecycle.is_active());
        lifecycle.transition_to(LifecycleState::Deactivating).unwrap();
        lifecycle.transition_to(LifecycleState::Stopped).unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition_to(LifecycleState::Active).is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Loaded);
    }

    #[test]
    fn test_error_then_retry() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition_to(LifecycleState::Activating).unwrap();
        lifecycle.record_error("port in use");
        assert_eq!(lifecycle.state(), LifecycleState::Error);
        assert_eq!(lifecycle.last_error().as_deref(), Some("port in use"));

        lifecycle.transition_to(LifecycleState::Activating).unwrap();
        lifecycle.transition_to(LifecycleState::Active).unwrap();
        assert!(lifecycle.last_error().is_none());
    }

    #[test]
    fn test_listener_sees_transitions() {
        let lifecycle = Lifecycle::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        lifecycle.on_transition(Arc::new(move |old, new| {
            s.lock().push((old, new));
        }));
        lifecycle.transition_to(LifecycleState::Activating).unwrap();
        lifecycle.transition_to(LifecycleState::Active).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (LifecycleState::Loaded, LifecycleState::Activating),
                (LifecycleState::Activating, LifecycleState::Active),
            ]
        );
    }

    #[test]
    fn test_uptime_only_while_active() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.uptime_seconds().is_none());
        lifecycle.transition_to(LifecycleState::Activating).unwrap();
        lifecycle.transition_to(LifecycleState::Active).unwrap();
        assert!(lifecycle.uptime_seconds().is_some());
    }
}
