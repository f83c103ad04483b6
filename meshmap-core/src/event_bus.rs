//! # Event Bus — typed pub/sub between data-plane components
//!
//! Producers (broker subscriber, aggregator, alert engine) publish typed
//! events; consumers (history recorder, state tracker, drift detector,
//! WebSocket fan-out) subscribe by event type or with a wildcard. Delivery is
//! synchronous on the publisher's thread; each callback is shielded so one
//! failing subscriber never breaks the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::now_ts;

/// Event categories for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "node.position")]
    NodePosition,
    #[serde(rename = "node.info")]
    NodeInfo,
    #[serde(rename = "node.telemetry")]
    NodeTelemetry,
    #[serde(rename = "node.topology")]
    NodeTopology,
    #[serde(rename = "service.up")]
    ServiceUp,
    #[serde(rename = "service.down")]
    ServiceDown,
    #[serde(rename = "service.degraded")]
    ServiceDegraded,
    #[serde(rename = "alert.fired")]
    AlertFired,
    #[serde(rename = "data.refreshed")]
    DataRefreshed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NodePosition => "node.position",
            EventType::NodeInfo => "node.info",
            EventType::NodeTelemetry => "node.telemetry",
            EventType::NodeTopology => "node.topology",
            EventType::ServiceUp => "service.up",
            EventType::ServiceDown => "service.down",
            EventType::ServiceDegraded => "service.degraded",
            EventType::AlertFired => "alert.fired",
            EventType::DataRefreshed => "data.refreshed",
        }
    }
}

/// An event with type, timestamp, source tag, optional node fields, and an
/// arbitrary JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

impl Event {
    fn base(event_type: EventType, source: &str) -> Self {
        Self {
            event_type,
            timestamp: now_ts(),
            source: source.to_string(),
            node_id: None,
            lat: None,
            lon: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn position(node_id: &str, lat: f64, lon: f64, source: &str) -> Self {
        let mut event = Self::base(EventType::NodePosition, source);
        event.node_id = Some(node_id.to_string());
        event.lat = Some(lat);
        event.lon = Some(lon);
        event
    }

    pub fn info(node_id: &str, source: &str, data: serde_json::Map<String, Value>) -> Self {
        let mut event = Self::base(EventType::NodeInfo, source);
        event.node_id = Some(node_id.to_string());
        event.data = data;
        event
    }

    pub fn telemetry(node_id: &str, source: &str, data: serde_json::Map<String, Value>) -> Self {
        let mut event = Self::base(EventType::NodeTelemetry, source);
        event.node_id = Some(node_id.to_string());
        event.data = data;
        event
    }

    pub fn topology(node_id: &str, source: &str, data: serde_json::Map<String, Value>) -> Self {
        let mut event = Self::base(EventType::NodeTopology, source);
        event.node_id = Some(node_id.to_string());
        event.data = data;
        event
    }

    pub fn service_up(service: &str) -> Self {
        Self::base(EventType::ServiceUp, service)
    }

    pub fn service_down(service: &str, reason: &str) -> Self {
        let mut event = Self::base(EventType::ServiceDown, service);
        event
            .data
            .insert("reason".into(), Value::String(reason.to_string()));
        event
    }

    pub fn service_degraded(service: &str, reason: &str) -> Self {
        let mut event = Self::base(EventType::ServiceDegraded, service);
        event
            .data
            .insert("reason".into(), Value::String(reason.to_string()));
        event
    }

    pub fn alert_fired(data: serde_json::Map<String, Value>) -> Self {
        let mut event = Self::base(EventType::AlertFired, "alerts");
        event.data = data;
        event
    }
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    callback: Subscriber,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub total_errors: u64,
}

/// Thread-safe publish/subscribe bus. Wildcard subscribers (`subscribe(None)`)
/// receive every event.
pub struct EventBus {
    subscribers: Mutex<HashMap<Option<EventType>, Vec<Subscription>>>,
    next_sub_id: AtomicU64,
    // Stats counters are mutated in place; `reset()` zeroes them without
    // replacing the cells so concurrent publishers always observe the same
    // instances.
    total_published: AtomicU64,
    total_delivered: AtomicU64,
    total_errors: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            total_published: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    /// Register a callback for one event type, or for all events when
    /// `event_type` is `None`.
    pub fn subscribe(&self, event_type: Option<EventType>, callback: Subscriber) -> SubscriptionId {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(event_type)
            .or_default()
            .push(Subscription { id, callback });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, sub_id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock();
        let mut removed = false;
        subs.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.id != sub_id.0);
            removed |= list.len() < before;
            !list.is_empty()
        });
        removed
    }

    /// Publish to every matching subscriber plus wildcards. The delivery set
    /// is snapshotted once under the lock; callbacks run outside it, so
    /// subscribing from inside a callback is permitted.
    pub fn publish(&self, event: &Event) {
        let targets: Vec<Subscriber> = {
            let subs = self.subscribers.lock();
            let mut targets = Vec::new();
            if let Some(list) = subs.get(&Some(event.event_type)) {
                targets.extend(list.iter().map(|s| s.callback.clone()));
            }
            if let Some(list) = subs.get(&None) {
                targets.extend(list.iter().map(|s| s.callback.clone()));
            }
            targets
        };

        self.total_published.fetch_add(1, Ordering::Relaxed);

        for callback in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => {
                    self.total_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.total_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = event.event_type.as_str(), "event subscriber panicked");
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.total_published.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }

    /// Remove all subscribers and zero the stats counters in place.
    pub fn reset(&self) {
        self.subscribers.lock().clear();
        self.total_published.store(0, Ordering::Relaxed);
        self.total_delivered.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_typed_and_wildcard() {
        let bus = EventBus::new();
        let typed = Arc::new(AtomicUsize::new(0));
        let wild = Arc::new(AtomicUsize::new(0));

        let t = typed.clone();
        bus.subscribe(
            Some(EventType::NodePosition),
            Arc::new(move |_| {
                t.fetch_add(1, Ordering::Relaxed);
            }),
        );
        let w = wild.clone();
        bus.subscribe(
            None,
            Arc::new(move |_| {
                w.fetch_add(1, Ordering::Relaxed);
            }),
        );

        bus.publish(&Event::position("!aa", 40.0, -105.0, "mqtt"));
        bus.publish(&Event::service_up("aredn"));

        assert_eq!(typed.load(Ordering::Relaxed), 1);
        assert_eq!(wild.load(Ordering::Relaxed), 2);
        assert_eq!(bus.stats().total_published, 2);
        assert_eq!(bus.stats().total_delivered, 3);
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            Some(EventType::NodeInfo),
            Arc::new(|_| panic!("subscriber bug")),
        );
        let d = delivered.clone();
        bus.subscribe(
            Some(EventType::NodeInfo),
            Arc::new(move |_| {
                d.fetch_add(1, Ordering::Relaxed);
            }),
        );

        bus.publish(&Event::info("!aa", "mqtt", serde_json::Map::new()));

        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert_eq!(bus.stats().total_errors, 1);
        assert_eq!(bus.stats().total_delivered, 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(
            Some(EventType::NodeTelemetry),
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );

        bus.publish(&Event::telemetry("!aa", "mqtt", serde_json::Map::new()));
        assert!(bus.unsubscribe(id));
        bus.publish(&Event::telemetry("!aa", "mqtt", serde_json::Map::new()));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reset_clears_subscribers_keeps_zeroed_stats() {
        let bus = EventBus::new();
        bus.subscribe(None, Arc::new(|_| {}));
        bus.publish(&Event::service_up("meshtastic"));
        assert_eq!(bus.stats().total_published, 1);

        bus.reset();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.stats().total_published, 0);
        bus.publish(&Event::service_up("meshtastic"));
        assert_eq!(bus.stats().total_published, 1);
        assert_eq!(bus.stats().total_delivered, 0);
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_value(EventType::NodePosition).unwrap(),
            "node.position"
        );
        assert_eq!(
            serde_json::to_value(EventType::AlertFired).unwrap(),
            "alert.fired"
        );
    }
}
