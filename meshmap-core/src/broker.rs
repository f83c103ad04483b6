//! Live broker subscriber for the LoRa mesh feed.
//!
//! Maintains an MQTT session, subscribes to the wildcard topic tree, decodes
//! inbound service envelopes, updates the in-memory [`NodeStore`], and
//! publishes typed events for every handled envelope. Binary protobuf
//! envelopes are handled by an external decoder upstream of this process;
//! the JSON envelope mode carries the same logical fields and is decoded
//! here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::event_bus::{Event, EventBus};
use crate::geo::validate_coordinates;
use crate::reconnect::ReconnectStrategy;
use crate::store::{Neighbor, NodeStore, TelemetryUpdate};

/// Payloads above this size are dropped before decoding.
const MAX_PAYLOAD_SIZE: usize = 65_536;

/// Interval between stale-node cleanup passes while connected.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker: "mqtt.meshtastic.org".into(),
            port: 1883,
            topic: "msh/#".into(),
            username: None,
            password: None,
            tls: false,
        }
    }
}

/// A decoded upstream packet, reduced to the logical fields this service
/// consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Position {
        node_id: String,
        lat: f64,
        lon: f64,
        altitude: Option<f64>,
    },
    NodeInfo {
        node_id: String,
        name: Option<String>,
        short_name: Option<String>,
        hardware: Option<String>,
        role: Option<String>,
    },
    Telemetry {
        node_id: String,
        update: TelemetryUpdate,
    },
    NeighborInfo {
        node_id: String,
        neighbors: Vec<Neighbor>,
    },
}

pub struct BrokerSubscriber {
    config: BrokerConfig,
    store: Arc<NodeStore>,
    bus: Arc<EventBus>,
    running: AtomicBool,
    connected: AtomicBool,
    messages_received: AtomicU64,
    parse_errors: AtomicU64,
}

impl BrokerSubscriber {
    pub fn new(config: BrokerConfig, store: Arc<NodeStore>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            store,
            bus,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn stats(&self) -> Value {
        json!({
            "broker": self.config.broker,
            "port": self.config.port,
            "topic": self.config.topic,
            "connected": self.connected.load(Ordering::Relaxed),
            "running": self.running.load(Ordering::Relaxed),
            "has_credentials": self.config.username.is_some(),
            "messages_received": self.messages_received.load(Ordering::Relaxed),
            "parse_errors": self.parse_errors.load(Ordering::Relaxed),
            "node_count": self.store.node_count(),
        })
    }

    /// Connection loop. Runs until the shutdown signal flips; reconnects with
    /// exponential backoff and periodically removes long-dead nodes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::Relaxed);
        let strategy = ReconnectStrategy::for_broker();
        let mut last_cleanup = std::time::Instant::now();

        'outer: while !*shutdown.borrow() {
            let mut options = MqttOptions::new(
                format!("meshmap-{:08x}", std::process::id()),
                self.config.broker.clone(),
                self.config.port,
            );
            options.set_keep_alive(Duration::from_secs(30));
            if let Some(ref user) = self.config.username {
                options.set_credentials(user.clone(), self.config.password.clone().unwrap_or_default());
            }
            if self.config.tls {
                options.set_transport(rumqttc::Transport::tls_with_default_config());
            }

            let (client, mut eventloop) = AsyncClient::new(options, 64);
            info!(
                broker = %self.config.broker,
                port = self.config.port,
                topic = %self.config.topic,
                attempt = strategy.attempt() + 1,
                "broker subscriber connecting"
            );

            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break 'outer,
                    event = eventloop.poll() => event,
                };

                match event {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        self.connected.store(true, Ordering::Relaxed);
                        strategy.reset();
                        info!(broker = %self.config.broker, nodes = self.store.node_count(),
                            "broker connected, subscribing");
                        if let Err(e) = client
                            .subscribe(self.config.topic.clone(), QoS::AtMostOnce)
                            .await
                        {
                            warn!(error = %e, "broker subscribe failed");
                        }
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        self.handle_payload(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.connected.store(false, Ordering::Relaxed);
                        let delay = strategy.next_delay();
                        warn!(
                            error = %e,
                            delay_secs = format!("{delay:.1}"),
                            attempt = strategy.attempt(),
                            "broker connection lost, reconnecting"
                        );
                        tokio::select! {
                            _ = shutdown.changed() => break 'outer,
                            _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                        }
                        break;
                    }
                }

                if last_cleanup.elapsed() > CLEANUP_INTERVAL {
                    let removed = self.store.cleanup_stale();
                    if removed > 0 {
                        debug!(removed, "removed stale nodes from broker store");
                    }
                    last_cleanup = std::time::Instant::now();
                }
            }
        }

        self.connected.store(false, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
        info!("broker subscriber stopped");
    }

    fn handle_payload(&self, topic: &str, payload: &[u8]) {
        if payload.len() > MAX_PAYLOAD_SIZE {
            warn!(
                topic = %sanitize_topic(topic),
                bytes = payload.len(),
                "rejected oversized broker payload"
            );
            return;
        }
        self.messages_received.fetch_add(1, Ordering::Relaxed);

        match decode_envelope(payload) {
            Ok(Some(envelope)) => self.apply_envelope(envelope),
            Ok(None) => {}
            Err(_) => {
                let errors = self.parse_errors.fetch_add(1, Ordering::Relaxed) + 1;
                // Unparseable traffic is routine on public brokers; log a
                // running total instead of per-message noise.
                if errors % 1000 == 0 {
                    warn!(total = errors, "unparseable broker messages dropped");
                }
            }
        }
    }

    /// Apply a decoded envelope to the store and emit the matching event.
    pub fn apply_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::Position {
                node_id,
                lat,
                lon,
                altitude,
            } => {
                // Null Island and out-of-range fixes never reach the store or
                // the event bus.
                let Ok((lat, lon)) = validate_coordinates(lat, lon, false) else {
                    return;
                };
                self.store
                    .update_position(&node_id, lat, lon, altitude, None);
                self.bus.publish(&Event::position(&node_id, lat, lon, "mqtt"));
            }
            Envelope::NodeInfo {
                node_id,
                name,
                short_name,
                hardware,
                role,
            } => {
                self.store.update_nodeinfo(
                    &node_id,
                    name.as_deref(),
                    short_name.as_deref(),
                    hardware.as_deref(),
                    role.as_deref(),
                );
                let mut data = serde_json::Map::new();
                if let Some(v) = name {
                    data.insert("name".into(), Value::String(v));
                }
                if let Some(v) = short_name {
                    data.insert("short_name".into(), Value::String(v));
                }
                if let Some(v) = hardware {
                    data.insert("hardware".into(), Value::String(v));
                }
                if let Some(v) = role {
                    data.insert("role".into(), Value::String(v));
                }
                self.bus.publish(&Event::info(&node_id, "mqtt", data));
            }
            Envelope::Telemetry { node_id, update } => {
                let data = telemetry_event_data(&update);
                self.store.update_telemetry(&node_id, update);
                self.bus.publish(&Event::telemetry(&node_id, "mqtt", data));
            }
            Envelope::NeighborInfo { node_id, neighbors } => {
                let mut data = serde_json::Map::new();
                data.insert("neighbor_count".into(), Value::from(neighbors.len()));
                self.store.update_neighbors(&node_id, neighbors);
                self.bus.publish(&Event::topology(&node_id, "mqtt", data));
            }
        }
    }
}

fn telemetry_event_data(update: &TelemetryUpdate) -> serde_json::Map<String, Value> {
    let mut data = serde_json::Map::new();
    let mut put = |key: &str, value: Option<f64>| {
        if let Some(v) = value {
            data.insert(key.to_string(), json!(v));
        }
    };
    put("battery", update.battery);
    put("voltage", update.voltage);
    put("channel_util", update.channel_util);
    put("air_util_tx", update.air_util_tx);
    put("temperature", update.temperature);
    put("humidity", update.humidity);
    put("pressure", update.pressure);
    put("iaq", update.iaq);
    data
}

/// Strip node-specific topic segments before logging.
fn sanitize_topic(topic: &str) -> String {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() > 5 {
        format!("{}/...", parts[..5].join("/"))
    } else {
        topic.to_string()
    }
}

// ── Envelope decoding ────────────────────────────────────────────────────────

/// Decode a JSON service envelope. `Ok(None)` means a well-formed message of
/// a type this service does not consume; `Err` means unparseable.
pub fn decode_envelope(payload: &[u8]) -> Result<Option<Envelope>, serde_json::Error> {
    let doc: Value = serde_json::from_slice(payload)?;

    let node_id = match sender_id(&doc) {
        Some(id) => id,
        None => return Ok(None),
    };
    let body = doc.get("payload").cloned().unwrap_or(Value::Null);
    let msg_type = doc.get("type").and_then(Value::as_str).unwrap_or_default();

    let envelope = match msg_type {
        "position" => decode_position(&node_id, &body),
        "nodeinfo" => decode_nodeinfo(&node_id, &body),
        "telemetry" => decode_telemetry(&node_id, &body),
        "neighborinfo" => decode_neighborinfo(&node_id, &body),
        _ if body.get("latitude_i").is_some() => decode_position(&node_id, &body),
        _ => None,
    };
    Ok(envelope)
}

fn sender_id(doc: &Value) -> Option<String> {
    let sender = doc.get("sender").or_else(|| doc.get("from"))?;
    match sender {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => n.as_u64().map(|v| format!("!{v:08x}")),
        _ => None,
    }
}

fn decode_position(node_id: &str, body: &Value) -> Option<Envelope> {
    let lat_i = body.get("latitude_i").and_then(Value::as_i64)?;
    let lon_i = body.get("longitude_i").and_then(Value::as_i64)?;
    Some(Envelope::Position {
        node_id: node_id.to_string(),
        lat: lat_i as f64 / 1e7,
        lon: lon_i as f64 / 1e7,
        altitude: body
            .get("altitude")
            .and_then(Value::as_f64)
            .and_then(|v| safe_range(v, -500.0, 100_000.0)),
    })
}

fn decode_nodeinfo(node_id: &str, body: &Value) -> Option<Envelope> {
    let text = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some(Envelope::NodeInfo {
        node_id: node_id.to_string(),
        name: text("long_name"),
        short_name: text("short_name"),
        hardware: text("hw_model").or_else(|| text("hardware")),
        role: text("role"),
    })
}

fn decode_telemetry(node_id: &str, body: &Value) -> Option<Envelope> {
    let num = |key: &str, low: f64, high: f64| {
        body.get(key).and_then(Value::as_f64).and_then(|v| safe_range(v, low, high))
    };
    let update = TelemetryUpdate {
        battery: num("battery_level", 0.0, 100.0).or_else(|| num("battery", 0.0, 100.0)),
        voltage: num("voltage", 0.0, 100.0),
        channel_util: num("channel_utilization", 0.0, 100.0),
        air_util_tx: num("air_util_tx", 0.0, 100.0),
        temperature: num("temperature", -100.0, 200.0),
        humidity: num("relative_humidity", 0.0, 100.0),
        pressure: num("barometric_pressure", 0.0, 2000.0),
        iaq: num("iaq", 0.0, 500.0),
        pm25: num("pm25_standard", 0.0, 10_000.0),
        co2: num("co2", 0.0, 40_000.0),
        voc: num("pm_voc_idx", 0.0, 500.0),
        nox: num("pm_nox_idx", 0.0, 500.0),
        heart_bpm: num("heart_bpm", 0.0, 300.0),
        spo2: num("spO2", 0.0, 100.0).or_else(|| num("spo2", 0.0, 100.0)),
        body_temperature: num("body_temperature", 20.0, 50.0),
    };
    Some(Envelope::Telemetry {
        node_id: node_id.to_string(),
        update,
    })
}

fn decode_neighborinfo(node_id: &str, body: &Value) -> Option<Envelope> {
    let neighbors = body
        .get("neighbors")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|n| {
            let id = match n.get("node_id")? {
                Value::String(s) => s.clone(),
                Value::Number(num) => format!("!{:08x}", num.as_u64()?),
                _ => return None,
            };
            Some(Neighbor {
                node_id: id,
                snr: n.get("snr").and_then(Value::as_f64),
            })
        })
        .collect();
    Some(Envelope::NeighborInfo {
        node_id: node_id.to_string(),
        neighbors,
    })
}

fn safe_range(v: f64, low: f64, high: f64) -> Option<f64> {
    (v.is_finite() && (low..=high).contains(&v)).then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber() -> Arc<BrokerSubscriber> {
        Arc::new(BrokerSubscriber::new(
            BrokerConfig::default(),
            Arc::new(NodeStore::default()),
            Arc::new(EventBus::new()),
        ))
    }

    #[test]
    fn test_decode_position_envelope() {
        let payload = br#"{"sender": 2882400001, "type": "position",
            "payload": {"latitude_i": 401234567, "longitude_i": -1051234567, "altitude": 1601}}"#;
        let envelope = decode_envelope(payload).unwrap().unwrap();
        match envelope {
            Envelope::Position { node_id, lat, lon, altitude } => {
                assert_eq!(node_id, "!abcdef01");
                assert!((lat - 40.1234567).abs() < 1e-9);
                assert!((lon + 105.1234567).abs() < 1e-9);
                assert_eq!(altitude, Some(1601.0));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_envelope(b"not json").is_err());
        // Valid JSON of an unhandled type is silently skipped.
        assert_eq!(
            decode_envelope(br#"{"sender": 1, "type": "traceroute", "payload": {}}"#).unwrap(),
            None
        );
    }

    #[test]
    fn test_null_island_position_never_emitted() {
        let sub = subscriber();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let s = seen.clone();
        sub.bus.subscribe(
            Some(crate::event_bus::EventType::NodePosition),
            Arc::new(move |_| {
                s.fetch_add(1, Ordering::Relaxed);
            }),
        );

        sub.apply_envelope(Envelope::Position {
            node_id: "!aa".into(),
            lat: 0.0,
            lon: 0.0,
            altitude: None,
        });

        assert_eq!(seen.load(Ordering::Relaxed), 0);
        assert!(sub.store.get_node("!aa").is_none());
    }

    #[test]
    fn test_telemetry_envelope_updates_store_and_bus() {
        let sub = subscriber();
        let payload = br#"{"sender": "!cafe01", "type": "telemetry",
            "payload": {"battery_level": 85, "voltage": 3.9, "channel_utilization": 12.5}}"#;
        let envelope = decode_envelope(payload).unwrap().unwrap();
        sub.apply_envelope(envelope);

        let node = sub.store.get_node("!cafe01").unwrap();
        assert_eq!(node.battery, Some(85.0));
        assert_eq!(node.channel_util, Some(12.5));
        assert_eq!(sub.bus.stats().total_published, 1);
    }

    #[test]
    fn test_telemetry_range_clamping() {
        let payload = br#"{"sender": 1, "type": "telemetry",
            "payload": {"battery_level": 250, "voltage": 3.7}}"#;
        match decode_envelope(payload).unwrap().unwrap() {
            Envelope::Telemetry { update, .. } => {
                assert_eq!(update.battery, None); // out of range -> missing
                assert_eq!(update.voltage, Some(3.7));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_neighborinfo_builds_topology() {
        let sub = subscriber();
        sub.apply_envelope(Envelope::Position {
            node_id: "!aa".into(),
            lat: 40.0,
            lon: -105.0,
            altitude: None,
        });
        sub.apply_envelope(Envelope::Position {
            node_id: "!bb".into(),
            lat: 40.5,
            lon: -105.5,
            altitude: None,
        });
        let payload = br#"{"sender": "!aa", "type": "neighborinfo",
            "payload": {"neighbors": [{"node_id": "!bb", "snr": 9.5}]}}"#;
        sub.apply_envelope(decode_envelope(payload).unwrap().unwrap());

        let links = sub.store.topology_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].quality, crate::topology::LinkQuality::Excellent);
    }

    #[test]
    fn test_oversized_payload_dropped() {
        let sub = subscriber();
        let big = vec![b'x'; MAX_PAYLOAD_SIZE + 1];
        sub.handle_payload("msh/US/2/json/x/y/z", &big);
        assert_eq!(sub.messages_received.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_sanitize_topic() {
        assert_eq!(sanitize_topic("msh/US/2/json"), "msh/US/2/json");
        assert_eq!(
            sanitize_topic("msh/US/2/json/LongFast/!deadbeef/extra"),
            "msh/US/2/json/LongFast/..."
        );
    }
}
