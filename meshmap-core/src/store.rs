//! In-memory node store fed by the live broker subscriber.
//!
//! Mapping `node_id -> NodeRecord`, capped at `max_nodes` with LRU eviction
//! by observation time. Reads mark records stale (`is_online = false`) once
//! `now - last_seen` exceeds the stale timeout; a periodic cleanup removes
//! records past the hard removal threshold. Every eviction or removal fires
//! the configured callback exactly once, outside the store mutex, so owners
//! can prune the state tracker, drift detector, and health scorer in sync.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::geo::{validate_coordinates, Feature, NodeProperties};
use crate::now_epoch;
use crate::topology::{links_to_geojson, TopologyLink};

/// Seconds before a node is reported offline (30 minutes).
pub const DEFAULT_STALE_SECONDS: i64 = 1800;

/// Seconds before a node is removed from the store entirely (72 hours).
pub const DEFAULT_REMOVE_SECONDS: i64 = 259_200;

pub const DEFAULT_MAX_NODES: usize = 10_000;

/// Everything the broker has learned about one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub hardware: Option<String>,
    pub role: Option<String>,
    pub region: Option<String>,
    pub modem_preset: Option<String>,
    pub battery: Option<f64>,
    pub voltage: Option<f64>,
    pub channel_util: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub iaq: Option<f64>,
    pub pm25: Option<f64>,
    pub co2: Option<f64>,
    pub voc: Option<f64>,
    pub nox: Option<f64>,
    pub heart_bpm: Option<f64>,
    pub spo2: Option<f64>,
    pub body_temperature: Option<f64>,
    pub snr: Option<f64>,
    pub last_seen: i64,
    pub is_online: bool,
}

/// Telemetry update payload; `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryUpdate {
    pub battery: Option<f64>,
    pub voltage: Option<f64>,
    pub channel_util: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub iaq: Option<f64>,
    pub pm25: Option<f64>,
    pub co2: Option<f64>,
    pub voc: Option<f64>,
    pub nox: Option<f64>,
    pub heart_bpm: Option<f64>,
    pub spo2: Option<f64>,
    pub body_temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub node_id: String,
    pub snr: Option<f64>,
}

pub type RemovalCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct StoreInner {
    nodes: HashMap<String, NodeRecord>,
    neighbors: HashMap<String, Vec<Neighbor>>,
}

pub struct NodeStore {
    inner: Mutex<StoreInner>,
    stale_seconds: i64,
    remove_seconds: i64,
    max_nodes: usize,
    on_node_removed: Mutex<Option<RemovalCallback>>,
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_SECONDS, DEFAULT_REMOVE_SECONDS, DEFAULT_MAX_NODES)
    }
}

impl NodeStore {
    pub fn new(stale_seconds: i64, remove_seconds: i64, max_nodes: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                nodes: HashMap::new(),
                neighbors: HashMap::new(),
            }),
            stale_seconds,
            remove_seconds,
            max_nodes,
            on_node_removed: Mutex::new(None),
        }
    }

    /// Install the eviction/removal callback. Invoked exactly once per
    /// removed node id, never under the store mutex.
    pub fn set_on_node_removed(&self, callback: RemovalCallback) {
        *self.on_node_removed.lock() = Some(callback);
    }

    pub fn update_position(
        &self,
        node_id: &str,
        lat: f64,
        lon: f64,
        altitude: Option<f64>,
        timestamp: Option<i64>,
    ) {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = self.make_room(&mut inner, node_id);
            let node = inner
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| new_record(node_id));
            node.latitude = Some(lat);
            node.longitude = Some(lon);
            if altitude.is_some() {
                node.altitude = altitude;
            }
            node.last_seen = timestamp.unwrap_or_else(now_epoch);
            node.is_online = true;
            evicted
        };
        self.notify_removed(evicted);
    }

    pub fn update_nodeinfo(
        &self,
        node_id: &str,
        name: Option<&str>,
        short_name: Option<&str>,
        hardware: Option<&str>,
        role: Option<&str>,
    ) {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = self.make_room(&mut inner, node_id);
            let node = inner
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| new_record(node_id));
            if let Some(v) = name.filter(|v| !v.is_empty()) {
                node.name = Some(v.to_string());
            }
            if let Some(v) = short_name.filter(|v| !v.is_empty()) {
                node.short_name = Some(v.to_string());
            }
            if let Some(v) = hardware.filter(|v| !v.is_empty()) {
                node.hardware = Some(v.to_string());
            }
            if let Some(v) = role.filter(|v| !v.is_empty()) {
                node.role = Some(v.to_string());
            }
            node.last_seen = now_epoch();
            evicted
        };
        self.notify_removed(evicted);
    }

    pub fn update_telemetry(&self, node_id: &str, update: TelemetryUpdate) {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = self.make_room(&mut inner, node_id);
            let node = inner
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| new_record(node_id));
            merge_telemetry(node, &update);
            node.last_seen = now_epoch();
            evicted
        };
        self.notify_removed(evicted);
    }

    pub fn update_neighbors(&self, node_id: &str, neighbors: Vec<Neighbor>) {
        let mut inner = self.inner.lock();
        inner.neighbors.insert(node_id.to_string(), neighbors);
    }

    /// Single-node lookup, accepting IDs with or without the `!` prefix.
    /// Returns a copy; readers never mutate the stored record.
    pub fn get_node(&self, node_id: &str) -> Option<NodeRecord> {
        let inner = self.inner.lock();
        let record = inner.nodes.get(node_id).or_else(|| {
            let alt = match node_id.strip_prefix('!') {
                Some(bare) => bare.to_string(),
                None => format!("!{node_id}"),
            };
            inner.nodes.get(&alt)
        })?;
        let mut copy = record.clone();
        copy.is_online = now_epoch() - copy.last_seen <= self.stale_seconds;
        Some(copy)
    }

    /// All nodes with valid coordinates, stale entries flagged offline.
    pub fn get_all_nodes(&self) -> Vec<NodeRecord> {
        let now = now_epoch();
        let inner = self.inner.lock();
        inner
            .nodes
            .values()
            .filter_map(|node| {
                let (lat, lon) = (node.latitude?, node.longitude?);
                validate_coordinates(lat, lon, false).ok()?;
                let mut copy = node.clone();
                if now - copy.last_seen > self.stale_seconds {
                    copy.is_online = false;
                }
                Some(copy)
            })
            .collect()
    }

    /// Directed edges with both endpoints geolocated, classified by SNR.
    pub fn topology_links(&self) -> Vec<TopologyLink> {
        let inner = self.inner.lock();
        let mut links = Vec::new();
        for (node_id, neighbors) in &inner.neighbors {
            let Some(src) = inner.nodes.get(node_id) else {
                continue;
            };
            let Some(src_coords) = valid_coords(src) else {
                continue;
            };
            for neighbor in neighbors {
                let Some(dst) = inner.nodes.get(&neighbor.node_id) else {
                    continue;
                };
                let Some(dst_coords) = valid_coords(dst) else {
                    continue;
                };
                links.push(TopologyLink::new(
                    node_id.clone(),
                    neighbor.node_id.clone(),
                    neighbor.snr,
                    "meshtastic",
                    None,
                    src_coords,
                    dst_coords,
                ));
            }
        }
        links
    }

    pub fn topology_geojson(&self) -> crate::geo::FeatureCollection {
        links_to_geojson(&self.topology_links())
    }

    /// Render store contents as features for the Meshtastic collector.
    pub fn to_features(&self) -> Vec<Feature> {
        self.get_all_nodes()
            .into_iter()
            .filter_map(|node| {
                let (lat, lon) = (node.latitude?, node.longitude?);
                let props = record_properties(&node);
                Feature::point(node.id.clone(), lat, lon, "meshtastic", props).ok()
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Remove nodes past the hard removal threshold. Returns removed count.
    pub fn cleanup_stale(&self) -> usize {
        let now = now_epoch();
        let removed: Vec<String> = {
            let mut inner = self.inner.lock();
            let stale: Vec<String> = inner
                .nodes
                .iter()
                .filter(|(_, n)| now - n.last_seen > self.remove_seconds)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                inner.nodes.remove(id);
                inner.neighbors.remove(id);
            }
            stale
        };
        let count = removed.len();
        for id in removed {
            self.notify_removed(Some(id));
        }
        count
    }

    /// Evict the LRU entry when inserting `node_id` would exceed the cap.
    /// Lock held by the caller; returns the evicted id for post-lock notify.
    fn make_room(&self, inner: &mut StoreInner, node_id: &str) -> Option<String> {
        if inner.nodes.contains_key(node_id) || inner.nodes.len() < self.max_nodes {
            return None;
        }
        let oldest = inner
            .nodes
            .iter()
            .min_by_key(|(_, n)| n.last_seen)
            .map(|(id, _)| id.clone())?;
        inner.nodes.remove(&oldest);
        inner.neighbors.remove(&oldest);
        Some(oldest)
    }

    fn notify_removed(&self, evicted: Option<String>) {
        if let Some(id) = evicted {
            let callback = self.on_node_removed.lock().clone();
            if let Some(cb) = callback {
                cb(&id);
            }
        }
    }
}

fn new_record(node_id: &str) -> NodeRecord {
    NodeRecord {
        id: node_id.to_string(),
        is_online: true,
        last_seen: now_epoch(),
        ..Default::default()
    }
}

fn valid_coords(node: &NodeRecord) -> Option<(f64, f64)> {
    validate_coordinates(node.latitude?, node.longitude?, false).ok()
}

fn merge_telemetry(node: &mut NodeRecord, update: &TelemetryUpdate) {
    macro_rules! merge {
        ($($field:ident),+) => {
            $(if update.$field.is_some() { node.$field = update.$field; })+
        };
    }
    merge!(
        battery, voltage, channel_util, air_util_tx, temperature, humidity, pressure, iaq,
        pm25, co2, voc, nox, heart_bpm, spo2, body_temperature
    );
}

fn record_properties(node: &NodeRecord) -> NodeProperties {
    let mut props = NodeProperties::new(node.id.clone());
    props.name = node.name.clone();
    props.short_name = node.short_name.clone();
    props.hardware = node.hardware.clone();
    props.role = node.role.clone();
    props.region = node.region.clone();
    props.modem_preset = node.modem_preset.clone();
    props.battery = node.battery;
    props.voltage = node.voltage;
    props.channel_util = node.channel_util;
    props.air_util_tx = node.air_util_tx;
    props.temperature = node.temperature;
    props.humidity = node.humidity;
    props.pressure = node.pressure;
    props.iaq = node.iaq;
    props.pm25 = node.pm25;
    props.co2 = node.co2;
    props.voc = node.voc;
    props.nox = node.nox;
    props.heart_bpm = node.heart_bpm;
    props.spo2 = node.spo2;
    props.body_temperature = node.body_temperature;
    props.snr = node.snr;
    props.altitude = node.altitude;
    props.last_seen = Some(node.last_seen);
    props.is_online = Some(node.is_online);
    props.node_type = Some("meshtastic_node".into());
    props
}
