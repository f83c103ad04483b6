//! Config drift detection.
//!
//! Compares successive observations of a node's identity and radio
//! parameters against its last-known snapshot. A node silently changing
//! region or modem preset can break its mesh; a role or hardware change
//! suggests a re-flash; name changes are cosmetic. Each change emits a
//! severity-tagged drift record into bounded per-node history.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::now_ts;

pub const DEFAULT_MAX_HISTORY: usize = 50;
pub const DEFAULT_MAX_NODES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Info,
    Warning,
    Critical,
}

impl DriftSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            DriftSeverity::Info => "info",
            DriftSeverity::Warning => "warning",
            DriftSeverity::Critical => "critical",
        }
    }
}

/// Tracked fields and the severity of a change to each.
pub fn field_severity(field: &str) -> Option<DriftSeverity> {
    match field {
        "region" | "modem_preset" | "channel_name" => Some(DriftSeverity::Critical),
        "role" | "hardware" | "hop_limit" | "tx_power" | "tx_enabled" => {
            Some(DriftSeverity::Warning)
        }
        "name" | "short_name" | "uplink_enabled" | "downlink_enabled" => {
            Some(DriftSeverity::Info)
        }
        _ => None,
    }
}

/// One detected configuration change.
#[derive(Debug, Clone, Serialize)]
pub struct Drift {
    pub node_id: String,
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub severity: DriftSeverity,
    pub timestamp: f64,
}

struct NodeSnapshot {
    fields: HashMap<String, Value>,
    last_seen: f64,
}

pub type DriftCallback = Arc<dyn Fn(&str, &[Drift]) + Send + Sync>;

struct DetectorInner {
    snapshots: HashMap<String, NodeSnapshot>,
    history: HashMap<String, Vec<Drift>>,
    total_drifts: u64,
}

pub struct ConfigDriftDetector {
    max_history: usize,
    max_nodes: usize,
    inner: Mutex<DetectorInner>,
    on_drift: Mutex<Option<DriftCallback>>,
}

impl Default for ConfigDriftDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY, DEFAULT_MAX_NODES)
    }
}

impl ConfigDriftDetector {
    pub fn new(max_history: usize, max_nodes: usize) -> Self {
        Self {
            max_history,
            max_nodes,
            inner: Mutex::new(DetectorInner {
                snapshots: HashMap::new(),
                history: HashMap::new(),
                total_drifts: 0,
            }),
            on_drift: Mutex::new(None),
        }
    }

    pub fn set_on_drift(&self, callback: DriftCallback) {
        *self.on_drift.lock() = Some(callback);
    }

    /// Compare tracked fields against the node's snapshot, record any
    /// changes, and update the snapshot atomically. First observation records
    /// the snapshot and reports nothing.
    pub fn check_node(&self, node_id: &str, fields: &HashMap<String, Value>) -> Vec<Drift> {
        let current: HashMap<String, Value> = fields
            .iter()
            .filter(|(key, value)| field_severity(key).is_some() && !value.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if current.is_empty() {
            return Vec::new();
        }

        let now = now_ts();
        let drifts: Vec<Drift> = {
            let mut inner = self.inner.lock();

            if !inner.snapshots.contains_key(node_id) {
                if inner.snapshots.len() >= self.max_nodes {
                    evict_oldest(&mut inner);
                }
                inner.snapshots.insert(
                    node_id.to_string(),
                    NodeSnapshot {
                        fields: current,
                        last_seen: now,
                    },
                );
                return Vec::new();
            }

            let mut drifts = Vec::new();
            let snapshot = inner.snapshots.get(node_id).expect("checked above");
            for (field, new_value) in &current {
                let Some(old_value) = snapshot.fields.get(field) else {
                    continue;
                };
                if values_equal(old_value, new_value) {
                    continue;
                }
                let severity = field_severity(field).expect("filtered to tracked fields");
                drifts.push(Drift {
                    node_id: node_id.to_string(),
                    field: field.clone(),
                    old_value: old_value.clone(),
                    new_value: new_value.clone(),
                    severity,
                    timestamp: now,
                });
            }

            let snapshot = inner.snapshots.get_mut(node_id).expect("checked above");
            snapshot.fields.extend(current);
            snapshot.last_seen = now;

            if !drifts.is_empty() {
                inner.total_drifts += drifts.len() as u64;
                let history = inner.history.entry(node_id.to_string()).or_default();
                history.extend(drifts.iter().cloned());
                let excess = history.len().saturating_sub(self.max_history);
                if excess > 0 {
                    history.drain(..excess);
                }
                for drift in &drifts {
                    info!(
                        node_id = %drift.node_id,
                        field = %drift.field,
                        severity = drift.severity.as_str(),
                        old = %drift.old_value,
                        new = %drift.new_value,
                        "config drift detected"
                    );
                }
            }
            drifts
        };

        if !drifts.is_empty() {
            if let Some(cb) = self.on_drift.lock().clone() {
                cb(node_id, &drifts);
            }
        }
        drifts
    }

    pub fn node_snapshot(&self, node_id: &str) -> Option<HashMap<String, Value>> {
        self.inner
            .lock()
            .snapshots
            .get(node_id)
            .map(|s| s.fields.clone())
    }

    pub fn node_drift_history(&self, node_id: &str) -> Vec<Drift> {
        self.inner
            .lock()
            .history
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All drifts, newest first, optionally filtered by time and severity.
    pub fn all_drifts(&self, since: Option<f64>, severity: Option<&str>) -> Vec<Drift> {
        let inner = self.inner.lock();
        let mut drifts: Vec<Drift> = inner
            .history
            .values()
            .flatten()
            .filter(|d| since.map_or(true, |s| d.timestamp >= s))
            .filter(|d| severity.map_or(true, |s| d.severity.as_str() == s))
            .cloned()
            .collect();
        drifts.sort_by(|a, b| {
            b.timestamp
                .partial_cmp(&a.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        drifts
    }

    pub fn summary(&self) -> Value {
        let inner = self.inner.lock();
        let nodes_with_drift = inner.history.values().filter(|h| !h.is_empty()).count();
        let mut recent: Vec<&Drift> = inner
            .history
            .values()
            .flat_map(|h| h.iter().rev().take(3))
            .collect();
        recent.sort_by(|a, b| {
            b.timestamp
                .partial_cmp(&a.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        json!({
            "tracked_nodes": inner.snapshots.len(),
            "nodes_with_drift": nodes_with_drift,
            "total_drifts": inner.total_drifts,
            "recent_drifts": recent.into_iter().take(10).collect::<Vec<_>>(),
        })
    }

    pub fn tracked_node_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    pub fn remove_node(&self, node_id: &str) {
        let mut inner = self.inner.lock();
        inner.snapshots.remove(node_id);
        inner.history.remove(node_id);
    }
}

/// Value comparison with numeric coercion (`1 == 1.0`) and trimmed strings.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return (x - y).abs() < f64::EPSILON;
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return x.trim() == y.trim();
    }
    a == b
}

fn evict_oldest(inner: &mut DetectorInner) {
    let oldest = inner
        .snapshots
        .iter()
        .min_by(|(_, a), (_, b)| {
            a.last_seen
                .partial_cmp(&b.last_seen)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        inner.snapshots.remove(&id);
        inner.history.remove(&id);
    }
}
