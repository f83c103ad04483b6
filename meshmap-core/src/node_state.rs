//! Connectivity state machine.
//!
//! Classifies every node as new, stable, intermittent, or offline from
//! heartbeat regularity. A heartbeat is any observation of the node:
//! position, info, or telemetry. Each node keeps a bounded sliding window of
//! heartbeat timestamps; the gap ratio (fraction of intervals exceeding 2×
//! the expected interval) separates stable from intermittent, and a periodic
//! sweep moves silent nodes to offline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::now_ts;

pub const DEFAULT_EXPECTED_INTERVAL: f64 = 300.0;
/// Fifteen minutes of silence means offline.
pub const DEFAULT_OFFLINE_THRESHOLD: f64 = 900.0;
/// Gap-ratio above this is intermittent.
pub const DEFAULT_INTERMITTENT_RATIO: f64 = 0.3;
pub const DEFAULT_HEARTBEAT_WINDOW: usize = 20;
pub const DEFAULT_MAX_NODES: usize = 10_000;

/// Heartbeats needed before a node can leave `New`.
const MIN_CLASSIFY_HEARTBEATS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    New,
    Stable,
    Intermittent,
    Offline,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::New => "new",
            NodeState::Stable => "stable",
            NodeState::Intermittent => "intermittent",
            NodeState::Offline => "offline",
        }
    }
}

struct NodeEntry {
    state: NodeState,
    heartbeats: VecDeque<f64>,
    first_seen: f64,
    last_seen: f64,
    transition_count: u64,
    last_transition: f64,
}

impl NodeEntry {
    fn new(timestamp: f64) -> Self {
        let mut heartbeats = VecDeque::with_capacity(DEFAULT_HEARTBEAT_WINDOW);
        heartbeats.push_back(timestamp);
        Self {
            state: NodeState::New,
            heartbeats,
            first_seen: timestamp,
            last_seen: timestamp,
            transition_count: 0,
            last_transition: timestamp,
        }
    }

    fn add_heartbeat(&mut self, timestamp: f64, window: usize) {
        self.heartbeats.push_back(timestamp);
        while self.heartbeats.len() > window {
            self.heartbeats.pop_front();
        }
        self.last_seen = timestamp;
    }

    fn average_interval(&self) -> Option<f64> {
        if self.heartbeats.len() < 2 {
            return None;
        }
        let intervals = self.heartbeats.len() - 1;
        let span = self.heartbeats.back().unwrap() - self.heartbeats.front().unwrap();
        Some(span / intervals as f64)
    }

    fn gap_ratio(&self, expected_interval: f64) -> f64 {
        if self.heartbeats.len() < 2 {
            return 0.0;
        }
        let gap_threshold = expected_interval * 2.0;
        let mut gaps = 0usize;
        let mut intervals = 0usize;
        let mut previous: Option<f64> = None;
        for &ts in &self.heartbeats {
            if let Some(prev) = previous {
                intervals += 1;
                if ts - prev > gap_threshold {
                    gaps += 1;
                }
            }
            previous = Some(ts);
        }
        gaps as f64 / intervals as f64
    }

    fn info(&self, node_id: &str) -> Value {
        json!({
            "node_id": node_id,
            "state": self.state.as_str(),
            "heartbeat_count": self.heartbeats.len(),
            "first_seen": self.first_seen,
            "last_seen": self.last_seen,
            "average_interval": self.average_interval().map(|v| (v * 10.0).round() / 10.0),
            "transition_count": self.transition_count,
        })
    }
}

pub type TransitionCallback = Arc<dyn Fn(&str, NodeState, NodeState) + Send + Sync>;

pub struct NodeStateTracker {
    expected_interval: f64,
    offline_threshold: f64,
    intermittent_ratio: f64,
    heartbeat_window: usize,
    max_nodes: usize,
    nodes: Mutex<HashMap<String, NodeEntry>>,
    total_transitions: Mutex<u64>,
    on_transition: Mutex<Option<TransitionCallback>>,
}

impl Default for NodeStateTracker {
    fn default() -> Self {
        Self::new(
            DEFAULT_EXPECTED_INTERVAL,
            DEFAULT_OFFLINE_THRESHOLD,
            DEFAULT_INTERMITTENT_RATIO,
            DEFAULT_HEARTBEAT_WINDOW,
            DEFAULT_MAX_NODES,
        )
    }
}

impl NodeStateTracker {
    pub fn new(
        expected_interval: f64,
        offline_threshold: f64,
        intermittent_ratio: f64,
        heartbeat_window: usize,
        max_nodes: usize,
    ) -> Self {
        Self {
            expected_interval,
            offline_threshold,
            intermittent_ratio,
            heartbeat_window,
            max_nodes,
            nodes: Mutex::new(HashMap::new()),
            total_transitions: Mutex::new(0),
            on_transition: Mutex::new(None),
        }
    }

    pub fn set_on_transition(&self, callback: TransitionCallback) {
        *self.on_transition.lock() = Some(callback);
    }

    pub fn offline_threshold(&self) -> f64 {
        self.offline_threshold
    }

    /// Record a heartbeat and reclassify. Returns `(old, new)` states.
    pub fn record_heartbeat(&self, node_id: &str) -> (NodeState, NodeState) {
        self.record_heartbeat_at(node_id, now_ts())
    }

    pub fn record_heartbeat_at(&self, node_id: &str, timestamp: f64) -> (NodeState, NodeState) {
        let transition = {
            let mut nodes = self.nodes.lock();
            if !nodes.contains_key(node_id) {
                if nodes.len() >= self.max_nodes {
                    evict_oldest(&mut nodes);
                }
                nodes.insert(node_id.to_string(), NodeEntry::new(timestamp));
                return (NodeState::New, NodeState::New);
            }

            let entry = nodes.get_mut(node_id).expect("checked above");
            let old_state = entry.state;
            entry.add_heartbeat(timestamp, self.heartbeat_window);
            let new_state = self.classify(entry);

            if new_state != old_state {
                entry.state = new_state;
                entry.transition_count += 1;
                entry.last_transition = timestamp;
                *self.total_transitions.lock() += 1;
                Some((old_state, new_state))
            } else {
                None
            }
        };

        // Callback fires outside the lock.
        match transition {
            Some((old, new)) => {
                if let Some(cb) = self.on_transition.lock().clone() {
                    cb(node_id, old, new);
                }
                (old, new)
            }
            None => {
                let state = self.state_of(node_id).unwrap_or(NodeState::New);
                (state, state)
            }
        }
    }

    /// Sweep every node for offline transitions. Returns transitioned ids.
    pub fn check_offline(&self, now: Option<f64>) -> Vec<String> {
        let now = now.unwrap_or_else(now_ts);
        let transitions: Vec<(String, NodeState)> = {
            let mut nodes = self.nodes.lock();
            let mut transitions = Vec::new();
            for (node_id, entry) in nodes.iter_mut() {
                if entry.state == NodeState::Offline {
                    continue;
                }
                if now - entry.last_seen > self.offline_threshold {
                    let old = entry.state;
                    entry.state = NodeState::Offline;
                    entry.transition_count += 1;
                    entry.last_transition = now;
                    *self.total_transitions.lock() += 1;
                    transitions.push((node_id.clone(), old));
                }
            }
            transitions
        };

        let callback = self.on_transition.lock().clone();
        let mut transitioned = Vec::with_capacity(transitions.len());
        for (node_id, old) in transitions {
            debug!(node_id = %node_id, from = old.as_str(), "node went offline");
            if let Some(ref cb) = callback {
                cb(&node_id, old, NodeState::Offline);
            }
            transitioned.push(node_id);
        }
        transitioned
    }

    pub fn state_of(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.lock().get(node_id).map(|e| e.state)
    }

    pub fn node_info(&self, node_id: &str) -> Option<Value> {
        self.nodes.lock().get(node_id).map(|e| e.info(node_id))
    }

    pub fn all_states(&self) -> HashMap<String, &'static str> {
        self.nodes
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.state.as_str()))
            .collect()
    }

    pub fn summary(&self) -> Value {
        let nodes = self.nodes.lock();
        let mut counts: HashMap<&'static str, usize> = HashMap::from([
            ("new", 0),
            ("stable", 0),
            ("intermittent", 0),
            ("offline", 0),
        ]);
        for entry in nodes.values() {
            *counts.entry(entry.state.as_str()).or_insert(0) += 1;
        }
        json!({
            "tracked_nodes": nodes.len(),
            "states": counts,
            "total_transitions": *self.total_transitions.lock(),
        })
    }

    pub fn tracked_node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.lock().remove(node_id);
    }

    fn classify(&self, entry: &NodeEntry) -> NodeState {
        // A silent node that reports again restarts classification from New.
        if entry.state == NodeState::Offline {
            return NodeState::New;
        }
        if entry.heartbeats.len() < MIN_CLASSIFY_HEARTBEATS {
            return NodeState::New;
        }
        if entry.gap_ratio(self.expected_interval) > self.intermittent_ratio {
            NodeState::Intermittent
        } else {
            NodeState::Stable
        }
    }
}

fn evict_oldest(nodes: &mut HashMap<String, NodeEntry>) {
    let oldest = nodes
        .iter()
        .min_by(|(_, a), (_, b)| {
            a.last_seen
                .partial_cmp(&b.last_seen)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        nodes.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> NodeStateTracker {
        NodeStateTracker::new(300.0, 900.0, 0.3, 20, 100)
    }

    fn beat_regular(tracker: &NodeStateTracker, node: &str, start: f64, count: usize, step: f64) {
        for i in 0..count {
            tracker.record_heartbeat_at(node, start + i as f64 * step);
        }
    }

    #[test]
    fn test_first_heartbeat_is_new() {
        let tracker = tracker();
        let (old, new) = tracker.record_heartbeat_at("!aa", 1000.0);
        assert_eq!((old, new), (NodeState::New, NodeState::New));
        assert_eq!(tracker.state_of("!aa"), Some(NodeState::New));
    }

    #[test]
    fn test_regular_heartbeats_reach_stable() {
        let tracker = tracker();
        beat_regular(&tracker, "!aa", 0.0, 5, 300.0);
        assert_eq!(tracker.state_of("!aa"), Some(NodeState::Stable));
    }

    #[test]
    fn test_gappy_heartbeats_go_intermittent() {
        let tracker = tracker();
        // Alternate normal and 3x-expected gaps: gap ratio 0.5 > 0.3.
        let mut ts = 0.0;
        tracker.record_heartbeat_at("!aa", ts);
        for i in 0..6 {
            ts += if i % 2 == 0 { 300.0 } else { 900.0 };
            tracker.record_heartbeat_at("!aa", ts);
        }
        assert_eq!(tracker.state_of("!aa"), Some(NodeState::Intermittent));
    }

    #[test]
    fn test_intermittent_recovers_to_stable() {
        let tracker = tracker();
        let mut ts = 0.0;
        tracker.record_heartbeat_at("!aa", ts);
        for _ in 0..4 {
            ts += 900.0;
            tracker.record_heartbeat_at("!aa", ts);
        }
        assert_eq!(tracker.state_of("!aa"), Some(NodeState::Intermittent));
        // Sustained steady heartbeats push the gap ratio back down.
        for _ in 0..16 {
            ts += 300.0;
            tracker.record_heartbeat_at("!aa", ts);
        }
        assert_eq!(tracker.state_of("!aa"), Some(NodeState::Stable));
    }

    #[test]
    fn test_offline_sweep_exact_deadline() {
        let tracker = tracker();
        beat_regular(&tracker, "!aa", 0.0, 5, 300.0);
        let last = 4.0 * 300.0;
        // Exactly at the threshold: not offline yet.
        assert!(tracker.check_offline(Some(last + 900.0)).is_empty());
        // Past it: transitions on the next sweep.
        let transitioned = tracker.check_offline(Some(last + 900.1));
        assert_eq!(transitioned, vec!["!aa".to_string()]);
        assert_eq!(tracker.state_of("!aa"), Some(NodeState::Offline));
    }

    #[test]
    fn test_offline_node_restarts_as_new() {
        let tracker = tracker();
        beat_regular(&tracker, "!aa", 0.0, 5, 300.0);
        tracker.check_offline(Some(10_000.0));
        assert_eq!(tracker.state_of("!aa"), Some(NodeState::Offline));

        let (old, new) = tracker.record_heartbeat_at("!aa", 10_100.0);
        assert_eq!(old, NodeState::Offline);
        assert_eq!(new, NodeState::New);
    }

    #[test]
    fn test_transition_callback_outside_lock() {
        let tracker = tracker();
        let seen: Arc<Mutex<Vec<(String, NodeState, NodeState)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        tracker.set_on_transition(Arc::new(move |id, old, new| {
            s.lock().push((id.to_string(), old, new));
        }));

        beat_regular(&tracker, "!aa", 0.0, 5, 300.0);
        let seen = seen.lock();
        assert!(seen
            .iter()
            .any(|(id, old, new)| id == "!aa"
                && *old == NodeState::New
                && *new == NodeState::Stable));
    }

    #[test]
    fn test_summary_counts() {
        let tracker = tracker();
        beat_regular(&tracker, "!aa", 0.0, 5, 300.0);
        tracker.record_heartbeat_at("!bb", 0.0);
        let summary = tracker.summary();
        assert_eq!(summary["tracked_nodes"], 2);
        assert_eq!(summary["states"]["stable"], 1);
        assert_eq!(summary["states"]["new"], 1);
    }

    #[test]
    fn test_remove_node() {
        let tracker = tracker();
        tracker.record_heartbeat_at("!aa", 0.0);
        tracker.remove_node("!aa");
        assert!(tracker.state_of("!aa").is_none());
    }
}
