//! Per-node composite health scoring.
//!
//! Five weighted components (battery, signal, freshness, reliability,
//! congestion) each contribute points when their inputs are present. The
//! final score normalizes against the weight of available components only:
//! a node reporting just battery and freshness is scored out of 45 and
//! rescaled to 0–100. Nodes with no scoreable inputs get no score at all.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::geo::NodeProperties;
use crate::node_state::NodeState;
use crate::now_ts;

pub const WEIGHT_BATTERY: f64 = 25.0;
pub const WEIGHT_SIGNAL: f64 = 25.0;
pub const WEIGHT_FRESHNESS: f64 = 20.0;
pub const WEIGHT_RELIABILITY: f64 = 15.0;
pub const WEIGHT_CONGESTION: f64 = 15.0;

const BATTERY_FULL: f64 = 80.0;
const BATTERY_LOW: f64 = 20.0;
const VOLTAGE_MIN: f64 = 3.0;
const VOLTAGE_HEALTHY: f64 = 3.7;
const SNR_BEST: f64 = 8.0;
const SNR_WORST: f64 = -10.0;
const MAX_HOPS_SCORED: f64 = 7.0;
const FRESH_SECONDS: f64 = 300.0;
const STALE_SECONDS: f64 = 3600.0;
const CHANNEL_UTIL_LOW: f64 = 25.0;
const CHANNEL_UTIL_HIGH: f64 = 75.0;

pub const DEFAULT_MAX_SCORED_NODES: usize = 10_000;

/// A computed score for one node.
#[derive(Debug, Clone)]
pub struct NodeHealthScore {
    pub node_id: String,
    pub score: u8,
    pub status: &'static str,
    pub components: serde_json::Map<String, Value>,
    pub available_weight: f64,
    pub computed_at: f64,
}

impl NodeHealthScore {
    pub fn to_json(&self) -> Value {
        json!({
            "node_id": self.node_id,
            "score": self.score,
            "status": self.status,
            "components": self.components,
            "available_weight": self.available_weight,
            "timestamp": self.computed_at,
        })
    }
}

fn status_label(score: u8) -> &'static str {
    match score {
        80..=100 => "excellent",
        60..=79 => "good",
        40..=59 => "fair",
        20..=39 => "poor",
        _ => "critical",
    }
}

fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

/// Linear interpolation between `bad` (0 points) and `good` (`max` points).
fn linear_score(value: f64, bad: f64, good: f64, max_points: f64) -> f64 {
    if (good - bad).abs() < f64::EPSILON {
        return if value >= good { max_points } else { 0.0 };
    }
    clamp((value - bad) / (good - bad), 0.0, 1.0) * max_points
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub struct NodeHealthScorer {
    max_nodes: usize,
    scores: Mutex<HashMap<String, NodeHealthScore>>,
}

impl Default for NodeHealthScorer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCORED_NODES)
    }
}

impl NodeHealthScorer {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            scores: Mutex::new(HashMap::new()),
        }
    }

    /// Score a node from its feature properties and connectivity state.
    /// Returns `None` when no component had any input.
    pub fn score_node(
        &self,
        node_id: &str,
        props: &NodeProperties,
        connectivity: Option<NodeState>,
        now: Option<f64>,
    ) -> Option<NodeHealthScore> {
        let now = now.unwrap_or_else(now_ts);
        let mut components = serde_json::Map::new();
        let mut earned = 0.0;
        let mut available = 0.0;

        let mut take = |name: &str, result: Option<(f64, Value)>, weight: f64| {
            if let Some((points, mut detail)) = result {
                if let Some(obj) = detail.as_object_mut() {
                    obj.insert("score".into(), json!(round1(points)));
                    obj.insert("max".into(), json!(weight));
                }
                components.insert(name.to_string(), detail);
                earned += points;
                available += weight;
            }
        };

        take("battery", score_battery(props), WEIGHT_BATTERY);
        take("signal", score_signal(props), WEIGHT_SIGNAL);
        take("freshness", score_freshness(props, now), WEIGHT_FRESHNESS);
        take("reliability", score_reliability(connectivity), WEIGHT_RELIABILITY);
        take("congestion", score_congestion(props), WEIGHT_CONGESTION);

        if available <= 0.0 {
            return None;
        }

        let score = clamp((earned / available * 100.0).round(), 0.0, 100.0) as u8;
        let result = NodeHealthScore {
            node_id: node_id.to_string(),
            score,
            status: status_label(score),
            components,
            available_weight: available,
            computed_at: now,
        };

        let mut scores = self.scores.lock();
        if scores.len() >= self.max_nodes && !scores.contains_key(node_id) {
            evict_oldest(&mut scores);
        }
        scores.insert(node_id.to_string(), result.clone());
        Some(result)
    }

    pub fn cached_score(&self, node_id: &str) -> Option<Value> {
        self.scores.lock().get(node_id).map(|s| s.to_json())
    }

    pub fn all_scores(&self) -> Vec<Value> {
        self.scores
            .lock()
            .values()
            .map(|s| {
                json!({
                    "node_id": s.node_id,
                    "score": s.score,
                    "status": s.status,
                })
            })
            .collect()
    }

    pub fn summary(&self) -> Value {
        let scores = self.scores.lock();
        if scores.is_empty() {
            return json!({
                "scored_nodes": 0,
                "average_score": 0,
                "status_counts": {},
                "component_averages": {},
            });
        }

        let values: Vec<u8> = scores.values().map(|s| s.score).collect();
        let average = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;

        let mut status_counts: HashMap<&'static str, usize> = HashMap::new();
        let mut component_totals: HashMap<String, (f64, usize)> = HashMap::new();
        for score in scores.values() {
            *status_counts.entry(score.status).or_insert(0) += 1;
            for (name, detail) in &score.components {
                if let Some(points) = detail.get("score").and_then(Value::as_f64) {
                    let entry = component_totals.entry(name.clone()).or_insert((0.0, 0));
                    entry.0 += points;
                    entry.1 += 1;
                }
            }
        }
        let component_averages: serde_json::Map<String, Value> = component_totals
            .into_iter()
            .map(|(name, (total, count))| (name, json!(round1(total / count as f64))))
            .collect();

        json!({
            "scored_nodes": scores.len(),
            "average_score": round1(average),
            "min_score": values.iter().min(),
            "max_score": values.iter().max(),
            "status_counts": status_counts,
            "component_averages": component_averages,
        })
    }

    pub fn scored_node_count(&self) -> usize {
        self.scores.lock().len()
    }

    /// Eviction hook, mirrored from the node store's removal callback.
    pub fn remove_node(&self, node_id: &str) {
        self.scores.lock().remove(node_id);
    }
}

fn evict_oldest(scores: &mut HashMap<String, NodeHealthScore>) {
    let oldest = scores
        .iter()
        .min_by(|(_, a), (_, b)| {
            a.computed_at
                .partial_cmp(&b.computed_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        scores.remove(&id);
    }
}

// ── Component scorers ────────────────────────────────────────────────────────

fn score_battery(props: &NodeProperties) -> Option<(f64, Value)> {
    let battery = props.battery.map(|v| clamp(v, 0.0, 100.0));
    let voltage = props.voltage;
    match (battery, voltage) {
        (Some(b), Some(v)) => {
            // Both present: equal halves.
            let points = linear_score(b, BATTERY_LOW, BATTERY_FULL, WEIGHT_BATTERY * 0.5)
                + linear_score(v, VOLTAGE_MIN, VOLTAGE_HEALTHY, WEIGHT_BATTERY * 0.5);
            Some((points, json!({"battery_level": b, "voltage": v})))
        }
        (Some(b), None) => Some((
            linear_score(b, BATTERY_LOW, BATTERY_FULL, WEIGHT_BATTERY),
            json!({"battery_level": b}),
        )),
        (None, Some(v)) => Some((
            linear_score(v, VOLTAGE_MIN, VOLTAGE_HEALTHY, WEIGHT_BATTERY),
            json!({"voltage": v}),
        )),
        (None, None) => None,
    }
}

fn score_signal(props: &NodeProperties) -> Option<(f64, Value)> {
    let snr = props.snr;
    let hops = props.hops_away.map(|h| h as f64);
    match (snr, hops) {
        (Some(s), Some(h)) => {
            let points = linear_score(s, SNR_WORST, SNR_BEST, WEIGHT_SIGNAL * 0.7)
                + linear_score(MAX_HOPS_SCORED - h, 0.0, MAX_HOPS_SCORED, WEIGHT_SIGNAL * 0.3);
            Some((points, json!({"snr": s, "hops_away": h})))
        }
        (Some(s), None) => Some((
            linear_score(s, SNR_WORST, SNR_BEST, WEIGHT_SIGNAL),
            json!({"snr": s}),
        )),
        (None, Some(h)) => Some((
            linear_score(MAX_HOPS_SCORED - h, 0.0, MAX_HOPS_SCORED, WEIGHT_SIGNAL),
            json!({"hops_away": h}),
        )),
        (None, None) => None,
    }
}

fn score_freshness(props: &NodeProperties, now: f64) -> Option<(f64, Value)> {
    let last_seen = props.last_seen? as f64;
    let age = (now - last_seen).max(0.0); // clock-skew guard
    let points = linear_score(
        STALE_SECONDS - age,
        0.0,
        STALE_SECONDS - FRESH_SECONDS,
        WEIGHT_FRESHNESS,
    );
    Some((points, json!({"age_seconds": age as u64})))
}

fn score_reliability(connectivity: Option<NodeState>) -> Option<(f64, Value)> {
    let state = connectivity?;
    let points = match state {
        NodeState::Stable => WEIGHT_RELIABILITY,
        NodeState::New => WEIGHT_RELIABILITY * 0.7,
        NodeState::Intermittent => WEIGHT_RELIABILITY * 0.3,
        NodeState::Offline => 0.0,
    };
    Some((points, json!({"connectivity_state": state.as_str()})))
}

fn score_congestion(props: &NodeProperties) -> Option<(f64, Value)> {
    let channel = props.channel_util.map(|v| clamp(v, 0.0, 100.0));
    let air = props.air_util_tx.map(|v| clamp(v, 0.0, 100.0));
    let span = CHANNEL_UTIL_HIGH - CHANNEL_UTIL_LOW;
    match (channel, air) {
        (Some(c), Some(a)) => {
            let avg = (c + a) / 2.0;
            let points = linear_score(CHANNEL_UTIL_HIGH - avg, 0.0, span, WEIGHT_CONGESTION);
            Some((points, json!({"channel_util": c, "air_util_tx": a})))
        }
        (Some(c), None) => Some((
            linear_score(CHANNEL_UTIL_HIGH - c, 0.0, span, WEIGHT_CONGESTION),
            json!({"channel_util": c}),
        )),
        (None, Some(a)) => Some((
            linear_score(CHANNEL_UTIL_HIGH - a, 0.0, span, WEIGHT_CONGESTION),
            json!({"air_util_tx": a}),
        )),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(build: impl FnOnce(&mut NodeProperties)) -> NodeProperties {
        let mut props = NodeProperties::new("!aa");
        build(&mut props);
        props
    }

    #[test]
    fn test_sparse_inputs_normalize_to_full_scale() {
        let scorer = NodeHealthScorer::default();
        let now = 10_000.0;
        let p = props(|p| {
            p.battery = Some(100.0);
            p.last_seen = Some(now as i64);
        });
        // battery 25/25 + freshness 20/20, available 45 -> 100.
        let score = scorer.score_node("!aa", &p, None, Some(now)).unwrap();
        assert_eq!(score.score, 100);
        assert_eq!(score.status, "excellent");
        assert_eq!(score.available_weight, 45.0);
        assert_eq!(score.components.len(), 2);
    }

    #[test]
    fn test_no_inputs_no_score() {
        let scorer = NodeHealthScorer::default();
        let p = props(|_| {});
        assert!(scorer.score_node("!aa", &p, None, None).is_none());
        assert!(scorer.cached_score("!aa").is_none());
    }

    #[test]
    fn test_score_bounds() {
        let scorer = NodeHealthScorer::default();
        let now = 10_000.0;
        let worst = props(|p| {
            p.battery = Some(0.0);
            p.voltage = Some(2.5);
            p.snr = Some(-30.0);
            p.hops_away = Some(7);
            p.last_seen = Some(0);
            p.channel_util = Some(100.0);
            p.air_util_tx = Some(100.0);
        });
        let score = scorer
            .score_node("!worst", &worst, Some(NodeState::Offline), Some(now))
            .unwrap();
        assert_eq!(score.score, 0);
        assert_eq!(score.status, "critical");

        let best = props(|p| {
            p.battery = Some(95.0);
            p.voltage = Some(4.1);
            p.snr = Some(10.0);
            p.hops_away = Some(0);
            p.last_seen = Some(now as i64);
            p.channel_util = Some(5.0);
            p.air_util_tx = Some(5.0);
        });
        let score = scorer
            .score_node("!best", &best, Some(NodeState::Stable), Some(now))
            .unwrap();
        assert_eq!(score.score, 100);
    }

    #[test]
    fn test_battery_midpoint_with_voltage() {
        // battery 50% -> 0.5 of its half; voltage 3.35 -> 0.5 of its half.
        let scorer = NodeHealthScorer::default();
        let p = props(|p| {
            p.battery = Some(50.0);
            p.voltage = Some(3.35);
        });
        let score = scorer.score_node("!aa", &p, None, Some(0.0)).unwrap();
        // 12.5 of 25 available -> 50.
        assert_eq!(score.score, 50);
        assert_eq!(score.status, "fair");
    }

    #[test]
    fn test_reliability_tiers() {
        assert_eq!(score_reliability(Some(NodeState::Stable)).unwrap().0, 15.0);
        assert_eq!(score_reliability(Some(NodeState::New)).unwrap().0, 10.5);
        assert_eq!(
            score_reliability(Some(NodeState::Intermittent)).unwrap().0,
            4.5
        );
        assert_eq!(score_reliability(Some(NodeState::Offline)).unwrap().0, 0.0);
        assert!(score_reliability(None).is_none());
    }

    #[test]
    fn test_freshness_decay() {
        let now = 10_000.0;
        let fresh = props(|p| p.last_seen = Some((now - 200.0) as i64));
        assert_eq!(score_freshness(&fresh, now).unwrap().0, WEIGHT_FRESHNESS);

        let stale = props(|p| p.last_seen = Some((now - 4000.0) as i64));
        assert_eq!(score_freshness(&stale, now).unwrap().0, 0.0);

        let half = props(|p| p.last_seen = Some((now - 1950.0) as i64));
        let (points, _) = score_freshness(&half, now).unwrap();
        assert!((points - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_lru_eviction_bounds_cache() {
        let scorer = NodeHealthScorer::new(2);
        let p = props(|p| p.battery = Some(50.0));
        scorer.score_node("!01", &p, None, Some(100.0));
        scorer.score_node("!02", &p, None, Some(200.0));
        scorer.score_node("!03", &p, None, Some(300.0));
        assert_eq!(scorer.scored_node_count(), 2);
        assert!(scorer.cached_score("!01").is_none());
        assert!(scorer.cached_score("!03").is_some());
    }

    #[test]
    fn test_summary_shape() {
        let scorer = NodeHealthScorer::default();
        let good = props(|p| p.battery = Some(90.0));
        let bad = props(|p| p.battery = Some(5.0));
        scorer.score_node("!good", &good, None, Some(0.0));
        scorer.score_node("!bad", &bad, None, Some(0.0));

        let summary = scorer.summary();
        assert_eq!(summary["scored_nodes"], 2);
        assert_eq!(summary["status_counts"]["excellent"], 1);
        assert_eq!(summary["status_counts"]["critical"], 1);
        assert!(summary["component_averages"]["battery"].is_number());
    }

    #[test]
    fn test_remove_node_clears_cache() {
        let scorer = NodeHealthScorer::default();
        let p = props(|p| p.battery = Some(50.0));
        scorer.score_node("!aa", &p, None, None);
        scorer.remove_node("!aa");
        assert!(scorer.cached_score("!aa").is_none());
    }
}
