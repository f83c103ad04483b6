//! Threshold-based alert engine.
//!
//! Evaluates configurable rules against node telemetry and health scores in
//! rule-definition order, with per-(node, rule) cooldowns to suppress alert
//! storms. Fired alerts land in bounded in-memory history and fan out over
//! four channels, each best-effort: the local callback, the delivery channel
//! (webhook + broker publication, drained by the app dispatcher), and an
//! `alert.fired` event on the bus.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event_bus::{Event, EventBus};
use crate::geo::NodeProperties;
use crate::now_ts;

pub const MAX_ALERT_HISTORY: usize = 500;
pub const DEFAULT_COOLDOWN: f64 = 600.0;

/// Cooldown entries older than a day are swept hourly.
const COOLDOWN_MAX_AGE: f64 = 86_400.0;
const COOLDOWN_CLEANUP_INTERVAL: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl Operator {
    fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Lt => value < threshold,
            Operator::Lte => value <= threshold,
            Operator::Gt => value > threshold,
            Operator::Gte => value >= threshold,
            Operator::Eq => value == threshold,
        }
    }
}

/// A threshold rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub network_filter: Option<String>,
    #[serde(default)]
    pub description: String,
}

fn default_cooldown() -> f64 {
    DEFAULT_COOLDOWN
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    fn new(
        rule_id: &str,
        severity: AlertSeverity,
        metric: &str,
        operator: Operator,
        threshold: f64,
        description: &str,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            alert_type: rule_id.to_string(),
            severity,
            metric: metric.to_string(),
            operator,
            threshold,
            cooldown: DEFAULT_COOLDOWN,
            enabled: true,
            network_filter: None,
            description: description.to_string(),
        }
    }
}

/// Built-in rule set.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "battery_low",
            AlertSeverity::Warning,
            "battery",
            Operator::Lte,
            20.0,
            "Battery level is low (<=20%)",
        ),
        AlertRule::new(
            "battery_critical",
            AlertSeverity::Critical,
            "battery",
            Operator::Lte,
            5.0,
            "Battery level is critical (<=5%)",
        ),
        AlertRule::new(
            "signal_poor",
            AlertSeverity::Warning,
            "snr",
            Operator::Lte,
            -10.0,
            "Signal quality is poor (SNR <= -10 dB)",
        ),
        AlertRule::new(
            "congestion_high",
            AlertSeverity::Warning,
            "channel_util",
            Operator::Gte,
            75.0,
            "Channel utilization is high (>=75%)",
        ),
        AlertRule::new(
            "health_degraded",
            AlertSeverity::Warning,
            "health_score",
            Operator::Lte,
            20.0,
            "Node health score is critical (<=20)",
        ),
    ]
}

/// A fired alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub rule_id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub node_id: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub timestamp: f64,
    pub acknowledged: bool,
}

pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

struct EngineInner {
    rules: Vec<AlertRule>,
    history: Vec<Alert>,
    cooldowns: HashMap<String, f64>,
    alert_counter: u64,
    total_alerts_fired: u64,
    last_cooldown_cleanup: f64,
}

pub struct AlertEngine {
    max_history: usize,
    inner: Mutex<EngineInner>,
    callback: Mutex<Option<AlertCallback>>,
    delivery: Mutex<Option<mpsc::UnboundedSender<Alert>>>,
    bus: Mutex<Option<Arc<EventBus>>>,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(default_rules(), MAX_ALERT_HISTORY)
    }
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, max_history: usize) -> Self {
        Self {
            max_history,
            inner: Mutex::new(EngineInner {
                rules,
                history: Vec::new(),
                cooldowns: HashMap::new(),
                alert_counter: 0,
                total_alerts_fired: 0,
                last_cooldown_cleanup: 0.0,
            }),
            callback: Mutex::new(None),
            delivery: Mutex::new(None),
            bus: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: AlertCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Delivery channel drained by the external dispatcher (webhook + broker
    /// publication).
    pub fn set_delivery_channel(&self, sender: mpsc::UnboundedSender<Alert>) {
        *self.delivery.lock() = Some(sender);
    }

    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        *self.bus.lock() = Some(bus);
    }

    // ── Rule management ──────────────────────────────────────────────────

    pub fn add_rule(&self, rule: AlertRule) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
            *existing = rule;
        } else {
            inner.rules.push(rule);
        }
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.rules.len();
        inner.rules.retain(|r| r.rule_id != rule_id);
        inner.rules.len() < before
    }

    pub fn list_rules(&self) -> Vec<AlertRule> {
        self.inner.lock().rules.clone()
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.rules.iter_mut().find(|r| r.rule_id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    // ── Evaluation ───────────────────────────────────────────────────────

    /// Evaluate every enabled rule against a node, in definition order.
    pub fn evaluate_node(
        &self,
        node_id: &str,
        props: &NodeProperties,
        health_score: Option<f64>,
        now: Option<f64>,
    ) -> Vec<Alert> {
        let now = now.unwrap_or_else(now_ts);
        self.maybe_cleanup_cooldowns(now);

        let rules = self.inner.lock().rules.clone();
        let network = props.network.as_deref();
        let mut fired = Vec::new();

        for rule in rules {
            if !rule.enabled {
                continue;
            }
            if let Some(ref filter) = rule.network_filter {
                if network != Some(filter.as_str()) {
                    continue;
                }
            }
            let value = if rule.metric == "health_score" {
                health_score
            } else {
                props.metric(&rule.metric)
            };
            let Some(value) = value else {
                continue;
            };
            if !rule.operator.evaluate(value, rule.threshold) {
                continue;
            }

            let alert = {
                let mut inner = self.inner.lock();
                let cooldown_key = format!("{node_id}:{}", rule.rule_id);
                let last_fired = inner.cooldowns.get(&cooldown_key).copied().unwrap_or(0.0);
                if now - last_fired < rule.cooldown {
                    continue;
                }

                inner.alert_counter += 1;
                let alert = Alert {
                    alert_id: format!("alert-{}", inner.alert_counter),
                    rule_id: rule.rule_id.clone(),
                    alert_type: rule.alert_type.clone(),
                    severity: rule.severity,
                    node_id: node_id.to_string(),
                    metric: rule.metric.clone(),
                    value,
                    threshold: rule.threshold,
                    message: format!(
                        "{} — node {node_id}: {}={value}",
                        rule.description, rule.metric
                    ),
                    timestamp: now,
                    acknowledged: false,
                };
                inner.cooldowns.insert(cooldown_key, now);
                push_history(&mut inner, alert.clone(), self.max_history);
                alert
            };

            self.deliver(&alert);
            fired.push(alert);
        }

        fired
    }

    /// Absence-based offline alert; separate from `evaluate_node` because it
    /// fires on what the node did NOT send.
    pub fn evaluate_offline(
        &self,
        node_id: &str,
        last_seen: f64,
        offline_threshold: f64,
        now: Option<f64>,
    ) -> Option<Alert> {
        let now = now.unwrap_or_else(now_ts);
        let age = now - last_seen;
        if age <= offline_threshold {
            return None;
        }

        let alert = {
            let mut inner = self.inner.lock();
            let cooldown_key = format!("{node_id}:node_offline");
            let last_fired = inner.cooldowns.get(&cooldown_key).copied().unwrap_or(0.0);
            if now - last_fired < DEFAULT_COOLDOWN {
                return None;
            }

            inner.alert_counter += 1;
            let alert = Alert {
                alert_id: format!("alert-{}", inner.alert_counter),
                rule_id: "node_offline".into(),
                alert_type: "node_offline".into(),
                severity: AlertSeverity::Critical,
                node_id: node_id.to_string(),
                metric: "seconds_since_seen".into(),
                value: age,
                threshold: offline_threshold,
                message: format!("Node {node_id} offline — last seen {}s ago", age as u64),
                timestamp: now,
                acknowledged: false,
            };
            inner.cooldowns.insert(cooldown_key, now);
            push_history(&mut inner, alert.clone(), self.max_history);
            alert
        };

        self.deliver(&alert);
        Some(alert)
    }

    /// Fan the alert out; a failing channel never blocks the others.
    fn deliver(&self, alert: &Alert) {
        if let Some(cb) = self.callback.lock().clone() {
            cb(alert);
        }
        if let Some(sender) = self.delivery.lock().clone() {
            if sender.send(alert.clone()).is_err() {
                warn!(alert_id = %alert.alert_id, "alert delivery channel closed");
            }
        }
        if let Some(bus) = self.bus.lock().clone() {
            if let Ok(Value::Object(data)) = serde_json::to_value(alert) {
                bus.publish(&Event::alert_fired(data));
            }
        }
    }

    // ── History and acknowledgement ──────────────────────────────────────

    /// Acknowledge by id; idempotent. Returns false for unknown ids.
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.history.iter_mut().find(|a| a.alert_id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let inner = self.inner.lock();
        inner
            .history
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    /// Recent history, newest first, with optional filters.
    pub fn alert_history(
        &self,
        limit: usize,
        severity: Option<&str>,
        node_id: Option<&str>,
    ) -> Vec<Alert> {
        let inner = self.inner.lock();
        inner
            .history
            .iter()
            .rev()
            .filter(|a| severity.map_or(true, |s| a.severity.as_str() == s))
            .filter(|a| node_id.map_or(true, |n| a.node_id == n))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> Value {
        let inner = self.inner.lock();
        let mut by_severity: HashMap<&'static str, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut active = 0usize;
        for alert in &inner.history {
            if !alert.acknowledged {
                active += 1;
                *by_severity.entry(alert.severity.as_str()).or_insert(0) += 1;
                *by_type.entry(alert.alert_type.clone()).or_insert(0) += 1;
            }
        }
        json!({
            "total_rules": inner.rules.len(),
            "enabled_rules": inner.rules.iter().filter(|r| r.enabled).count(),
            "total_alerts_fired": inner.total_alerts_fired,
            "active_alerts": active,
            "history_size": inner.history.len(),
            "by_severity": by_severity,
            "by_type": by_type,
        })
    }

    pub fn clear_cooldowns(&self) {
        self.inner.lock().cooldowns.clear();
    }

    fn maybe_cleanup_cooldowns(&self, now: f64) {
        let mut inner = self.inner.lock();
        if now - inner.last_cooldown_cleanup <= COOLDOWN_CLEANUP_INTERVAL {
            return;
        }
        let before = inner.cooldowns.len();
        inner.cooldowns.retain(|_, fired| now - *fired <= COOLDOWN_MAX_AGE);
        let removed = before - inner.cooldowns.len();
        if removed > 0 {
            debug!(removed, "swept stale alert cooldowns");
        }
        inner.last_cooldown_cleanup = now;
    }
}

fn push_history(inner: &mut EngineInner, alert: Alert, max_history: usize) {
    inner.history.push(alert);
    inner.total_alerts_fired += 1;
    let excess = inner.history.len().saturating_sub(max_history);
    if excess > 0 {
        inner.history.drain(..excess);
    }
}
