//! Historical analytics.
//!
//! Read-only aggregation queries over the node-history database plus the
//! in-memory alert history. Everything returns plain JSON ready for the API.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::alerts::AlertEngine;
use crate::history::NodeHistoryDb;
use crate::now_epoch;

pub const DEFAULT_BUCKET_SECONDS: i64 = 3600;

/// Upper bound on buckets per response.
const MAX_BUCKETS: usize = 720;

pub struct HistoricalAnalytics {
    history: Option<Arc<NodeHistoryDb>>,
    alerts: Option<Arc<AlertEngine>>,
}

impl HistoricalAnalytics {
    pub fn new(history: Option<Arc<NodeHistoryDb>>, alerts: Option<Arc<AlertEngine>>) -> Self {
        Self { history, alerts }
    }

    /// Unique node count per time bucket.
    pub fn network_growth(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        bucket_seconds: i64,
    ) -> Value {
        let Some(ref history) = self.history else {
            return json!({"buckets": [], "error": "Node history not available"});
        };
        let until = until.unwrap_or_else(now_epoch);
        let since = since.unwrap_or(until - 24 * 3600);
        let bucket_seconds = bucket_seconds.clamp(60, 86_400);

        let rows = history
            .execute_read(
                "SELECT (timestamp / ?1) * ?1 AS bucket_start,
                        COUNT(DISTINCT node_id) AS unique_nodes,
                        COUNT(*) AS total_observations
                 FROM observations
                 WHERE timestamp >= ?2 AND timestamp <= ?3
                 GROUP BY bucket_start
                 ORDER BY bucket_start ASC",
                &[&bucket_seconds, &since, &until],
            )
            .unwrap_or_default();

        let buckets: Vec<Value> = rows
            .iter()
            .take(MAX_BUCKETS)
            .map(|row| {
                json!({
                    "timestamp": row[0],
                    "unique_nodes": row[1],
                    "observations": row[2],
                })
            })
            .collect();

        json!({
            "buckets": buckets,
            "bucket_seconds": bucket_seconds,
            "since": since,
            "until": until,
            "total_buckets": buckets.len(),
        })
    }

    /// Observation counts by hour of day (0-23).
    pub fn activity_heatmap(&self, since: Option<i64>, until: Option<i64>) -> Value {
        let Some(ref history) = self.history else {
            return json!({"hours": vec![0; 24], "error": "Node history not available"});
        };
        let until = until.unwrap_or_else(now_epoch);
        let since = since.unwrap_or(until - 7 * 24 * 3600);

        let rows = history
            .execute_read(
                "SELECT CAST(strftime('%H', timestamp, 'unixepoch') AS INTEGER) AS hour,
                        COUNT(*) AS obs_count
                 FROM observations
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                 GROUP BY hour ORDER BY hour ASC",
                &[&since, &until],
            )
            .unwrap_or_default();

        let mut hours = [0i64; 24];
        for row in rows {
            if let (Some(hour), Some(count)) = (row[0].as_i64(), row[1].as_i64()) {
                if (0..24).contains(&hour) {
                    hours[hour as usize] = count;
                }
            }
        }
        let total: i64 = hours.iter().sum();
        let peak_hour = (total > 0).then(|| {
            hours
                .iter()
                .enumerate()
                .max_by_key(|(_, &count)| count)
                .map(|(hour, _)| hour)
        });

        json!({
            "hours": hours.to_vec(),
            "since": since,
            "until": until,
            "peak_hour": peak_hour.flatten(),
            "total_observations": total,
        })
    }

    /// Nodes ranked by observation count within the window.
    pub fn node_activity_ranking(&self, since: Option<i64>, limit: u32) -> Value {
        let Some(ref history) = self.history else {
            return json!({"nodes": [], "error": "Node history not available"});
        };
        let since = since.unwrap_or_else(|| now_epoch() - 24 * 3600);

        let rows = history
            .execute_read(
                "SELECT node_id, COUNT(*) AS observation_count,
                        MIN(timestamp), MAX(timestamp), network
                 FROM observations
                 WHERE timestamp >= ?1
                 GROUP BY node_id
                 ORDER BY observation_count DESC
                 LIMIT ?2",
                &[&since, &limit],
            )
            .unwrap_or_default();

        let nodes: Vec<Value> = rows
            .iter()
            .map(|row| {
                let first = row[2].as_i64().unwrap_or(0);
                let last = row[3].as_i64().unwrap_or(0);
                json!({
                    "node_id": row[0],
                    "observation_count": row[1],
                    "first_seen": first,
                    "last_seen": last,
                    "network": row[4],
                    "active_seconds": (last - first).max(0),
                })
            })
            .collect();

        json!({
            "nodes": nodes,
            "since": since,
            "count": nodes.len(),
        })
    }

    /// High-level statistics over a window, with per-network breakdowns.
    pub fn network_summary(&self, since: Option<i64>) -> Value {
        let Some(ref history) = self.history else {
            return json!({"error": "Node history not available"});
        };
        let now = now_epoch();
        let since = since.unwrap_or(now - 24 * 3600);

        let totals = history
            .execute_read(
                "SELECT COUNT(DISTINCT node_id), COUNT(*)
                 FROM observations WHERE timestamp >= ?1",
                &[&since],
            )
            .unwrap_or_default();
        let (unique_nodes, total_obs) = totals
            .first()
            .map(|row| (row[0].as_i64().unwrap_or(0), row[1].as_i64().unwrap_or(0)))
            .unwrap_or((0, 0));

        let network_rows = history
            .execute_read(
                "SELECT COALESCE(network, 'unknown') AS net,
                        COUNT(DISTINCT node_id), COUNT(*)
                 FROM observations WHERE timestamp >= ?1
                 GROUP BY net ORDER BY COUNT(DISTINCT node_id) DESC",
                &[&since],
            )
            .unwrap_or_default();
        let networks: serde_json::Map<String, Value> = network_rows
            .iter()
            .filter_map(|row| {
                Some((
                    row[0].as_str()?.to_string(),
                    json!({
                        "node_count": row[1],
                        "observation_count": row[2],
                    }),
                ))
            })
            .collect();

        json!({
            "unique_nodes": unique_nodes,
            "total_observations": total_obs,
            "avg_observations_per_node": if unique_nodes > 0 {
                ((total_obs as f64 / unique_nodes as f64) * 10.0).round() / 10.0
            } else {
                0.0
            },
            "networks": networks,
            "since": since,
            "until": now,
        })
    }

    /// Alert history grouped into time buckets by severity.
    pub fn alert_trends(&self, bucket_seconds: i64, limit: usize) -> Value {
        let Some(ref alerts) = self.alerts else {
            return json!({"buckets": [], "error": "Alert engine not available"});
        };
        let bucket_seconds = bucket_seconds.clamp(60, 86_400);
        let history = alerts.alert_history(crate::alerts::MAX_ALERT_HISTORY, None, None);
        if history.is_empty() {
            return json!({"buckets": [], "total_alerts": 0});
        }

        let mut bucket_map: BTreeMap<i64, (usize, usize, usize, usize)> = BTreeMap::new();
        for alert in &history {
            let key = (alert.timestamp as i64 / bucket_seconds) * bucket_seconds;
            let entry = bucket_map.entry(key).or_insert((0, 0, 0, 0));
            match alert.severity.as_str() {
                "critical" => entry.0 += 1,
                "warning" => entry.1 += 1,
                _ => entry.2 += 1,
            }
            entry.3 += 1;
        }

        let buckets: Vec<Value> = bucket_map
            .iter()
            .rev()
            .take(limit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|(ts, (critical, warning, info, total))| {
                json!({
                    "timestamp": ts,
                    "critical": critical,
                    "warning": warning,
                    "info": info,
                    "total": total,
                })
            })
            .collect();

        json!({
            "buckets": buckets,
            "bucket_seconds": bucket_seconds,
            "total_alerts": history.len(),
            "total_buckets": buckets.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::default_rules;
    use crate::geo::NodeProperties;

    fn with_history() -> (tempfile::TempDir, HistoricalAnalytics, Arc<NodeHistoryDb>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            NodeHistoryDb::open(&dir.path().join("history.db"), 0, 30 * 24 * 3600).unwrap(),
        );
        let analytics = HistoricalAnalytics::new(Some(db.clone()), None);
        (dir, analytics, db)
    }

    fn seed(db: &NodeHistoryDb, node: &str, ts: i64, network: &str) {
        db.record_observation(node, 40.0, -105.0, None, network, None, None, "", Some(ts))
            .unwrap();
    }

    #[test]
    fn test_network_growth_buckets() {
        let (_dir, analytics, db) = with_history();
        seed(&db, "!a", 3600, "meshtastic");
        seed(&db, "!b", 3700, "meshtastic");
        seed(&db, "!a", 7300, "meshtastic");

        let growth = analytics.network_growth(Some(0), Some(10_000), 3600);
        let buckets = growth["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["unique_nodes"], 2);
        assert_eq!(buckets[1]["unique_nodes"], 1);
    }

    #[test]
    fn test_bucket_width_clamped() {
        let (_dir, analytics, _db) = with_history();
        let growth = analytics.network_growth(Some(0), Some(100), 5);
        assert_eq!(growth["bucket_seconds"], 60);
    }

    #[test]
    fn test_activity_heatmap() {
        let (_dir, analytics, db) = with_history();
        // 02:00 and 02:30 UTC on day one, 02:10 on day two.
        seed(&db, "!a", 2 * 3600, "meshtastic");
        seed(&db, "!a", 2 * 3600 + 1800, "meshtastic");
        seed(&db, "!a", 26 * 3600 + 600, "meshtastic");

        let heatmap = analytics.activity_heatmap(Some(0), Some(30 * 3600));
        assert_eq!(heatmap["hours"][2], 3);
        assert_eq!(heatmap["peak_hour"], 2);
        assert_eq!(heatmap["total_observations"], 3);
    }

    #[test]
    fn test_ranking_and_summary() {
        let (_dir, analytics, db) = with_history();
        for i in 0..5 {
            seed(&db, "!busy", 1000 + i, "meshtastic");
        }
        seed(&db, "!quiet", 1000, "aredn");

        let ranking = analytics.node_activity_ranking(Some(0), 10);
        let nodes = ranking["nodes"].as_array().unwrap();
        assert_eq!(nodes[0]["node_id"], "!busy");
        assert_eq!(nodes[0]["observation_count"], 5);

        let summary = analytics.network_summary(Some(0));
        assert_eq!(summary["unique_nodes"], 2);
        assert_eq!(summary["total_observations"], 6);
        assert_eq!(summary["networks"]["meshtastic"]["node_count"], 1);
        assert_eq!(summary["networks"]["aredn"]["observation_count"], 1);
    }

    #[test]
    fn test_alert_trends() {
        let engine = Arc::new(AlertEngine::new(default_rules(), 500));
        let mut props = NodeProperties::new("!aa");
        props.battery = Some(3.0);
        engine.evaluate_node("!aa", &props, None, Some(1000.0));
        engine.evaluate_node("!bb", &props, None, Some(4800.0));

        let analytics = HistoricalAnalytics::new(None, Some(engine));
        let trends = analytics.alert_trends(3600, 100);
        let buckets = trends["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(trends["total_alerts"], 4);
        // battery_low is a warning, battery_critical is critical.
        assert_eq!(buckets[0]["critical"], 1);
        assert_eq!(buckets[0]["warning"], 1);
    }

    #[test]
    fn test_unavailable_history() {
        let analytics = HistoricalAnalytics::new(None, None);
        assert!(analytics.network_growth(None, None, 3600)["error"].is_string());
        assert!(analytics.alert_trends(3600, 10)["error"].is_string());
    }
}
