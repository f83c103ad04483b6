//! Meshtastic collector.
//!
//! Priority order: the live broker store first; when the store is empty, the
//! local node daemon's HTTP API. The daemon accepts a single TCP client at a
//! time, so the HTTP call runs under the process-wide per-host lease with a
//! request deadline one second inside the lease timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::collect::{Collector, FetchError};
use crate::geo::{Feature, FeatureCollection, NodeProperties};
use crate::lease::LeaseManager;
use crate::now_ts;
use crate::store::NodeStore;

const NODES_ENDPOINT: &str = "/api/v1/nodes";

/// Daemon-reported nodes older than this are flagged offline.
const ONLINE_THRESHOLD_SECONDS: f64 = 900.0;

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MeshtasticCollector {
    host: String,
    port: u16,
    store: Option<Arc<NodeStore>>,
    leases: Arc<LeaseManager>,
    lease_timeout: Duration,
    client: reqwest::Client,
}

impl MeshtasticCollector {
    pub fn new(
        host: &str,
        port: u16,
        store: Option<Arc<NodeStore>>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            store,
            leases,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_from_daemon(&self) -> Result<Vec<Feature>, FetchError> {
        // The HTTP deadline sits one second inside the lease timeout so the
        // request can never outlive the lease that authorizes it.
        let request_timeout = self
            .lease_timeout
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(Duration::from_secs(1));

        let leases = self.leases.clone();
        let (host, port, timeout) = (self.host.clone(), self.port, self.lease_timeout);
        let guard = tokio::task::spawn_blocking(move || {
            leases.acquire(&host, port, "meshtastic_collector", timeout)
        })
        .await
        .map_err(|e| FetchError::Transient(e.to_string()))?;

        let Some(_guard) = guard else {
            debug!("daemon lease held elsewhere, skipping HTTP fetch");
            return Ok(Vec::new());
        };

        let url = format!("http://{}:{}{NODES_ENDPOINT}", self.host, self.port);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .timeout(request_timeout)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let nodes = match &doc {
            Value::Array(list) => list.clone(),
            Value::Object(map) => map
                .get("nodes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => return Err(FetchError::Parse("unexpected nodes document".into())),
        };

        Ok(nodes.iter().filter_map(parse_daemon_node).collect())
    }
}

#[async_trait]
impl Collector for MeshtasticCollector {
    fn source_name(&self) -> &'static str {
        "meshtastic"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut features: Vec<Feature> = self
            .store
            .as_ref()
            .map(|store| store.to_features())
            .unwrap_or_default();

        if features.is_empty() {
            // Retry-once on transient transport errors; parse errors mean the
            // daemon answered with something that is not a node list.
            features = match self.fetch_from_daemon().await {
                Ok(features) => features,
                Err(FetchError::Transient(first)) => {
                    debug!(error = %first, "daemon fetch failed, retrying once");
                    match self.fetch_from_daemon().await {
                        Ok(features) => features,
                        Err(_) => Vec::new(),
                    }
                }
                Err(FetchError::Parse(e)) => return Err(FetchError::Parse(e)),
            };
        }

        Ok(FeatureCollection::new(features, self.source_name()))
    }
}

fn parse_daemon_node(node: &Value) -> Option<Feature> {
    let position = node.get("position")?;
    let lat = position
        .get("latitude")
        .or_else(|| position.get("latitudeI"))
        .and_then(Value::as_f64)?;
    let lon = position
        .get("longitude")
        .or_else(|| position.get("longitudeI"))
        .and_then(Value::as_f64)?;
    let (lat, lon) = crate::geo::validate_coordinates(lat, lon, true).ok()?;

    let user = node.get("user").cloned().unwrap_or(Value::Null);
    let node_id = user
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| node.get("num").and_then(Value::as_u64).map(|n| format!("!{n:08x}")))?;

    let mut props = NodeProperties::new(node_id.clone());
    props.name = user
        .get("longName")
        .or_else(|| user.get("shortName"))
        .and_then(Value::as_str)
        .map(str::to_string);
    props.short_name = user
        .get("shortName")
        .and_then(Value::as_str)
        .map(str::to_string);
    props.hardware = user.get("hwModel").and_then(Value::as_str).map(str::to_string);
    props.role = user.get("role").and_then(Value::as_str).map(str::to_string);
    props.battery = node
        .pointer("/deviceMetrics/batteryLevel")
        .and_then(Value::as_f64);
    props.snr = node.get("snr").and_then(Value::as_f64);
    props.altitude = position.get("altitude").and_then(Value::as_f64);
    props.node_type = Some("meshtastic_node".into());
    if let Some(last_heard) = node.get("lastHeard").and_then(Value::as_i64) {
        props.last_seen = Some(last_heard);
        props.is_online = Some(now_ts() - (last_heard as f64) < ONLINE_THRESHOLD_SECONDS);
    }

    Feature::point(node_id, lat, lon, "meshtastic", props).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon_node_integer_coordinates() {
        let node: Value = serde_json::from_str(
            r#"{
                "num": 287454020,
                "position": {"latitudeI": 401234567, "longitudeI": -1051234567, "altitude": 1600},
                "user": {"id": "!11223344", "longName": "Boulder Node", "hwModel": "TBEAM"},
                "deviceMetrics": {"batteryLevel": 76},
                "snr": 6.25,
                "lastHeard": 1700000000
            }"#,
        )
        .unwrap();

        let feature = parse_daemon_node(&node).unwrap();
        assert_eq!(feature.properties.id, "!11223344");
        assert_eq!(feature.properties.hardware.as_deref(), Some("TBEAM"));
        assert_eq!(feature.properties.battery, Some(76.0));
        let (lat, _) = feature.geometry.as_ref().unwrap().lat_lon().unwrap();
        assert!((lat - 40.1234567).abs() < 1e-9);
    }

    #[test]
    fn test_parse_daemon_node_requires_position() {
        let node: Value =
            serde_json::from_str(r#"{"num": 1, "user": {"id": "!01"}}"#).unwrap();
        assert!(parse_daemon_node(&node).is_none());
    }

    #[tokio::test]
    async fn test_store_takes_priority() {
        let store = Arc::new(NodeStore::default());
        store.update_position("!deadbeef", 40.0, -105.0, None, None);
        let collector = MeshtasticCollector::new(
            "127.0.0.1",
            1, // nothing listens here; the store path must win first
            Some(store),
            Arc::new(LeaseManager::new()),
        );
        let fc = collector.fetch().await.unwrap();
        assert_eq!(fc.features.len(), 1);
        assert_eq!(fc.features[0].properties.id, "!deadbeef");
    }
}
