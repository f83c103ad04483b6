//! Reticulum collector.
//!
//! Primary source is the local diagnostic tool (`rnstatus -d --json`),
//! invoked as an argument vector with a hard deadline, never through a
//! shell. Falls back to the collector's own disk cache and then the
//! unified node cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::collect::{Collector, FetchError};
use crate::geo::{Feature, FeatureCollection, NodeProperties};

const RNSTATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Interface type labels for display.
fn node_type_label(iface_type: &str) -> String {
    let labels: HashMap<&str, &str> = HashMap::from([
        ("rnode", "RNode (LoRa)"),
        ("nomadnet", "NomadNet"),
        ("rnsd", "RNSD"),
        ("tcp", "TCP Transport"),
        ("i2p", "I2P"),
        ("tnc", "TNC KiSS"),
        ("retibbs", "RetiBBS"),
        ("lxmf_group", "LXMF Group"),
        ("lxmf_peer", "LXMF Peer"),
        ("multi", "Multi-Interface"),
        ("yggdrasil", "Yggdrasil"),
    ]);
    labels
        .get(iface_type)
        .map(|s| s.to_string())
        .unwrap_or_else(|| iface_type.to_string())
}

pub struct ReticulumCollector {
    cache_path: PathBuf,
    unified_cache_path: PathBuf,
}

impl Default for ReticulumCollector {
    fn default() -> Self {
        let data_dir = crate::paths::data_dir();
        Self {
            cache_path: data_dir.join("rns_nodes.json"),
            unified_cache_path: data_dir.join("node_cache.json"),
        }
    }
}

impl ReticulumCollector {
    pub fn with_cache_paths(cache_path: PathBuf, unified_cache_path: PathBuf) -> Self {
        Self {
            cache_path,
            unified_cache_path,
        }
    }

    async fn fetch_from_rnstatus(&self) -> Vec<Feature> {
        let output = tokio::time::timeout(
            RNSTATUS_TIMEOUT,
            tokio::process::Command::new("rnstatus")
                .args(["-d", "--json"])
                .output(),
        )
        .await;

        let output = match output {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(_)) => {
                debug!("rnstatus exited nonzero");
                return Vec::new();
            }
            Ok(Err(e)) => {
                debug!(error = %e, "rnstatus not available");
                return Vec::new();
            }
            Err(_) => {
                debug!("rnstatus timed out");
                return Vec::new();
            }
        };

        let Ok(doc) = serde_json::from_slice::<Value>(&output.stdout) else {
            debug!("rnstatus produced unparseable JSON");
            return Vec::new();
        };

        doc.get("interfaces")
            .and_then(Value::as_array)
            .map(|interfaces| {
                interfaces
                    .iter()
                    .filter_map(parse_rns_interface)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Collector for ReticulumCollector {
    fn source_name(&self) -> &'static str {
        "reticulum"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut features: Vec<Feature> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        let mut add_all = |list: Vec<Feature>, features: &mut Vec<Feature>| {
            for feature in list {
                let id = feature.properties.id.clone();
                if id.is_empty() || seen.insert(id) {
                    features.push(feature);
                }
            }
        };

        add_all(self.fetch_from_rnstatus().await, &mut features);
        add_all(
            super::read_cache_features(&self.cache_path, "reticulum"),
            &mut features,
        );
        add_all(
            super::read_cache_features(&self.unified_cache_path, "reticulum"),
            &mut features,
        );

        Ok(FeatureCollection::new(features, self.source_name()))
    }
}

fn parse_rns_interface(iface: &Value) -> Option<Feature> {
    let lat = iface.get("latitude").and_then(Value::as_f64)?;
    let lon = iface.get("longitude").and_then(Value::as_f64)?;
    let (lat, lon) = crate::geo::validate_coordinates(lat, lon, false).ok()?;

    let name = iface
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    let iface_type = iface
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_ascii_lowercase();
    let node_id = iface
        .get("hash")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| name.clone());

    let mut props = NodeProperties::new(node_id.clone());
    props.name = Some(name);
    props.node_type = Some(node_type_label(&iface_type));
    props.is_online = Some(iface.get("status").and_then(Value::as_str) == Some("up"));
    props.description = iface
        .get("description")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    props.altitude = iface.get("height").and_then(Value::as_f64);
    props.extra.insert(
        "rns_interface_type".into(),
        Value::String(iface_type),
    );

    Feature::point(node_id, lat, lon, "reticulum", props).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rns_interface() {
        let iface: Value = serde_json::from_str(
            r#"{
                "name": "RNode LoRa",
                "type": "RNode",
                "hash": "1a2b3c4d",
                "latitude": 40.0,
                "longitude": -105.0,
                "status": "up",
                "height": 1650.0
            }"#,
        )
        .unwrap();
        let feature = parse_rns_interface(&iface).unwrap();
        assert_eq!(feature.properties.id, "1a2b3c4d");
        assert_eq!(feature.properties.node_type.as_deref(), Some("RNode (LoRa)"));
        assert_eq!(feature.properties.is_online, Some(true));
        assert_eq!(feature.properties.altitude, Some(1650.0));
    }

    #[test]
    fn test_parse_rns_interface_requires_coordinates() {
        let iface: Value = serde_json::from_str(r#"{"name": "x", "type": "tcp"}"#).unwrap();
        assert!(parse_rns_interface(&iface).is_none());
    }

    #[tokio::test]
    async fn test_cache_fallback_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("rns_nodes.json");
        let unified = dir.path().join("node_cache.json");
        let feature_json = r#"{"type":"Feature",
            "geometry":{"type":"Point","coordinates":[-105.0,40.0]},
            "properties":{"id":"aa01","network":"reticulum","name":"primary"}}"#;
        std::fs::write(
            &cache,
            format!(r#"{{"type":"FeatureCollection","features":[{feature_json}]}}"#),
        )
        .unwrap();
        let duplicate = feature_json.replace("primary", "secondary");
        std::fs::write(
            &unified,
            format!(r#"{{"type":"FeatureCollection","features":[{duplicate}]}}"#),
        )
        .unwrap();

        let collector = ReticulumCollector::with_cache_paths(cache, unified);
        let fc = collector.fetch().await.unwrap();
        assert_eq!(fc.features.len(), 1);
        assert_eq!(fc.features[0].properties.name.as_deref(), Some("primary"));
    }
}
