//! AREDN (Wi-Fi mesh) collector.
//!
//! Every AREDN node exposes its own `sysinfo.json` HTTP API on the mesh.
//! For each configured target the collector fetches the status document with
//! link-quality-manager data, validates that the response really came from
//! an AREDN node, and extracts both a node feature and directed LQM edges.
//! Parsed links are installed under a topology-private mutex so readers never
//! see a half-updated link set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::collect::{Collector, FetchError};
use crate::geo::{Feature, FeatureCollection, NodeProperties};
use crate::topology::TopologyLink;

const SYSINFO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ArednCollector {
    node_targets: Vec<String>,
    cache_path: PathBuf,
    unified_cache_path: PathBuf,
    client: reqwest::Client,
    links: Mutex<Vec<TopologyLink>>,
}

impl ArednCollector {
    pub fn new(node_targets: Vec<String>) -> Self {
        let data_dir = crate::paths::data_dir();
        Self {
            node_targets,
            cache_path: data_dir.join("aredn_nodes.json"),
            unified_cache_path: data_dir.join("node_cache.json"),
            client: reqwest::Client::new(),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Directed LQM edges from the last successful fetch.
    pub fn topology_links(&self) -> Vec<TopologyLink> {
        self.links.lock().clone()
    }

    async fn fetch_sysinfo(&self, target: &str) -> Result<Value, FetchError> {
        let url = format!("http://{target}/a/sysinfo?lqm=1");
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("User-Agent", crate::SERVER_IDENT)
            .timeout(SYSINFO_TIMEOUT)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Collector for ArednCollector {
    fn source_name(&self) -> &'static str {
        "aredn"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut features: Vec<Feature> = Vec::new();
        let mut raw_links: Vec<RawLink> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for target in &self.node_targets {
            let doc = match self.fetch_sysinfo(target).await {
                Ok(doc) => doc,
                Err(e) => {
                    debug!(target = %target, error = %e, "AREDN node unreachable");
                    continue;
                }
            };
            // Some other HTTP service could answer on the same port; insist
            // on AREDN's document shape before trusting it.
            if !doc.is_object()
                || !(doc.get("node").is_some()
                    || doc.get("sysinfo").is_some()
                    || doc.get("meshrf").is_some())
            {
                debug!(target = %target, "response missing expected AREDN fields");
                continue;
            }

            if let Some(feature) = parse_sysinfo(&doc, target) {
                if seen.insert(feature.properties.id.clone()) {
                    raw_links.extend(parse_lqm_links(&doc, &feature.properties.id));
                    features.push(feature);
                }
            }
        }

        for feature in super::read_cache_features(&self.cache_path, "aredn") {
            if seen.insert(feature.properties.id.clone()) {
                features.push(feature);
            }
        }
        for feature in super::read_cache_features(&self.unified_cache_path, "aredn") {
            if seen.insert(feature.properties.id.clone()) {
                features.push(feature);
            }
        }

        *self.links.lock() = resolve_links(raw_links, &features);

        Ok(FeatureCollection::new(features, self.source_name()))
    }
}

/// An LQM edge before neighbor coordinates are resolved.
struct RawLink {
    source: String,
    target: String,
    snr: Option<f64>,
    link_type: Option<String>,
}

fn parse_sysinfo(doc: &Value, target: &str) -> Option<Feature> {
    let lat = coerce_f64(doc.get("lat")?)?;
    let lon = coerce_f64(doc.get("lon")?)?;
    let (lat, lon) = crate::geo::validate_coordinates(lat, lon, false).ok()?;

    let node_name = doc
        .get("node")
        .and_then(Value::as_str)
        .unwrap_or(target)
        .to_string();
    let model = doc.get("model").and_then(Value::as_str).unwrap_or_default();
    let firmware = doc
        .get("firmware_version")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut props = NodeProperties::new(node_name.clone());
    props.name = Some(node_name.clone());
    props.node_type = Some("aredn_node".into());
    props.hardware = (!model.is_empty()).then(|| model.to_string());
    props.firmware = (!firmware.is_empty()).then(|| firmware.to_string());
    props.is_online = Some(true);
    props.description = Some(format!("AREDN {model} - {firmware}"));
    if let Some(grid) = doc.get("grid_square").and_then(Value::as_str) {
        if !grid.is_empty() {
            props
                .extra
                .insert("grid_square".into(), Value::String(grid.into()));
        }
    }
    if let Some(loads) = doc.pointer("/sysinfo/loads").and_then(Value::as_array) {
        if let Some(load) = loads.first().and_then(Value::as_f64) {
            props.extra.insert("load_avg".into(), Value::from(load));
        }
    }

    Feature::point(node_name, lat, lon, "aredn", props).ok()
}

fn parse_lqm_links(doc: &Value, source_id: &str) -> Vec<RawLink> {
    let Some(entries) = doc.get("lqm").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let name = entry
                .get("name")
                .or_else(|| entry.get("hostname"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())?;
            Some(RawLink {
                source: source_id.to_string(),
                target: name.to_string(),
                snr: entry.get("snr").and_then(coerce_f64),
                link_type: entry
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

/// Keep only links whose both endpoints resolved to geolocated features.
fn resolve_links(raw: Vec<RawLink>, features: &[Feature]) -> Vec<TopologyLink> {
    let coords: HashMap<&str, (f64, f64)> = features
        .iter()
        .filter_map(|f| {
            f.geometry
                .as_ref()
                .and_then(|g| g.lat_lon())
                .map(|c| (f.properties.id.as_str(), c))
        })
        .collect();

    raw.into_iter()
        .filter_map(|link| {
            let src = *coords.get(link.source.as_str())?;
            let dst = *coords.get(link.target.as_str())?;
            Some(TopologyLink::new(
                link.source,
                link.target,
                link.snr,
                "aredn",
                link.link_type,
                src,
                dst,
            ))
        })
        .collect()
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sysinfo(node: &str, lat: f64, lon: f64, lqm: &str) -> Value {
        serde_json::from_str(&format!(
            r#"{{
                "node": "{node}",
                "lat": {lat},
                "lon": {lon},
                "model": "hAP ac lite",
                "firmware_version": "3.24.4.0",
                "sysinfo": {{"uptime": "5 days", "loads": [0.25, 0.2, 0.15]}},
                "lqm": {lqm}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_sysinfo_feature() {
        let doc = sysinfo("KF0ABC-node", 39.7, -104.9, "[]");
        let feature = parse_sysinfo(&doc, "10.1.2.3").unwrap();
        assert_eq!(feature.properties.id, "KF0ABC-node");
        assert_eq!(feature.properties.hardware.as_deref(), Some("hAP ac lite"));
        assert_eq!(feature.properties.firmware.as_deref(), Some("3.24.4.0"));
        assert_eq!(
            feature.properties.extra.get("load_avg").and_then(Value::as_f64),
            Some(0.25)
        );
    }

    #[test]
    fn test_string_coordinates_accepted() {
        let doc: Value = serde_json::from_str(
            r#"{"node": "n1", "lat": "39.7", "lon": "-104.9", "sysinfo": {}}"#,
        )
        .unwrap();
        assert!(parse_sysinfo(&doc, "t").is_some());
    }

    #[test]
    fn test_lqm_links_resolved_against_known_nodes() {
        let doc_a = sysinfo(
            "node-a",
            39.7,
            -104.9,
            r#"[{"name": "node-b", "snr": 28, "type": "RF"},
                {"name": "node-missing", "snr": 10, "type": "DTD"}]"#,
        );
        let doc_b = sysinfo("node-b", 39.8, -104.8, "[]");

        let fa = parse_sysinfo(&doc_a, "a").unwrap();
        let fb = parse_sysinfo(&doc_b, "b").unwrap();
        let raw = parse_lqm_links(&doc_a, "node-a");
        assert_eq!(raw.len(), 2);

        let links = resolve_links(raw, &[fa, fb]);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, "node-b");
        assert_eq!(links[0].link_type.as_deref(), Some("RF"));
        assert_eq!(links[0].quality, crate::topology::LinkQuality::Excellent);
    }
}
