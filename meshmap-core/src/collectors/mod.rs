//! Concrete collectors, one per upstream mesh ecosystem.
//!
//! All of them implement [`crate::collect::Collector`] and differ only in
//! `fetch()`; caching, retry, and circuit breaking live in the shared
//! [`crate::collect::CollectorHandle`].

pub mod aredn;
pub mod hamclock;
pub mod meshtastic;
pub mod noaa;
pub mod reticulum;

use serde_json::Value;

use crate::geo::Feature;

/// Read a GeoJSON-ish cache file and return the features matching `network`.
/// Unreadable or malformed caches yield an empty list; disk caches are a
/// best-effort fallback, never an error source.
pub(crate) fn read_cache_features(path: &std::path::Path, network: &str) -> Vec<Feature> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let Ok(doc) = serde_json::from_str::<Value>(&text) else {
        return Vec::new();
    };
    let Some(features) = doc.get("features").and_then(Value::as_array) else {
        return Vec::new();
    };
    features
        .iter()
        .filter(|f| {
            f.pointer("/properties/network").and_then(Value::as_str) == Some(network)
        })
        .filter_map(|f| serde_json::from_value(f.clone()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_cache_features_filters_by_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_cache.json");
        std::fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","geometry":{"type":"Point","coordinates":[-105.0,40.0]},
                 "properties":{"id":"aa01","network":"reticulum"}},
                {"type":"Feature","geometry":{"type":"Point","coordinates":[-104.0,41.0]},
                 "properties":{"id":"bb02","network":"aredn"}}
            ]}"#,
        )
        .unwrap();

        let features = read_cache_features(&path, "reticulum");
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].properties.id, "aa01");
    }

    #[test]
    fn test_read_cache_features_tolerates_missing_file() {
        assert!(read_cache_features(std::path::Path::new("/nonexistent/cache.json"), "aredn")
            .is_empty());
    }
}
