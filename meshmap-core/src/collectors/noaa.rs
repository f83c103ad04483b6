//! NOAA weather-alert overlay collector.
//!
//! Fetches active alerts from the National Weather Service API, which
//! returns native GeoJSON with polygon geometries for the alert areas.
//! Overlay-only: these features are map layers, not mesh nodes, so the
//! aggregator excludes this source from node aggregation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::collect::{Collector, FetchError};
use crate::geo::{Feature, FeatureCollection};

const DEFAULT_API_URL: &str = "https://api.weather.gov/alerts/active";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn severity_color(severity: &str) -> &'static str {
    match severity {
        "Extreme" => "#d32f2f",
        "Severe" => "#f44336",
        "Moderate" => "#ff9800",
        "Minor" => "#ffeb3b",
        _ => "#9e9e9e",
    }
}

fn severity_order(severity: &str) -> u8 {
    match severity {
        "Extreme" => 0,
        "Severe" => 1,
        "Moderate" => 2,
        "Minor" => 3,
        _ => 4,
    }
}

pub struct NoaaAlertCollector {
    api_url: String,
    area: Option<String>,
    severity_filter: Option<Vec<String>>,
    client: reqwest::Client,
}

impl NoaaAlertCollector {
    pub fn new(area: Option<String>, severity_filter: Option<Vec<String>>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            area,
            severity_filter,
            client: reqwest::Client::new(),
        }
    }

    fn accepts_severity(&self, severity: &str) -> bool {
        match &self.severity_filter {
            Some(filter) => filter.iter().any(|s| s == severity),
            None => true,
        }
    }
}

#[async_trait]
impl Collector for NoaaAlertCollector {
    fn source_name(&self) -> &'static str {
        "noaa_alerts"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut url = self.api_url.clone();
        if let Some(ref area) = self.area {
            url = format!("{url}?area={area}");
        }

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/geo+json")
            .header("User-Agent", crate::SERVER_IDENT)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let raw = doc
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Parse("alerts document missing features".into()))?;

        let mut parsed: Vec<(u8, Feature)> = Vec::new();
        for entry in raw {
            // National-level alerts come without geometry; nothing to render.
            if entry.get("geometry").map(Value::is_null).unwrap_or(true) {
                continue;
            }
            let severity = entry
                .pointer("/properties/severity")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            if !self.accepts_severity(&severity) {
                continue;
            }
            let Some(mut feature) = to_alert_feature(entry) else {
                continue;
            };
            feature
                .properties
                .extra
                .insert("color".into(), Value::String(severity_color(&severity).into()));
            parsed.push((severity_order(&severity), feature));
        }

        // Most severe first so the client can draw them bottom-up.
        parsed.sort_by_key(|(order, _)| *order);
        let features = parsed.into_iter().map(|(_, f)| f).collect();
        Ok(FeatureCollection::new(features, self.source_name()))
    }
}

fn to_alert_feature(entry: &Value) -> Option<Feature> {
    let geometry = serde_json::from_value(entry.get("geometry")?.clone()).ok()?;
    let props = entry.get("properties")?.as_object()?;

    let mut properties = crate::geo::NodeProperties::new(
        props
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    );
    properties.network = Some("noaa".into());
    properties.node_type = Some("weather_alert".into());
    for key in ["event", "severity", "headline", "areaDesc", "expires", "urgency"] {
        if let Some(value) = props.get(key) {
            if !value.is_null() {
                properties.extra.insert(key.to_string(), value.clone());
            }
        }
    }
    properties.description = props
        .get("description")
        .and_then(Value::as_str)
        .map(|s| s.chars().take(500).collect());

    Some(Feature {
        kind: "Feature".into(),
        geometry: Some(geometry),
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(severity: &str, with_geometry: bool) -> Value {
        let geometry = if with_geometry {
            r#"{"type": "Polygon", "coordinates": [[[-105.0,40.0],[-104.0,40.0],[-104.0,41.0],[-105.0,40.0]]]}"#
        } else {
            "null"
        };
        serde_json::from_str(&format!(
            r#"{{
                "geometry": {geometry},
                "properties": {{
                    "id": "urn:oid:2.49.0.1.840.0.x",
                    "event": "Winter Storm Warning",
                    "severity": "{severity}",
                    "headline": "Heavy snow expected"
                }}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_alert_feature_extraction() {
        let feature = to_alert_feature(&alert("Severe", true)).unwrap();
        assert_eq!(
            feature.properties.extra.get("event").and_then(Value::as_str),
            Some("Winter Storm Warning")
        );
        assert!(matches!(
            feature.geometry,
            Some(crate::geo::Geometry::Polygon { .. })
        ));
    }

    #[test]
    fn test_severity_colors_and_order() {
        assert_eq!(severity_color("Extreme"), "#d32f2f");
        assert_eq!(severity_color("nonsense"), "#9e9e9e");
        assert!(severity_order("Extreme") < severity_order("Minor"));
    }

    #[test]
    fn test_severity_filter() {
        let collector =
            NoaaAlertCollector::new(None, Some(vec!["Extreme".into(), "Severe".into()]));
        assert!(collector.accepts_severity("Severe"));
        assert!(!collector.accepts_severity("Minor"));
        let unfiltered = NoaaAlertCollector::new(None, None);
        assert!(unfiltered.accepts_severity("Minor"));
    }
}
