//! Geospatial feature model and input validation.
//!
//! Every collector and every store speaks `Feature`: a GeoJSON-style record
//! with a node id, an optional point geometry, and a typed property bag.
//! Unknown property keys are preserved end-to-end through the flattened
//! `extra` map; only the enumerated fields carry semantics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MapsError, MapsResult};

/// Node IDs are hex strings, optionally prefixed with `!` (Meshtastic
/// convention), up to 16 hex chars.
const NODE_ID_MAX_LEN: usize = 16;

/// Validate and normalize GPS coordinates.
///
/// Rejects NaN and ±∞, out-of-range values, and Null Island, the exact
/// point (0, 0) that an uninitialized GPS fix reports. When
/// `convert_int` is set, integer-scaled coordinates (Meshtastic `latitudeI`,
/// degrees × 1e7) are converted before validation.
pub fn validate_coordinates(lat: f64, lon: f64, convert_int: bool) -> MapsResult<(f64, f64)> {
    let (mut lat, mut lon) = (lat, lon);

    if convert_int {
        if lat.fract() == 0.0 && lat.abs() > 900.0 {
            lat /= 1e7;
        }
        if lon.fract() == 0.0 && lon.abs() > 1800.0 {
            lon /= 1e7;
        }
    }

    if lat.is_nan() || lon.is_nan() || lat.is_infinite() || lon.is_infinite() {
        return Err(MapsError::InvalidCoordinates(format!(
            "non-finite lat/lon ({lat}, {lon})"
        )));
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(MapsError::InvalidCoordinates(format!(
            "out of range ({lat}, {lon})"
        )));
    }
    if lat == 0.0 && lon == 0.0 {
        return Err(MapsError::InvalidCoordinates("null island".into()));
    }

    Ok((lat, lon))
}

/// Validate a node ID against `^!?[0-9a-fA-F]{1,16}$` and return the
/// canonical form: lowercased, leading `!` stripped.
pub fn validate_node_id(id: &str) -> MapsResult<String> {
    let bare = id.strip_prefix('!').unwrap_or(id);
    if bare.is_empty()
        || bare.len() > NODE_ID_MAX_LEN
        || !bare.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(MapsError::InvalidNodeId(id.to_string()));
    }
    Ok(bare.to_ascii_lowercase())
}

/// True when the string is a syntactically valid node ID (prefix allowed).
pub fn is_valid_node_id(id: &str) -> bool {
    validate_node_id(id).is_ok()
}

// ── Feature model ────────────────────────────────────────────────────────────

/// Point geometry; coordinates are `[lon, lat]` or `[lon, lat, alt]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Vec<f64> },
    LineString { coordinates: Vec<Vec<f64>> },
    // Polygon shapes pass through from overlay sources (weather alert areas).
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
}

impl Geometry {
    pub fn point(lat: f64, lon: f64, altitude: Option<f64>) -> Self {
        let mut coordinates = vec![lon, lat];
        if let Some(alt) = altitude {
            coordinates.push(alt);
        }
        Geometry::Point { coordinates }
    }

    /// `(lat, lon)` of a point geometry.
    pub fn lat_lon(&self) -> Option<(f64, f64)> {
        match self {
            Geometry::Point { coordinates } if coordinates.len() >= 2 => {
                Some((coordinates[1], coordinates[0]))
            }
            _ => None,
        }
    }
}

/// Recognized node properties. Absent numerics stay absent on the wire
/// (`None` is never serialized as zero; battery=0 and snr=0 are valid
/// observations, distinct from missing).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProperties {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modem_preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops_away: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_util: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_util_tx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iaq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm25: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nox: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spo2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_relay: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_mqtt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unrecognized upstream keys, preserved end-to-end.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl NodeProperties {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Metric lookup by name, for the alert engine's rule evaluation.
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "battery" => self.battery,
            "voltage" => self.voltage,
            "snr" => self.snr,
            "rssi" => self.rssi,
            "hops_away" => self.hops_away.map(f64::from),
            "channel_util" => self.channel_util,
            "air_util_tx" => self.air_util_tx,
            "temperature" => self.temperature,
            "humidity" => self.humidity,
            "pressure" => self.pressure,
            "iaq" => self.iaq,
            "pm25" => self.pm25,
            "co2" => self.co2,
            "voc" => self.voc,
            "nox" => self.nox,
            "heart_bpm" => self.heart_bpm,
            "spo2" => self.spo2,
            "body_temperature" => self.body_temperature,
            "altitude" => self.altitude,
            "last_seen" => self.last_seen.map(|v| v as f64),
            other => self.extra.get(other).and_then(Value::as_f64),
        }
    }
}

/// A single node rendered as a GeoJSON-style feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_tag")]
    pub kind: String,
    pub geometry: Option<Geometry>,
    pub properties: NodeProperties,
}

fn feature_tag() -> String {
    "Feature".into()
}

impl Feature {
    /// Build a point feature, validating coordinates first.
    pub fn point(
        node_id: impl Into<String>,
        lat: f64,
        lon: f64,
        network: &str,
        mut properties: NodeProperties,
    ) -> MapsResult<Self> {
        let (lat, lon) = validate_coordinates(lat, lon, false)?;
        let id = node_id.into();
        properties.id = id.clone();
        if properties.name.is_none() {
            properties.name = Some(id);
        }
        properties.network = Some(network.to_string());
        let altitude = properties.altitude;
        Ok(Self {
            kind: "Feature".into(),
            geometry: Some(Geometry::point(lat, lon, altitude)),
            properties,
        })
    }

    /// Non-geolocated feature; kept in stores, excluded from GeoJSON node
    /// responses.
    pub fn without_geometry(properties: NodeProperties) -> Self {
        Self {
            kind: "Feature".into(),
            geometry: None,
            properties,
        }
    }

    pub fn id(&self) -> &str {
        &self.properties.id
    }
}

/// GeoJSON FeatureCollection with free-form collection properties
/// (`source`, `collected_at`, `node_count`, overlay data, per-source counts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default = "collection_tag")]
    pub kind: String,
    pub features: Vec<Feature>,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

fn collection_tag() -> String {
    "FeatureCollection".into()
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>, source: &str) -> Self {
        let mut properties = serde_json::Map::new();
        properties.insert("source".into(), Value::String(source.to_string()));
        properties.insert(
            "collected_at".into(),
            Value::String(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );
        properties.insert("node_count".into(), Value::from(features.len()));
        Self {
            kind: "FeatureCollection".into(),
            features,
            properties,
        }
    }

    pub fn empty(source: &str) -> Self {
        Self::new(Vec::new(), source)
    }

    pub fn set_property(&mut self, key: &str, value: Value) {
        self.properties.insert(key.to_string(), value);
    }
}

/// Merge feature lists, deduplicating by `properties.id`. First occurrence
/// wins; features without an id pass through unconditionally.
pub fn deduplicate_features(feature_lists: Vec<Vec<Feature>>) -> Vec<Feature> {
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut result = Vec::new();
    for features in feature_lists {
        for feature in features {
            if feature.properties.id.is_empty() {
                result.push(feature);
            } else if seen.insert(feature.properties.id.clone()) {
                result.push(feature);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_null_island() {
        assert!(validate_coordinates(0.0, 0.0, false).is_err());
        assert!(validate_coordinates(-0.0, 0.0, false).is_err());
    }

    #[test]
    fn test_accepts_epsilon_off_null_island() {
        assert!(validate_coordinates(0.0, 0.0001, false).is_ok());
        assert!(validate_coordinates(0.0001, 0.0, false).is_ok());
        assert!(validate_coordinates(0.001, 0.003, false).is_ok());
    }

    #[test]
    fn test_rejects_non_finite() {
        assert!(validate_coordinates(f64::NAN, 10.0, false).is_err());
        assert!(validate_coordinates(10.0, f64::INFINITY, false).is_err());
        assert!(validate_coordinates(f64::NEG_INFINITY, 10.0, false).is_err());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(validate_coordinates(90.1, 0.5, false).is_err());
        assert!(validate_coordinates(-91.0, 0.5, false).is_err());
        assert!(validate_coordinates(0.5, 180.5, false).is_err());
    }

    #[test]
    fn test_integer_scaling() {
        let (lat, lon) = validate_coordinates(401234567.0, -1051234567.0, true).unwrap();
        assert!((lat - 40.1234567).abs() < 1e-9);
        assert!((lon + 105.1234567).abs() < 1e-9);
        // Without convert_int the same input is out of range.
        assert!(validate_coordinates(401234567.0, -1051234567.0, false).is_err());
    }

    #[test]
    fn test_node_id_prefix_equivalence() {
        assert_eq!(
            validate_node_id("a1b2c3d4").unwrap(),
            validate_node_id("!a1b2c3d4").unwrap()
        );
        assert_eq!(validate_node_id("!DEADBEEF").unwrap(), "deadbeef");
    }

    #[test]
    fn test_node_id_rejects_invalid() {
        assert!(validate_node_id("").is_err());
        assert!(validate_node_id("!").is_err());
        assert!(validate_node_id("xyz!").is_err());
        assert!(validate_node_id("0123456789abcdef0").is_err()); // 17 chars
        assert!(validate_node_id("node-1").is_err());
    }

    #[test]
    fn test_feature_geojson_round_trip() {
        let mut props = NodeProperties::new("!deadbeef");
        props.battery = Some(0.0);
        props.snr = Some(-3.5);
        props.hops_away = Some(2);
        props.is_online = Some(true);
        props
            .extra
            .insert("custom_key".into(), Value::String("kept".into()));
        let feature = Feature::point("!deadbeef", 40.0, -105.0, "meshtastic", props).unwrap();

        let text = serde_json::to_string(&feature).unwrap();
        let back: Feature = serde_json::from_str(&text).unwrap();
        assert_eq!(feature, back);
        // Zero battery survives as zero, not as missing.
        assert_eq!(back.properties.battery, Some(0.0));
        assert_eq!(
            back.properties.extra.get("custom_key").and_then(Value::as_str),
            Some("kept")
        );
    }

    #[test]
    fn test_missing_numerics_not_serialized() {
        let feature =
            Feature::point("!01", 40.0, -105.0, "meshtastic", NodeProperties::new("!01")).unwrap();
        let value = serde_json::to_value(&feature).unwrap();
        let props = value.get("properties").unwrap().as_object().unwrap();
        assert!(!props.contains_key("battery"));
        assert!(!props.contains_key("snr"));
    }

    #[test]
    fn test_dedup_first_occurrence_wins() {
        let mut a = NodeProperties::new("deadbeef");
        a.name = Some("first".into());
        let mut b = NodeProperties::new("deadbeef");
        b.name = Some("second".into());
        let f1 = Feature::point("deadbeef", 40.0, -105.0, "meshtastic", a).unwrap();
        let f2 = Feature::point("deadbeef", 41.0, -104.0, "aredn", b).unwrap();

        let merged = deduplicate_features(vec![vec![f1], vec![f2]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].properties.name.as_deref(), Some("first"));
    }
}
