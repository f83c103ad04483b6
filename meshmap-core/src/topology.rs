//! Topology links and the 5-tier SNR quality scale.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geo::{Feature, FeatureCollection};

/// Link quality classification derived from SNR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkQuality {
    Excellent,
    Good,
    Marginal,
    Poor,
    Bad,
    Unknown,
}

impl LinkQuality {
    pub fn color(self) -> &'static str {
        match self {
            LinkQuality::Excellent => "#4caf50",
            LinkQuality::Good => "#8bc34a",
            LinkQuality::Marginal => "#ffeb3b",
            LinkQuality::Poor => "#ff9800",
            LinkQuality::Bad => "#f44336",
            LinkQuality::Unknown => "#9e9e9e",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LinkQuality::Excellent => "excellent",
            LinkQuality::Good => "good",
            LinkQuality::Marginal => "marginal",
            LinkQuality::Poor => "poor",
            LinkQuality::Bad => "bad",
            LinkQuality::Unknown => "unknown",
        }
    }
}

/// Classify an SNR reading (dB). Band boundaries are inclusive at the upper
/// end: exactly 8.0 is Excellent, exactly 5.0 is Good, exactly 0.0 is
/// Marginal, exactly -10.0 is Poor.
pub fn classify_snr(snr: Option<f64>) -> LinkQuality {
    let Some(snr) = snr else {
        return LinkQuality::Unknown;
    };
    if snr.is_nan() {
        return LinkQuality::Unknown;
    }
    if snr >= 8.0 {
        LinkQuality::Excellent
    } else if snr >= 5.0 {
        LinkQuality::Good
    } else if snr >= 0.0 {
        LinkQuality::Marginal
    } else if snr >= -10.0 {
        LinkQuality::Poor
    } else {
        LinkQuality::Bad
    }
}

/// A directed edge between two node IDs with resolved endpoint coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyLink {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    pub quality: LinkQuality,
    pub color: String,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    pub source_lat: f64,
    pub source_lon: f64,
    pub target_lat: f64,
    pub target_lon: f64,
}

impl TopologyLink {
    pub fn new(
        source: String,
        target: String,
        snr: Option<f64>,
        network: &str,
        link_type: Option<String>,
        (source_lat, source_lon): (f64, f64),
        (target_lat, target_lon): (f64, f64),
    ) -> Self {
        let quality = classify_snr(snr);
        Self {
            source,
            target,
            snr,
            quality,
            color: quality.color().to_string(),
            network: network.to_string(),
            link_type,
            source_lat,
            source_lon,
            target_lat,
            target_lon,
        }
    }

    /// Render the link as a GeoJSON LineString feature for direct map display.
    pub fn to_feature(&self) -> Feature {
        let mut props = crate::geo::NodeProperties::new("");
        props.network = Some(self.network.clone());
        props.snr = self.snr;
        props.link_type = self.link_type.clone();
        props
            .extra
            .insert("source".into(), Value::String(self.source.clone()));
        props
            .extra
            .insert("target".into(), Value::String(self.target.clone()));
        props.extra.insert(
            "quality".into(),
            Value::String(self.quality.label().to_string()),
        );
        props
            .extra
            .insert("color".into(), Value::String(self.color.clone()));
        Feature {
            kind: "Feature".into(),
            geometry: Some(crate::geo::Geometry::LineString {
                coordinates: vec![
                    vec![self.source_lon, self.source_lat],
                    vec![self.target_lon, self.target_lat],
                ],
            }),
            properties: props,
        }
    }
}

/// Wrap links in a FeatureCollection with a `link_count` property.
pub fn links_to_geojson(links: &[TopologyLink]) -> FeatureCollection {
    let features: Vec<Feature> = links.iter().map(TopologyLink::to_feature).collect();
    let mut fc = FeatureCollection::new(features, "topology");
    fc.set_property("link_count", Value::from(links.len()));
    fc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snr_band_boundaries_inclusive() {
        assert_eq!(classify_snr(Some(8.0)), LinkQuality::Excellent);
        assert_eq!(classify_snr(Some(7.999)), LinkQuality::Good);
        assert_eq!(classify_snr(Some(5.0)), LinkQuality::Good);
        assert_eq!(classify_snr(Some(0.0)), LinkQuality::Marginal);
        assert_eq!(classify_snr(Some(-0.001)), LinkQuality::Poor);
        assert_eq!(classify_snr(Some(-10.0)), LinkQuality::Poor);
        assert_eq!(classify_snr(Some(-10.5)), LinkQuality::Bad);
        assert_eq!(classify_snr(None), LinkQuality::Unknown);
    }

    #[test]
    fn test_link_geojson_shape() {
        let link = TopologyLink::new(
            "!aa".into(),
            "!bb".into(),
            Some(6.0),
            "meshtastic",
            None,
            (40.0, -105.0),
            (40.5, -105.5),
        );
        let fc = links_to_geojson(std::slice::from_ref(&link));
        assert_eq!(fc.features.len(), 1);
        assert_eq!(fc.properties.get("link_count").unwrap(), 1);
        let value = serde_json::to_value(&fc.features[0]).unwrap();
        assert_eq!(value["geometry"]["type"], "LineString");
        assert_eq!(value["properties"]["quality"], "good");
        assert_eq!(value["properties"]["color"], "#8bc34a");
    }
}
