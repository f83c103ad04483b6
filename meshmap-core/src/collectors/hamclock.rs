//! Propagation collector.
//!
//! Probes a local propagation dashboard (the OpenHamClock port first, then
//! the legacy port) and records which variant answered so endpoint names
//! and key spellings can be adapted through the compatibility layer. When no
//! local service responds, falls back to the public NOAA SWPC space-weather
//! API. Always computes the solar terminator; the output is overlay
//! metadata, not point features.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::collect::{Collector, FetchError};
use crate::geo::FeatureCollection;
use crate::hamclock_compat::{
    detect_variant, endpoint_map, normalize_band_conditions, normalize_de_dx, normalize_spacewx,
    parse_key_value, Variant,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// NOAA SWPC public JSON endpoints.
const SWPC_SOLAR_FLUX: &str =
    "https://services.swpc.noaa.gov/products/summary/10cm-flux.json";
const SWPC_KP_INDEX: &str =
    "https://services.swpc.noaa.gov/products/noaa-planetary-k-index.json";
const SWPC_SOLAR_WIND: &str =
    "https://services.swpc.noaa.gov/products/summary/solar-wind-speed.json";

pub struct HamClockCollector {
    host: String,
    legacy_port: u16,
    openhamclock_port: u16,
    client: reqwest::Client,
    /// Which variant answered the last probe (diagnostics + endpoint names).
    detected: Mutex<Option<Variant>>,
    /// Most recent full dataset for `/api/hamclock`.
    last_data: Mutex<Value>,
}

impl HamClockCollector {
    pub fn new(host: &str, legacy_port: u16, openhamclock_port: u16) -> Self {
        Self {
            host: host.to_string(),
            legacy_port,
            openhamclock_port,
            client: reqwest::Client::new(),
            detected: Mutex::new(None),
            last_data: Mutex::new(Value::Null),
        }
    }

    pub fn detected_variant(&self) -> Option<Variant> {
        *self.detected.lock()
    }

    /// Full propagation aggregate for the `/api/hamclock` endpoint.
    pub fn hamclock_data(&self) -> Value {
        let data = self.last_data.lock().clone();
        if data.is_null() {
            json!({"available": false})
        } else {
            data
        }
    }

    async fn get_text(&self, port: u16, path: &str) -> Option<String> {
        let url = format!("http://{}:{}{}", self.host, port, path);
        let response = self
            .client
            .get(&url)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }

    async fn get_json(&self, url: &str) -> Option<Value> {
        self.client
            .get(url)
            .header("Accept", "application/json")
            .header("User-Agent", crate::SERVER_IDENT)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()
    }

    /// Probe the OpenHamClock port first, then the legacy port. Returns the
    /// answering port and its variant.
    async fn probe_local(&self) -> Option<(u16, Variant)> {
        for port in [self.openhamclock_port, self.legacy_port] {
            if let Some(sys_text) = self.get_text(port, "/get_sys.txt").await {
                let variant = detect_variant(&sys_text);
                debug!(port, variant = variant.as_str(), "propagation service answered");
                return Some((port, variant));
            }
        }
        None
    }

    async fn fetch_local(&self, port: u16, variant: Variant) -> Value {
        let endpoints = endpoint_map(variant);
        let mut data = json!({
            "available": true,
            "variant": variant.as_str(),
            "port": port,
        });

        if let Some(text) = self.get_text(port, endpoints["spacewx"]).await {
            let spacewx = normalize_spacewx(parse_key_value(&text));
            data["space_weather"] = string_map_json(&spacewx);
        }
        if let Some(text) = self.get_text(port, endpoints["band_conditions"]).await {
            let bands = normalize_band_conditions(parse_key_value(&text));
            data["band_conditions"] = string_map_json(&bands);
        }
        if let Some(text) = self.get_text(port, endpoints["de"]).await {
            data["de_station"] = string_map_json(&normalize_de_dx(parse_key_value(&text)));
        }
        if let Some(text) = self.get_text(port, endpoints["dx"]).await {
            data["dx_station"] = string_map_json(&normalize_de_dx(parse_key_value(&text)));
        }
        data
    }

    /// Public space-weather fallback when no local dashboard answers.
    async fn fetch_swpc(&self) -> Value {
        let mut weather = json!({
            "solar_flux": Value::Null,
            "kp_index": Value::Null,
            "solar_wind_speed": Value::Null,
            "band_conditions": "unknown",
            "fetched_at": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        });

        if let Some(flux) = self.get_json(SWPC_SOLAR_FLUX).await {
            weather["solar_flux"] = flux.get("Flux").cloned().unwrap_or(Value::Null);
        }
        if let Some(kp) = self.get_json(SWPC_KP_INDEX).await {
            // Tabular response; the last row is the most recent reading.
            if let Some(latest) = kp.as_array().and_then(|rows| rows.last()) {
                if let Some(value) = latest.get(1) {
                    weather["kp_index"] = match value {
                        Value::String(s) => s
                            .parse::<f64>()
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                        other => other.clone(),
                    };
                }
            }
        }
        if let Some(wind) = self.get_json(SWPC_SOLAR_WIND).await {
            weather["solar_wind_speed"] =
                wind.get("WindSpeed").cloned().unwrap_or(Value::Null);
        }

        let sfi = coerce_num(&weather["solar_flux"]);
        let kp = coerce_num(&weather["kp_index"]);
        weather["band_conditions"] = Value::String(assess_band_conditions(sfi, kp).to_string());
        weather
    }
}

#[async_trait]
impl Collector for HamClockCollector {
    fn source_name(&self) -> &'static str {
        "hamclock"
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        let mut fc = FeatureCollection::empty(self.source_name());

        let (space_weather, hamclock) = match self.probe_local().await {
            Some((port, variant)) => {
                *self.detected.lock() = Some(variant);
                let local = self.fetch_local(port, variant).await;
                let weather = local.get("space_weather").cloned().unwrap_or(Value::Null);
                (weather, Some(local))
            }
            None => {
                *self.detected.lock() = None;
                (self.fetch_swpc().await, None)
            }
        };

        fc.set_property("space_weather", space_weather);
        fc.set_property("solar_terminator", solar_terminator());
        if let Some(hamclock) = hamclock {
            *self.last_data.lock() = hamclock.clone();
            fc.set_property("hamclock", hamclock);
        }
        Ok(fc)
    }
}

fn string_map_json(map: &HashMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn coerce_num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Band condition assessment from solar flux index and planetary K-index.
fn assess_band_conditions(sfi: Option<f64>, kp: Option<f64>) -> &'static str {
    let (Some(sfi), Some(kp)) = (sfi, kp) else {
        return "unknown";
    };
    if kp >= 7.0 {
        "poor" // major geomagnetic storm
    } else if kp >= 5.0 {
        "fair"
    } else if sfi >= 150.0 && kp < 4.0 {
        "excellent"
    } else if sfi >= 100.0 && kp < 4.0 {
        "good"
    } else if sfi >= 70.0 {
        "fair"
    } else {
        "poor"
    }
}

/// Subsolar point for the day/night boundary; the terminator line itself is
/// rendered client-side.
fn solar_terminator() -> Value {
    use chrono::{Datelike, Timelike, Utc};
    let now = Utc::now();
    let day_of_year = now.ordinal() as f64;
    let hour_utc = now.hour() as f64 + now.minute() as f64 / 60.0;

    let declination =
        -23.44 * (f64::to_radians(360.0 / 365.0 * (day_of_year + 10.0))).cos();
    let mut subsolar_lon = (12.0 - hour_utc) * 15.0;
    if subsolar_lon > 180.0 {
        subsolar_lon -= 360.0;
    } else if subsolar_lon < -180.0 {
        subsolar_lon += 360.0;
    }

    json!({
        "subsolar_lat": declination,
        "subsolar_lon": subsolar_lon,
        "timestamp": now.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_assessment() {
        assert_eq!(assess_band_conditions(Some(160.0), Some(2.0)), "excellent");
        assert_eq!(assess_band_conditions(Some(120.0), Some(3.0)), "good");
        assert_eq!(assess_band_conditions(Some(80.0), Some(2.0)), "fair");
        assert_eq!(assess_band_conditions(Some(60.0), Some(1.0)), "poor");
        assert_eq!(assess_band_conditions(Some(200.0), Some(7.5)), "poor");
        assert_eq!(assess_band_conditions(Some(200.0), Some(5.5)), "fair");
        assert_eq!(assess_band_conditions(None, Some(3.0)), "unknown");
    }

    #[test]
    fn test_solar_terminator_in_range() {
        let term = solar_terminator();
        let lat = term["subsolar_lat"].as_f64().unwrap();
        let lon = term["subsolar_lon"].as_f64().unwrap();
        assert!((-23.45..=23.45).contains(&lat));
        assert!((-180.0..=180.0).contains(&lon));
    }

    #[test]
    fn test_hamclock_data_when_never_fetched() {
        let collector = HamClockCollector::new("localhost", 8080, 3000);
        assert_eq!(collector.hamclock_data()["available"], false);
        assert!(collector.detected_variant().is_none());
    }
}
