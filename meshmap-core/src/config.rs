//! Settings management.
//!
//! Settings persist as JSON under the plugin settings directory and are
//! written with owner-only permissions since they may carry broker
//! credentials and the API key. Unknown keys in a saved file are ignored;
//! the `/api/config` view redacts secrets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{MapsError, MapsResult};

pub const DEFAULT_HTTP_PORT: u16 = 8808;
pub const DEFAULT_WS_PORT: u16 = 8809;

/// Network display colors, keyed by source tag.
pub fn network_colors() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("meshtastic", "#66bb6a"),
        ("reticulum", "#ab47bc"),
        ("aredn", "#ff7043"),
        ("hamclock", "#42a5f5"),
    ])
}

/// Leaflet tile provider definitions served to the frontend.
pub fn tile_providers() -> Value {
    json!({
        "carto_dark": {
            "name": "CartoDB Dark Matter",
            "url": "https://{s}.basemaps.cartocdn.com/dark_all/{z}/{x}/{y}{r}.png",
            "attribution": "&copy; <a href=\"https://www.openstreetmap.org/copyright\">OSM</a> &copy; <a href=\"https://carto.com/\">CARTO</a>",
            "max_zoom": "20"
        },
        "osm_standard": {
            "name": "OpenStreetMap",
            "url": "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
            "attribution": "&copy; <a href=\"https://www.openstreetmap.org/copyright\">OpenStreetMap</a> contributors",
            "max_zoom": "19"
        },
        "osm_topo": {
            "name": "OpenTopoMap",
            "url": "https://tile.opentopomap.org/{z}/{x}/{y}.png",
            "attribution": "&copy; <a href=\"https://opentopomap.org\">OpenTopoMap</a> (<a href=\"https://creativecommons.org/licenses/by-sa/3.0/\">CC-BY-SA</a>)",
            "max_zoom": "17"
        },
        "esri_satellite": {
            "name": "Esri Satellite",
            "url": "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}",
            "attribution": "&copy; Esri &mdash; Source: Esri, Maxar, Earthstar Geographics",
            "max_zoom": "19"
        },
        "esri_topo": {
            "name": "Esri Topographic",
            "url": "https://server.arcgisonline.com/ArcGIS/rest/services/World_Topo_Map/MapServer/tile/{z}/{y}/{x}",
            "attribution": "&copy; Esri &mdash; Sources: Esri, HERE, Garmin, USGS, NGA",
            "max_zoom": "19"
        },
        "stadia_terrain": {
            "name": "Stadia Stamen Terrain",
            "url": "https://tiles.stadiamaps.com/tiles/stamen_terrain/{z}/{x}/{y}.png",
            "attribution": "&copy; <a href=\"https://stadiamaps.com/\">Stadia Maps</a> &copy; <a href=\"https://stamen.com\">Stamen Design</a>",
            "max_zoom": "18"
        }
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapsConfig {
    pub default_tile_provider: String,
    pub enable_meshtastic: bool,
    pub enable_reticulum: bool,
    pub enable_hamclock: bool,
    pub enable_aredn: bool,
    pub enable_noaa_alerts: bool,
    pub hamclock_host: String,
    pub hamclock_port: u16,
    pub openhamclock_port: u16,
    pub meshtasticd_host: String,
    pub meshtasticd_port: u16,
    pub aredn_nodes: Vec<String>,
    pub noaa_alerts_area: Option<String>,
    pub noaa_alerts_severity: Option<Vec<String>>,
    pub map_center_lat: f64,
    pub map_center_lon: f64,
    pub map_default_zoom: u8,
    pub cache_ttl_minutes: u64,
    pub http_host: String,
    pub http_port: u16,
    pub ws_port: u16,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_tls: Option<bool>,
    /// Base topic for alert publication; severity sub-topics hang off it.
    pub alert_mqtt_topic: Option<String>,
    pub alert_webhook_url: Option<String>,
    /// Pre-shared key required on every `/api/*` request when set.
    pub api_key: Option<String>,
    /// CORS is opt-in; no wildcard default.
    pub cors_allowed_origin: Option<String>,
    pub history_retention_days: u32,
    pub history_throttle_seconds: u32,
}

impl Default for MapsConfig {
    fn default() -> Self {
        Self {
            default_tile_provider: "carto_dark".into(),
            enable_meshtastic: true,
            enable_reticulum: true,
            enable_hamclock: true,
            enable_aredn: true,
            enable_noaa_alerts: true,
            hamclock_host: "localhost".into(),
            hamclock_port: 8080,
            openhamclock_port: 3000,
            meshtasticd_host: "localhost".into(),
            meshtasticd_port: 4403,
            aredn_nodes: Vec::new(),
            noaa_alerts_area: None,
            noaa_alerts_severity: None,
            map_center_lat: 20.0,
            map_center_lon: -100.0,
            map_default_zoom: 4,
            cache_ttl_minutes: 15,
            http_host: "127.0.0.1".into(),
            http_port: DEFAULT_HTTP_PORT,
            ws_port: DEFAULT_WS_PORT,
            mqtt_broker: "mqtt.meshtastic.org".into(),
            mqtt_port: 1883,
            mqtt_topic: "msh/#".into(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_tls: None,
            alert_mqtt_topic: None,
            alert_webhook_url: None,
            api_key: None,
            cors_allowed_origin: None,
            history_retention_days: 30,
            history_throttle_seconds: 60,
        }
    }
}

impl MapsConfig {
    /// Default on-disk location.
    pub fn default_path() -> PathBuf {
        crate::paths::config_dir()
            .join("plugins")
            .join("org.meshforge.extension.maps")
            .join("settings.json")
    }

    /// Load settings, falling back to defaults when the file is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => {
                    info!(path = %path.display(), "settings loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no settings file, using defaults");
                Self::default()
            }
        }
    }

    /// Persist settings with mode 0600.
    pub fn save(&self, path: &Path) -> MapsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(MapsError::Io)?;
        }
        info!(path = %path.display(), "settings saved");
        Ok(())
    }

    pub fn enabled_sources(&self) -> Vec<&'static str> {
        let mut sources = Vec::new();
        if self.enable_meshtastic {
            sources.push("meshtastic");
        }
        if self.enable_reticulum {
            sources.push("reticulum");
        }
        if self.enable_hamclock {
            sources.push("hamclock");
        }
        if self.enable_aredn {
            sources.push("aredn");
        }
        sources
    }

    pub fn cache_ttl_seconds(&self) -> f64 {
        self.cache_ttl_minutes as f64 * 60.0
    }

    /// Config view for `/api/config`: secrets removed, display metadata
    /// attached.
    pub fn redacted(&self) -> Value {
        let mut view = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(obj) = view.as_object_mut() {
            obj.remove("mqtt_password");
            obj.remove("api_key");
            obj.insert(
                "network_colors".into(),
                serde_json::to_value(network_colors()).unwrap_or(Value::Null),
            );
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut config = MapsConfig::default();
        config.http_port = 9900;
        config.api_key = Some("secret".into());
        config.save(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = MapsConfig::load(&path);
        assert_eq!(loaded.http_port, 9900);
        assert_eq!(loaded.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = MapsConfig::load(Path::new("/nonexistent/settings.json"));
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert!(config.enable_meshtastic);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"http_port": 8810, "long_gone_option": true}"#).unwrap();
        let config = MapsConfig::load(&path);
        assert_eq!(config.http_port, 8810);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = MapsConfig::default();
        config.api_key = Some("hunter2".into());
        config.mqtt_password = Some("pass".into());
        let view = config.redacted();
        assert!(view.get("api_key").is_none());
        assert!(view.get("mqtt_password").is_none());
        assert!(view.get("network_colors").is_some());
        assert_eq!(view["http_port"], 8808);
    }

    #[test]
    fn test_enabled_sources_follow_flags() {
        let mut config = MapsConfig::default();
        config.enable_reticulum = false;
        assert_eq!(
            config.enabled_sources(),
            vec!["meshtastic", "hamclock", "aredn"]
        );
    }
}
