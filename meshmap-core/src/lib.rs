//! # MeshMap Core — Multi-source mesh observability data plane
//!
//! Library backing the MeshForge Maps server. Ingests node telemetry from
//! four mesh ecosystems (Meshtastic over MQTT, Reticulum, AREDN, HamClock
//! propagation), merges them into a unified geospatial model, and layers
//! operations on top: health scoring, connectivity state tracking, config
//! drift detection, threshold alerting, and position history.
//!
//! Data flow at steady state:
//!
//! ```text
//! upstream ─► collector.fetch ─► CollectorHandle.collect (cache+breaker+retry)
//!                                       │
//!                                       ▼
//!               Aggregator.collect_all ─► dedup ─► unified FeatureCollection
//!                                       │
//!                                       ▼
//!                                   EventBus
//!                     ┌───────┬───────┬───────┬────────┐
//!                     ▼       ▼       ▼       ▼        ▼
//!                 history   state   drift   alerts   ws fan-out
//! ```

pub mod aggregator;
pub mod alerts;
pub mod analytics;
pub mod broker;
pub mod circuit;
pub mod collect;
pub mod collectors;
pub mod config;
pub mod drift;
pub mod error;
pub mod event_bus;
pub mod geo;
pub mod hamclock_compat;
pub mod health;
pub mod history;
pub mod lease;
pub mod lifecycle;
pub mod node_state;
pub mod paths;
pub mod perf;
pub mod reconnect;
pub mod store;
pub mod topology;

pub use config::MapsConfig;
pub use error::{MapsError, MapsResult};
pub use geo::{validate_coordinates, validate_node_id, Feature, FeatureCollection};

/// Server identity advertised in the HTTP `Server` header. Deliberately free
/// of the runtime version so upgrades are not fingerprintable.
pub const SERVER_IDENT: &str = "MeshForge-Maps/1.0";

/// Epoch seconds as f64, the time unit used across the data plane.
pub(crate) fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Epoch seconds as i64, for database rows and `last_seen` fields.
pub(crate) fn now_epoch() -> i64 {
    now_ts() as i64
}
