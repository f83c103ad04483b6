//! End-to-end tests for the HTTP surface.
//!
//! Drives the real router through `tower::ServiceExt::oneshot`: security
//! headers, API-key auth, parameter validation, the alert read/acknowledge
//! flow, CSV export, and JSON 404 bodies. Collectors are disabled so no test
//! touches the network.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use meshmap_core::aggregator::Aggregator;
use meshmap_core::alerts::AlertEngine;
use meshmap_core::analytics::HistoricalAnalytics;
use meshmap_core::config::MapsConfig;
use meshmap_core::drift::ConfigDriftDetector;
use meshmap_core::event_bus::EventBus;
use meshmap_core::geo::NodeProperties;
use meshmap_core::health::NodeHealthScorer;
use meshmap_core::history::NodeHistoryDb;
use meshmap_core::lease::LeaseManager;
use meshmap_core::lifecycle::Lifecycle;
use meshmap_core::node_state::NodeStateTracker;
use meshmap_core::store::NodeStore;

// The router module lives in the binary crate; include it directly the way
// the binary does.
#[path = "../src/http.rs"]
mod http;
#[path = "../src/ws.rs"]
mod ws;

struct TestHarness {
    router: axum::Router,
    alerts: Arc<AlertEngine>,
    _history_dir: tempfile::TempDir,
}

fn harness(mutate: impl FnOnce(&mut MapsConfig)) -> TestHarness {
    let mut config = MapsConfig::default();
    // Offline configuration: no upstream collectors, no broker.
    config.enable_meshtastic = false;
    config.enable_reticulum = false;
    config.enable_hamclock = false;
    config.enable_aredn = false;
    config.enable_noaa_alerts = false;
    mutate(&mut config);

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(NodeStore::default());
    let aggregator = Arc::new(Aggregator::new(
        &config,
        bus,
        store,
        Arc::new(LeaseManager::new()),
        shutdown_rx,
    ));

    let history_dir = tempfile::tempdir().unwrap();
    let history = Arc::new(
        NodeHistoryDb::open(&history_dir.path().join("history.db"), 0, 3600 * 24).unwrap(),
    );
    let alerts = Arc::new(AlertEngine::default());
    let analytics = HistoricalAnalytics::new(Some(history.clone()), Some(alerts.clone()));

    let state = Arc::new(http::AppState {
        config,
        aggregator,
        history: Some(history),
        states: Arc::new(NodeStateTracker::default()),
        drift: Arc::new(ConfigDriftDetector::default()),
        health: Arc::new(NodeHealthScorer::default()),
        alerts: alerts.clone(),
        analytics: Arc::new(analytics),
        ws: None,
        lifecycle: Arc::new(Lifecycle::new()),
        start_time: 0.0,
    });

    TestHarness {
        router: http::router(state),
        alerts,
        _history_dir: history_dir,
    }
}

async fn get(router: &axum::Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
    request(router, "GET", uri, &[]).await
}

async fn request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let header_map = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::String(
        String::from_utf8_lossy(&bytes).to_string(),
    ));
    (status, header_map, body)
}

#[tokio::test]
async fn security_headers_on_every_response() {
    let h = harness(|_| {});
    for uri in ["/api/status", "/api/no-such-route", "/"] {
        let (_, headers, _) = get(&h.router, uri).await;
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("server").unwrap(), "MeshForge-Maps/1.0");
    }

    // CSP only on the HTML page.
    let (_, headers, _) = get(&h.router, "/").await;
    assert!(headers.contains_key("content-security-policy"));
    let (_, headers, _) = get(&h.router, "/api/status").await;
    assert!(!headers.contains_key("content-security-policy"));
}

#[tokio::test]
async fn cors_only_when_configured() {
    let h = harness(|_| {});
    let (_, headers, _) = get(&h.router, "/api/status").await;
    assert!(!headers.contains_key("access-control-allow-origin"));

    let h = harness(|c| c.cors_allowed_origin = Some("http://localhost:3000".into()));
    let (_, headers, _) = get(&h.router, "/api/status").await;
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "http://localhost:3000"
    );
}

#[tokio::test]
async fn api_key_enforced_on_api_routes_only() {
    let h = harness(|c| c.api_key = Some("hunter2".into()));

    let (status, _, body) = get(&h.router, "/api/status").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");

    let (status, _, _) = request(
        &h.router,
        "GET",
        "/api/status",
        &[("X-MeshForge-Key", "wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = request(
        &h.router,
        "GET",
        "/api/status",
        &[("X-MeshForge-Key", "hunter2")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The map page itself is not key-gated.
    let (status, _, _) = get(&h.router, "/").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn path_and_query_validation() {
    let h = harness(|_| {});

    let (status, _, body) = get(&h.router, "/api/nodes/not-hex!/trajectory").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid node ID format");

    let (status, _, _) = get(&h.router, "/api/nodes/deadbeef/history?since=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(&h.router, "/api/analytics/growth?bucket=xyz").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(&h.router, "/api/snapshot/not-a-number").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = get(&h.router, "/api/nodes/unknown-source").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Unknown source");
}

#[tokio::test]
async fn fallback_is_json_not_empty() {
    let h = harness(|_| {});
    let (status, headers, body) = get(&h.router, "/api/definitely/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(headers
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    assert_eq!(body["error"], "Not found");
}

#[tokio::test]
async fn alert_flow_read_and_acknowledge() {
    let h = harness(|_| {});
    let mut props = NodeProperties::new("!deadbeef");
    props.network = Some("meshtastic".into());
    props.battery = Some(3.0);
    h.alerts.evaluate_node("!deadbeef", &props, None, Some(0.0));

    let (status, _, body) = get(&h.router, "/api/alerts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2); // battery_low + battery_critical
    let alert_id = body["alerts"][0]["alert_id"].as_str().unwrap().to_string();

    let (status, _, body) = get(&h.router, "/api/alerts?severity=critical").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, _, _) = request(
        &h.router,
        "POST",
        &format!("/api/alerts/{alert_id}/acknowledge"),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, body) = get(&h.router, "/api/alerts/active").await;
    assert_eq!(body["count"], 1); // the other one is still active

    let (status, _, _) = request(&h.router, "POST", "/api/alerts/alert-999/acknowledge", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn alerts_query_rejects_bad_node_id() {
    let h = harness(|_| {});
    let (status, _, _) = get(&h.router, "/api/alerts?node_id=%21%21bad").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn csv_export_headers_and_rows() {
    let h = harness(|_| {});
    let mut props = NodeProperties::new("!deadbeef");
    props.network = Some("meshtastic".into());
    props.battery = Some(3.0);
    h.alerts.evaluate_node("!deadbeef", &props, None, Some(0.0));

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/export/alerts?format=csv")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/csv"
    );
    assert!(response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("attachment"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "alert_id,rule_id,severity,node_id,metric,value,threshold,timestamp,acknowledged,message"
    );
    assert_eq!(lines.count(), 2);
}

#[tokio::test]
async fn export_format_validation() {
    let h = harness(|_| {});
    let (status, _, _) = get(&h.router, "/api/export/alerts?format=xml").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = get(&h.router, "/api/export/analytics/nonsense").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_view_redacts_secrets() {
    let h = harness(|c| {
        c.api_key = None;
        c.mqtt_password = Some("brokerpass".into());
    });
    let (status, _, body) = get(&h.router, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("mqtt_password").is_none());
    assert!(body.get("api_key").is_none());
    assert!(body.get("network_colors").is_some());
}

#[tokio::test]
async fn empty_data_plane_endpoints_answer() {
    let h = harness(|_| {});
    for uri in [
        "/api/nodes/geojson",
        "/api/topology",
        "/api/topology/geojson",
        "/api/node-states",
        "/api/node-states/summary",
        "/api/node-health/summary",
        "/api/config-drift",
        "/api/config-drift/summary",
        "/api/alerts/rules",
        "/api/alerts/summary",
        "/api/analytics/growth",
        "/api/analytics/activity",
        "/api/analytics/ranking",
        "/api/analytics/summary",
        "/api/analytics/alert-trends",
        "/api/history/nodes",
        "/api/perf",
        "/api/health",
        "/api/tile-providers",
        "/api/sources",
        "/api/mqtt/stats",
        "/api/snapshot/1700000000",
    ] {
        let (status, _, _) = get(&h.router, uri).await;
        assert_eq!(status, StatusCode::OK, "endpoint {uri} failed");
    }
}

#[tokio::test]
async fn status_omits_ws_block_without_broadcaster() {
    let h = harness(|_| {});
    let (status, _, body) = get(&h.router, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body.get("websocket").is_none());
    assert!(body["event_bus"]["total_published"].is_number());
}
