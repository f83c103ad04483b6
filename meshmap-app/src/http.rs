//! HTTP API server.
//!
//! Serves the map page and the full `/api` surface from a router built once
//! at startup. Uniform response policy: security headers on everything, CSP
//! on HTML, JSON errors (never empty bodies), CORS only when explicitly
//! configured, and an optional pre-shared key checked with a timing-safe
//! comparison on every `/api/*` request.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use meshmap_core::aggregator::Aggregator;
use meshmap_core::alerts::AlertEngine;
use meshmap_core::analytics::HistoricalAnalytics;
use meshmap_core::config::{self, MapsConfig};
use meshmap_core::drift::ConfigDriftDetector;
use meshmap_core::geo::validate_node_id;
use meshmap_core::health::NodeHealthScorer;
use meshmap_core::history::NodeHistoryDb;
use meshmap_core::lifecycle::Lifecycle;
use meshmap_core::node_state::NodeStateTracker;

use crate::ws::WsBroadcaster;

/// Adjacent ports tried when the configured port is taken.
const PORT_FALLBACK_RANGE: u16 = 5;

const CSP: &str = "default-src 'self'; script-src 'self' https://unpkg.com; \
    style-src 'self' 'unsafe-inline' https://unpkg.com; \
    img-src 'self' data: https:; connect-src 'self' ws: wss:";

pub struct AppState {
    pub config: MapsConfig,
    pub aggregator: Arc<Aggregator>,
    pub history: Option<Arc<NodeHistoryDb>>,
    pub states: Arc<NodeStateTracker>,
    pub drift: Arc<ConfigDriftDetector>,
    pub health: Arc<NodeHealthScorer>,
    pub alerts: Arc<AlertEngine>,
    pub analytics: Arc<HistoricalAnalytics>,
    pub ws: Option<Arc<WsBroadcaster>>,
    pub lifecycle: Arc<Lifecycle>,
    pub start_time: f64,
}

type SharedState = Arc<AppState>;

/// Build the full route table. Static; never rebuilt per request.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(map_page))
        .route("/api/nodes/geojson", get(nodes_geojson))
        .route("/api/nodes/:id", get(source_geojson))
        .route("/api/nodes/:id/trajectory", get(node_trajectory))
        .route("/api/nodes/:id/history", get(node_history))
        .route("/api/nodes/:id/health", get(node_health))
        .route("/api/topology", get(topology))
        .route("/api/topology/geojson", get(topology_geojson))
        .route("/api/overlay", get(overlay))
        .route("/api/hamclock", get(hamclock))
        .route("/api/weather-alerts", get(weather_alerts))
        .route("/api/node-health", get(all_node_health))
        .route("/api/node-health/summary", get(node_health_summary))
        .route("/api/health", get(system_health))
        .route("/api/status", get(status))
        .route("/api/perf", get(perf))
        .route("/api/node-states", get(node_states))
        .route("/api/node-states/summary", get(node_states_summary))
        .route("/api/config-drift", get(config_drift))
        .route("/api/config-drift/summary", get(config_drift_summary))
        .route("/api/mqtt/stats", get(mqtt_stats))
        .route("/api/alerts", get(alerts_history))
        .route("/api/alerts/active", get(alerts_active))
        .route("/api/alerts/rules", get(alerts_rules))
        .route("/api/alerts/summary", get(alerts_summary))
        .route("/api/alerts/:id/acknowledge", post(alerts_acknowledge))
        .route("/api/analytics/growth", get(analytics_growth))
        .route("/api/analytics/activity", get(analytics_activity))
        .route("/api/analytics/ranking", get(analytics_ranking))
        .route("/api/analytics/summary", get(analytics_summary))
        .route("/api/analytics/alert-trends", get(analytics_alert_trends))
        .route("/api/config", get(config_view))
        .route("/api/tile-providers", get(tile_providers))
        .route("/api/sources", get(sources))
        .route("/api/export/nodes", get(export_nodes))
        .route("/api/export/alerts", get(export_alerts))
        .route("/api/export/analytics/:kind", get(export_analytics))
        .route("/api/history/nodes", get(tracked_nodes))
        .route("/api/snapshot/:ts", get(snapshot))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn_with_state(state.clone(), security_headers))
        .with_state(state)
}

/// Bind with port fallback and serve until shutdown. Returns the bound port.
pub async fn serve(
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<u16> {
    let host = state.config.http_host.clone();
    let base_port = state.config.http_port;

    let mut bound = None;
    for offset in 0..PORT_FALLBACK_RANGE {
        let Some(port) = base_port.checked_add(offset) else {
            break;
        };
        match tokio::net::TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => {
                if offset > 0 {
                    warn!(wanted = base_port, bound = port, "HTTP port busy, using fallback");
                }
                bound = Some((listener, port));
                break;
            }
            Err(e) => {
                warn!(port, error = %e, "HTTP port unavailable");
            }
        }
    }
    let Some((listener, port)) = bound else {
        anyhow::bail!(
            "failed to bind HTTP server on ports {}-{}",
            base_port,
            base_port.saturating_add(PORT_FALLBACK_RANGE - 1)
        );
    };

    info!(host = %host, port, "HTTP server listening");
    let app = router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "HTTP server exited with error");
        }
    });
    Ok(port)
}

// ── Middleware ───────────────────────────────────────────────────────────────

async fn security_headers(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::SERVER, HeaderValue::from_static(meshmap_core::SERVER_IDENT));

    let is_html = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false);
    if is_html {
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CSP),
        );
    }

    if let Some(ref origin) = state.config.cors_allowed_origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    response
}

async fn require_api_key(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(ref key) = state.config.api_key {
        if request.uri().path().starts_with("/api/") {
            let presented = request
                .headers()
                .get("X-MeshForge-Key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !timing_safe_eq(presented.as_bytes(), key.as_bytes()) {
                // One answer for missing and wrong keys alike.
                return json_response(StatusCode::UNAUTHORIZED, json!({"error": "Unauthorized"}));
            }
        }
    }
    next.run(request).await
}

/// Constant-time byte comparison; runtime depends only on input lengths.
fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = *a.get(i).unwrap_or(&0);
        let y = *b.get(i).unwrap_or(&0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

// ── Response helpers ─────────────────────────────────────────────────────────

fn json_response(status: StatusCode, value: Value) -> Response {
    (status, axum::Json(value)).into_response()
}

fn ok_json(value: Value) -> Response {
    json_response(StatusCode::OK, value)
}

fn bad_request(message: &str) -> Response {
    json_response(StatusCode::BAD_REQUEST, json!({"error": message}))
}

fn not_found_json(message: &str) -> Response {
    json_response(StatusCode::NOT_FOUND, json!({"error": message}))
}

async fn not_found() -> Response {
    not_found_json("Not found")
}

fn csv_response(filename: &str, body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response()
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn to_csv(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut out = headers.join(",");
    out.push('\n');
    for row in rows {
        let escaped: Vec<String> = row.iter().map(|f| csv_escape(f)).collect();
        out.push_str(&escaped.join(","));
        out.push('\n');
    }
    out
}

type QueryMap = HashMap<String, String>;

/// Tolerant numeric query parameter; empty treated as absent, malformed is a
/// 400.
fn q_i64(query: &QueryMap, key: &str) -> Result<Option<i64>, Response> {
    match query.get(key).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| bad_request(&format!("Invalid {key} parameter"))),
    }
}

fn q_limit(query: &QueryMap, default: u32) -> Result<u32, Response> {
    let limit = q_i64(query, "limit")?.unwrap_or(default as i64);
    Ok(limit.clamp(1, 10_000) as u32)
}

fn valid_path_id(id: &str) -> Result<String, Response> {
    validate_node_id(id).map_err(|_| bad_request("Invalid node ID format"))
}

/// Match a path/feature id against a canonical node id, tolerating the `!`
/// prefix and case differences.
fn id_matches(feature_id: &str, canonical: &str) -> bool {
    validate_node_id(feature_id)
        .map(|c| c == canonical)
        .unwrap_or(false)
}

// ── Page ─────────────────────────────────────────────────────────────────────

async fn map_page() -> Response {
    Html(MAP_HTML).into_response()
}

// ── Node data ────────────────────────────────────────────────────────────────

async fn nodes_geojson(State(state): State<SharedState>) -> Response {
    let data = state.aggregator.geojson().await;
    match serde_json::to_value(&data) {
        Ok(value) => ok_json(value),
        Err(_) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "serialization error"}),
        ),
    }
}

async fn source_geojson(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    if !["meshtastic", "reticulum", "aredn"].contains(&id.as_str()) {
        return not_found_json("Unknown source");
    }
    let data = state.aggregator.collect_source(&id).await;
    ok_json(serde_json::to_value(&data).unwrap_or_else(|_| json!({})))
}

async fn node_trajectory(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<QueryMap>,
) -> Response {
    let node_id = match valid_path_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Some(ref history) = state.history else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "Node history not available"}),
        );
    };
    let (since, until) = match (q_i64(&query, "since"), q_i64(&query, "until")) {
        (Ok(since), Ok(until)) => (since, until),
        (Err(response), _) | (_, Err(response)) => return response,
    };
    // History rows are keyed by the id as observed; try both spellings.
    for candidate in [format!("!{node_id}"), node_id.clone()] {
        match history.trajectory_geojson(&candidate, since, until) {
            Ok(doc) if !doc["features"].as_array().map(Vec::is_empty).unwrap_or(true) => {
                return ok_json(doc)
            }
            Ok(_) => continue,
            Err(_) => return internal_error(),
        }
    }
    ok_json(json!({"type": "FeatureCollection", "features": []}))
}

async fn node_history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<QueryMap>,
) -> Response {
    let node_id = match valid_path_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Some(ref history) = state.history else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "Node history not available"}),
        );
    };
    let since = match q_i64(&query, "since") {
        Ok(since) => since,
        Err(response) => return response,
    };
    let limit = match q_limit(&query, 100) {
        Ok(limit) => limit,
        Err(response) => return response,
    };

    for candidate in [format!("!{node_id}"), node_id.clone()] {
        match history.node_history(&candidate, since, limit) {
            Ok(observations) if !observations.is_empty() => {
                return ok_json(json!({
                    "node_id": candidate,
                    "observations": observations,
                    "count": observations.len(),
                }))
            }
            Ok(_) => continue,
            Err(_) => return internal_error(),
        }
    }
    ok_json(json!({"node_id": node_id, "observations": [], "count": 0}))
}

async fn node_health(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    let node_id = match valid_path_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    for candidate in [format!("!{node_id}"), node_id.clone()] {
        if let Some(cached) = state.health.cached_score(&candidate) {
            return ok_json(cached);
        }
    }

    // Not cached: score on demand from the current snapshot.
    let snapshot = state.aggregator.geojson().await;
    for feature in &snapshot.features {
        if !id_matches(&feature.properties.id, &node_id) {
            continue;
        }
        let connectivity = state.states.state_of(&feature.properties.id);
        return match state
            .health
            .score_node(&feature.properties.id, &feature.properties, connectivity, None)
        {
            Some(score) => ok_json(score.to_json()),
            None => ok_json(json!({
                "node_id": feature.properties.id,
                "score": Value::Null,
                "status": "unknown",
            })),
        };
    }
    not_found_json("Node not found")
}

async fn snapshot(State(state): State<SharedState>, Path(ts): Path<String>) -> Response {
    let Ok(timestamp) = ts.parse::<i64>() else {
        return bad_request("Invalid timestamp");
    };
    let Some(ref history) = state.history else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "Node history not available"}),
        );
    };
    match history.snapshot(timestamp) {
        Ok(doc) => ok_json(doc),
        Err(_) => internal_error(),
    }
}

async fn tracked_nodes(State(state): State<SharedState>) -> Response {
    let Some(ref history) = state.history else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "Node history not available"}),
        );
    };
    match history.tracked_nodes() {
        Ok(nodes) => ok_json(json!({
            "nodes": nodes,
            "total_nodes": nodes.len(),
            "total_observations": history.observation_count(),
        })),
        Err(_) => internal_error(),
    }
}

fn internal_error() -> Response {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "Internal server error"}),
    )
}

// ── Topology and overlays ────────────────────────────────────────────────────

async fn topology(State(state): State<SharedState>) -> Response {
    let links = state.aggregator.topology_links();
    ok_json(json!({
        "links": links,
        "link_count": links.len(),
    }))
}

async fn topology_geojson(State(state): State<SharedState>) -> Response {
    ok_json(serde_json::to_value(state.aggregator.topology_geojson()).unwrap_or_else(|_| json!({})))
}

async fn overlay(State(state): State<SharedState>) -> Response {
    ok_json(Value::Object(state.aggregator.overlay().await))
}

async fn hamclock(State(state): State<SharedState>) -> Response {
    ok_json(state.aggregator.hamclock_data())
}

async fn weather_alerts(State(state): State<SharedState>) -> Response {
    let data = state.aggregator.weather_alerts().await;
    ok_json(serde_json::to_value(&data).unwrap_or_else(|_| json!({})))
}

// ── Health scoring ───────────────────────────────────────────────────────────

async fn all_node_health(State(state): State<SharedState>) -> Response {
    let snapshot = state.aggregator.geojson().await;
    let mut nodes = Vec::new();
    for feature in &snapshot.features {
        let node_id = &feature.properties.id;
        if node_id.is_empty() {
            continue;
        }
        let connectivity = state.states.state_of(node_id);
        if let Some(score) = state
            .health
            .score_node(node_id, &feature.properties, connectivity, None)
        {
            nodes.push(json!({
                "node_id": score.node_id,
                "score": score.score,
                "status": score.status,
            }));
        }
    }
    ok_json(json!({"nodes": nodes, "count": nodes.len()}))
}

async fn node_health_summary(State(state): State<SharedState>) -> Response {
    ok_json(state.health.summary())
}

/// Composite 0-100 system score: data freshness (40), source availability
/// (30), breaker health (30).
async fn system_health(State(state): State<SharedState>) -> Response {
    let cache_ttl = state.config.cache_ttl_seconds();

    let mut freshness = 0.0;
    let data_age = state.aggregator.last_collect_age_seconds();
    if let Some(age) = data_age {
        if age <= cache_ttl {
            freshness = 40.0;
        } else if age <= cache_ttl * 3.0 {
            freshness = 40.0 * (1.0 - (age - cache_ttl) / (cache_ttl * 2.0));
        }
    }

    let counts = state.aggregator.last_collect_counts();
    let enabled = state.aggregator.enabled_collector_count();
    let sources_score = if enabled > 0 {
        let reporting = counts.values().filter(|&&c| c > 0).count();
        30.0 * reporting as f64 / enabled as f64
    } else {
        0.0
    };

    let breakers = state.aggregator.breakers().all_states();
    let breaker_score = if breakers.is_empty() {
        0.0
    } else {
        let closed = breakers
            .values()
            .filter(|s| s.state == meshmap_core::circuit::CircuitState::Closed)
            .count();
        30.0 * closed as f64 / breakers.len() as f64
    };

    let score = (freshness + sources_score + breaker_score).clamp(0.0, 100.0) as u32;
    let status = match score {
        80.. => "healthy",
        60..=79 => "fair",
        30..=59 => "degraded",
        _ => "critical",
    };

    ok_json(json!({
        "score": score,
        "status": status,
        "components": {
            "freshness": {"score": (freshness * 10.0).round() / 10.0, "max": 40},
            "sources": {"score": (sources_score * 10.0).round() / 10.0, "max": 30},
            "circuit_breakers": {"score": (breaker_score * 10.0).round() / 10.0, "max": 30},
        },
        "data_age_seconds": data_age.map(|a| a as u64),
        "sources_reporting": counts,
    }))
}

// ── Status and diagnostics ───────────────────────────────────────────────────

async fn status(State(state): State<SharedState>) -> Response {
    let uptime = (meshmap_core_now() - state.start_time) as u64;
    let data_age = state.aggregator.last_collect_age_seconds();
    let cache_ttl = state.config.cache_ttl_seconds();
    let data_stale = data_age.map(|age| age > cache_ttl * 2.0).unwrap_or(false);

    let mut body = json!({
        "status": "ok",
        "server": meshmap_core::SERVER_IDENT,
        "lifecycle": state.lifecycle.info(),
        "sources": state.config.enabled_sources(),
        "source_counts": state.aggregator.last_collect_counts(),
        "source_health": state.aggregator.source_health(),
        "uptime_seconds": uptime,
        "data_age_seconds": data_age.map(|a| a as u64),
        "data_stale": data_stale,
        "circuit_breakers": state.aggregator.breaker_states(),
        "event_bus": state.aggregator.bus().stats(),
    });

    if let Some(broker) = state.aggregator.broker() {
        body["mqtt"] = broker.stats();
    }
    // The ws block is absent entirely when the broadcaster never started;
    // polling clients lose nothing.
    if let Some(ref ws) = state.ws {
        body["websocket"] = ws.stats();
    }
    ok_json(body)
}

fn meshmap_core_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn perf(State(state): State<SharedState>) -> Response {
    ok_json(state.aggregator.perf().stats())
}

async fn mqtt_stats(State(state): State<SharedState>) -> Response {
    match state.aggregator.broker() {
        Some(broker) => ok_json(broker.stats()),
        None => ok_json(json!({"available": false, "status": "not_configured"})),
    }
}

// ── Connectivity states and drift ────────────────────────────────────────────

async fn node_states(State(state): State<SharedState>) -> Response {
    ok_json(json!({
        "states": state.states.all_states(),
        "summary": state.states.summary(),
    }))
}

async fn node_states_summary(State(state): State<SharedState>) -> Response {
    ok_json(state.states.summary())
}

async fn config_drift(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let since = match q_i64(&query, "since") {
        Ok(since) => since.map(|v| v as f64),
        Err(response) => return response,
    };
    let severity = query.get("severity").map(String::as_str);
    if let Some(severity) = severity {
        if !["info", "warning", "critical"].contains(&severity) {
            return bad_request("Invalid severity parameter");
        }
    }
    let drifts = state.drift.all_drifts(since, severity);
    ok_json(json!({
        "drifts": drifts,
        "count": drifts.len(),
    }))
}

async fn config_drift_summary(State(state): State<SharedState>) -> Response {
    ok_json(state.drift.summary())
}

// ── Alerts ───────────────────────────────────────────────────────────────────

async fn alerts_history(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let limit = match q_limit(&query, 50) {
        Ok(limit) => limit,
        Err(response) => return response,
    };
    let severity = query.get("severity").map(String::as_str);
    let node_id = query.get("node_id").map(String::as_str);
    if let Some(node_id) = node_id {
        if validate_node_id(node_id).is_err() {
            return bad_request("Invalid node_id parameter");
        }
    }
    let alerts = state
        .alerts
        .alert_history(limit as usize, severity, node_id);
    ok_json(json!({"alerts": alerts, "count": alerts.len()}))
}

async fn alerts_active(State(state): State<SharedState>) -> Response {
    let alerts = state.alerts.active_alerts();
    ok_json(json!({"alerts": alerts, "count": alerts.len()}))
}

async fn alerts_rules(State(state): State<SharedState>) -> Response {
    ok_json(json!({"rules": state.alerts.list_rules()}))
}

async fn alerts_summary(State(state): State<SharedState>) -> Response {
    let mut summary = state.alerts.summary();
    if let Some(broker) = state.aggregator.broker() {
        summary["mqtt"] = broker.stats();
    }
    ok_json(summary)
}

async fn alerts_acknowledge(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    if state.alerts.acknowledge(&id) {
        ok_json(json!({"acknowledged": id}))
    } else {
        not_found_json("Unknown alert id")
    }
}

// ── Analytics ────────────────────────────────────────────────────────────────

async fn analytics_growth(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let (since, until, bucket) = match (
        q_i64(&query, "since"),
        q_i64(&query, "until"),
        q_i64(&query, "bucket"),
    ) {
        (Ok(s), Ok(u), Ok(b)) => (s, u, b),
        (Err(r), _, _) | (_, Err(r), _) | (_, _, Err(r)) => return r,
    };
    ok_json(state.analytics.network_growth(
        since,
        until,
        bucket.unwrap_or(meshmap_core::analytics::DEFAULT_BUCKET_SECONDS),
    ))
}

async fn analytics_activity(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let (since, until) = match (q_i64(&query, "since"), q_i64(&query, "until")) {
        (Ok(s), Ok(u)) => (s, u),
        (Err(r), _) | (_, Err(r)) => return r,
    };
    ok_json(state.analytics.activity_heatmap(since, until))
}

async fn analytics_ranking(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let since = match q_i64(&query, "since") {
        Ok(since) => since,
        Err(response) => return response,
    };
    let limit = match q_limit(&query, 50) {
        Ok(limit) => limit,
        Err(response) => return response,
    };
    ok_json(state.analytics.node_activity_ranking(since, limit))
}

async fn analytics_summary(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let since = match q_i64(&query, "since") {
        Ok(since) => since,
        Err(response) => return response,
    };
    ok_json(state.analytics.network_summary(since))
}

async fn analytics_alert_trends(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let bucket = match q_i64(&query, "bucket") {
        Ok(bucket) => bucket.unwrap_or(meshmap_core::analytics::DEFAULT_BUCKET_SECONDS),
        Err(response) => return response,
    };
    ok_json(state.analytics.alert_trends(bucket, 200))
}

// ── Config and metadata ──────────────────────────────────────────────────────

async fn config_view(State(state): State<SharedState>) -> Response {
    let mut view = state.config.redacted();
    if let Some(ref ws) = state.ws {
        view["ws_port"] = json!(ws.port());
    }
    ok_json(view)
}

async fn tile_providers() -> Response {
    ok_json(config::tile_providers())
}

async fn sources(State(state): State<SharedState>) -> Response {
    ok_json(json!({
        "sources": state.config.enabled_sources(),
        "network_colors": config::network_colors(),
    }))
}

// ── Exports ──────────────────────────────────────────────────────────────────

async fn export_nodes(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let snapshot = state.aggregator.geojson().await;
    match query.get("format").map(String::as_str).unwrap_or("csv") {
        "json" => ok_json(serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({}))),
        "csv" => {
            let rows: Vec<Vec<String>> = snapshot
                .features
                .iter()
                .map(|feature| {
                    let (lat, lon) = feature
                        .geometry
                        .as_ref()
                        .and_then(|g| g.lat_lon())
                        .unwrap_or((f64::NAN, f64::NAN));
                    let p = &feature.properties;
                    vec![
                        p.id.clone(),
                        p.name.clone().unwrap_or_default(),
                        p.network.clone().unwrap_or_default(),
                        format!("{lat}"),
                        format!("{lon}"),
                        p.battery.map(|v| v.to_string()).unwrap_or_default(),
                        p.snr.map(|v| v.to_string()).unwrap_or_default(),
                        p.last_seen.map(|v| v.to_string()).unwrap_or_default(),
                    ]
                })
                .collect();
            csv_response(
                "nodes.csv",
                to_csv(
                    &["id", "name", "network", "lat", "lon", "battery", "snr", "last_seen"],
                    rows,
                ),
            )
        }
        _ => bad_request("Invalid format parameter"),
    }
}

async fn export_alerts(
    State(state): State<SharedState>,
    Query(query): Query<QueryMap>,
) -> Response {
    let alerts = state.alerts.alert_history(10_000, None, None);
    match query.get("format").map(String::as_str).unwrap_or("csv") {
        "json" => ok_json(json!({"alerts": alerts})),
        "csv" => {
            let rows: Vec<Vec<String>> = alerts
                .iter()
                .map(|a| {
                    vec![
                        a.alert_id.clone(),
                        a.rule_id.clone(),
                        a.severity.as_str().to_string(),
                        a.node_id.clone(),
                        a.metric.clone(),
                        a.value.to_string(),
                        a.threshold.to_string(),
                        format!("{}", a.timestamp as i64),
                        a.acknowledged.to_string(),
                        a.message.clone(),
                    ]
                })
                .collect();
            csv_response(
                "alerts.csv",
                to_csv(
                    &[
                        "alert_id", "rule_id", "severity", "node_id", "metric", "value",
                        "threshold", "timestamp", "acknowledged", "message",
                    ],
                    rows,
                ),
            )
        }
        _ => bad_request("Invalid format parameter"),
    }
}

async fn export_analytics(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
) -> Response {
    match kind.as_str() {
        "growth" => {
            let growth = state.analytics.network_growth(None, None, 3600);
            let rows: Vec<Vec<String>> = growth["buckets"]
                .as_array()
                .map(|buckets| {
                    buckets
                        .iter()
                        .map(|b| {
                            vec![
                                b["timestamp"].to_string(),
                                b["unique_nodes"].to_string(),
                                b["observations"].to_string(),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            csv_response(
                "analytics_growth.csv",
                to_csv(&["timestamp", "unique_nodes", "observations"], rows),
            )
        }
        "activity" => {
            let heatmap = state.analytics.activity_heatmap(None, None);
            let rows: Vec<Vec<String>> = heatmap["hours"]
                .as_array()
                .map(|hours| {
                    hours
                        .iter()
                        .enumerate()
                        .map(|(hour, count)| vec![hour.to_string(), count.to_string()])
                        .collect()
                })
                .unwrap_or_default();
            csv_response(
                "analytics_activity.csv",
                to_csv(&["hour", "observations"], rows),
            )
        }
        "ranking" => {
            let ranking = state.analytics.node_activity_ranking(None, 1000);
            let rows: Vec<Vec<String>> = ranking["nodes"]
                .as_array()
                .map(|nodes| {
                    nodes
                        .iter()
                        .map(|n| {
                            vec![
                                n["node_id"].as_str().unwrap_or_default().to_string(),
                                n["observation_count"].to_string(),
                                n["network"].as_str().unwrap_or_default().to_string(),
                                n["first_seen"].to_string(),
                                n["last_seen"].to_string(),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            csv_response(
                "analytics_ranking.csv",
                to_csv(
                    &["node_id", "observation_count", "network", "first_seen", "last_seen"],
                    rows,
                ),
            )
        }
        _ => not_found_json("Unknown analytics export"),
    }
}

// ── Embedded map page ────────────────────────────────────────────────────────

const MAP_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>MeshForge Maps</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<style>
  html, body, #map { height: 100%; margin: 0; background: #0a0e17; }
  .hud { position: absolute; top: 10px; right: 10px; z-index: 1000;
         background: rgba(17, 24, 39, 0.9); color: #e5e7eb; border: 1px solid #1f2937;
         border-radius: 8px; padding: 10px 14px; font-family: monospace; font-size: 13px; }
  .hud b { color: #3b82f6; }
</style>
</head>
<body>
<div id="map"></div>
<div class="hud">MeshForge Maps — <b id="count">0</b> nodes · <span id="ws">polling</span></div>
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<script>
const map = L.map('map').setView([20.0, -100.0], 4);
L.tileLayer('https://{s}.basemaps.cartocdn.com/dark_all/{z}/{x}/{y}.png', {
  maxZoom: 20, attribution: '&copy; OSM &copy; CARTO'
}).addTo(map);
const layer = L.geoJSON(null, {
  pointToLayer: (f, latlng) => L.circleMarker(latlng, { radius: 5, weight: 1 }),
  onEachFeature: (f, l) => l.bindPopup(`<b>${f.properties.name || f.properties.id}</b><br>${f.properties.network || ''}`)
}).addTo(map);

async function refresh() {
  try {
    const data = await fetch('/api/nodes/geojson').then(r => r.json());
    layer.clearLayers();
    layer.addData(data);
    document.getElementById('count').textContent = (data.features || []).length;
  } catch (e) { console.error('refresh failed', e); }
}

async function connectWs() {
  try {
    const cfg = await fetch('/api/config').then(r => r.json());
    if (!cfg.ws_port) return;
    const ws = new WebSocket(`ws://${location.hostname}:${cfg.ws_port}`);
    ws.onopen = () => { document.getElementById('ws').textContent = 'live'; };
    ws.onclose = () => { document.getElementById('ws').textContent = 'polling'; };
    ws.onmessage = (msg) => {
      const frame = JSON.parse(msg.data);
      if (frame.type === 'node.position' || frame.type === 'service') refresh();
    };
  } catch (e) { /* poll-only fallback */ }
}

refresh();
connectWs();
setInterval(refresh, 60000);
</script>
</body>
</html>"#;
