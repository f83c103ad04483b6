mod dispatch;
mod http;
mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshmap_core::aggregator::Aggregator;
use meshmap_core::alerts::AlertEngine;
use meshmap_core::analytics::HistoricalAnalytics;
use meshmap_core::config::MapsConfig;
use meshmap_core::drift::ConfigDriftDetector;
use meshmap_core::event_bus::{Event, EventBus, EventType};
use meshmap_core::health::NodeHealthScorer;
use meshmap_core::history::NodeHistoryDb;
use meshmap_core::lease::LeaseManager;
use meshmap_core::lifecycle::{Lifecycle, LifecycleState};
use meshmap_core::node_state::NodeStateTracker;
use meshmap_core::store::NodeStore;

/// Seconds granted to each background task at shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "meshmap", version, about = "MeshForge Maps — multi-source mesh network observability")]
struct Cli {
    /// HTTP bind address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Settings file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the terminal-dashboard connection hint after startup
    #[arg(long)]
    tui: bool,

    /// Serve only the data plane for an external dashboard; quiet stdout
    #[arg(long)]
    tui_only: bool,

    /// Validate configuration and environment, then exit
    #[arg(long)]
    verify: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: tracing subscriber already installed");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("fatal: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(cli)).unwrap_or_else(|e| {
        error!(error = %e, "fatal startup error");
        1
    });
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(MapsConfig::default_path);
    let mut config = MapsConfig::load(&config_path);
    if let Some(host) = cli.host {
        config.http_host = host;
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sources = ?config.enabled_sources(),
        "MeshForge Maps starting"
    );

    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.transition_to(LifecycleState::Activating)?;

    let mut warnings: Vec<String> = Vec::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Core infrastructure, in dependency order ─────────────────────────
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(NodeStore::default());
    let leases = Arc::new(LeaseManager::new());
    let aggregator = Arc::new(Aggregator::new(
        &config,
        bus.clone(),
        store.clone(),
        leases,
        shutdown_rx.clone(),
    ));

    let history = match NodeHistoryDb::open(
        &NodeHistoryDb::default_path(),
        config.history_throttle_seconds as i64,
        config.history_retention_days as i64 * 24 * 3600,
    ) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => {
            warn!(error = %e, "node history unavailable, trajectories disabled");
            warnings.push(format!("node history unavailable: {e}"));
            None
        }
    };

    let states = Arc::new(NodeStateTracker::default());
    let drift = Arc::new(ConfigDriftDetector::default());
    let health = Arc::new(NodeHealthScorer::default());
    let alerts = Arc::new(AlertEngine::default());
    alerts.set_event_bus(bus.clone());
    let analytics = Arc::new(HistoricalAnalytics::new(
        history.clone(),
        Some(alerts.clone()),
    ));

    // Node eviction prunes the dependent trackers in a fixed order.
    {
        let (states, drift, health) = (states.clone(), drift.clone(), health.clone());
        store.set_on_node_removed(Arc::new(move |node_id| {
            states.remove_node(node_id);
            drift.remove_node(node_id);
            health.remove_node(node_id);
        }));
    }

    // ── Event-bus wiring ─────────────────────────────────────────────────
    wire_subscriptions(&bus, &history, &states, &drift, &alerts);

    // ── Alert delivery ───────────────────────────────────────────────────
    let (alert_tx, alert_rx) = tokio::sync::mpsc::unbounded_channel();
    alerts.set_delivery_channel(alert_tx);
    let dispatcher = Arc::new(dispatch::AlertDispatcher::new(&config, shutdown_rx.clone()));
    let dispatcher_task = tokio::spawn(dispatcher.run(alert_rx, shutdown_rx.clone()));

    // ── Verify mode: report and exit before binding anything ─────────────
    if cli.verify {
        shutdown_tx.send(true).ok();
        return Ok(finish_verify(warnings));
    }

    // ── WebSocket broadcaster (optional; HTTP polling stays functional) ──
    let broadcaster = ws::WsBroadcaster::new(ws::DEFAULT_HISTORY_SIZE);
    let ws_port = broadcaster
        .start(&config.http_host, config.ws_port, shutdown_rx.clone())
        .await;
    let ws = match ws_port {
        Some(port) => {
            let forward = broadcaster.clone();
            bus.subscribe(
                None,
                Arc::new(move |event| {
                    forward.broadcast(&ws::event_frame(event));
                }),
            );
            info!(port, "real-time push enabled");
            Some(broadcaster)
        }
        None => {
            warn!("WebSocket broadcaster disabled (no port available)");
            warnings.push("websocket broadcaster disabled".into());
            None
        }
    };

    // ── HTTP server ──────────────────────────────────────────────────────
    let state = Arc::new(http::AppState {
        config: config.clone(),
        aggregator: aggregator.clone(),
        history: history.clone(),
        states: states.clone(),
        drift: drift.clone(),
        health: health.clone(),
        alerts: alerts.clone(),
        analytics,
        ws,
        lifecycle: lifecycle.clone(),
        start_time: now(),
    });
    let http_port = http::serve(state, shutdown_rx.clone()).await?;

    // ── Background loops ─────────────────────────────────────────────────
    let broker_task = aggregator.broker().cloned().map(|broker| {
        tokio::spawn(broker.run(shutdown_rx.clone()))
    });
    let poll_task = tokio::spawn(aggregation_loop(
        aggregator.clone(),
        states.clone(),
        health.clone(),
        alerts.clone(),
        config.cache_ttl_seconds(),
        shutdown_rx.clone(),
    ));
    let sweep_task = tokio::spawn(offline_sweep_loop(
        states.clone(),
        store.clone(),
        alerts.clone(),
        shutdown_rx.clone(),
    ));
    let retention_task = history.clone().map(|db| {
        tokio::spawn(retention_loop(db, shutdown_rx.clone()))
    });

    lifecycle.transition_to(LifecycleState::Active)?;
    info!(
        http = %format!("http://{}:{}", config.http_host, http_port),
        ws_port = ?ws_port,
        "MeshForge Maps running"
    );
    if !cli.tui_only {
        println!("MeshForge Maps running at http://{}:{}", config.http_host, http_port);
    }
    if cli.tui || cli.tui_only {
        println!(
            "Terminal dashboard: meshmap-tui --server http://{}:{}",
            config.http_host, http_port
        );
    }

    // ── Wait for shutdown ────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    lifecycle.transition_to(LifecycleState::Deactivating)?;
    shutdown_tx.send(true).ok();

    let mut tasks: Vec<(&str, tokio::task::JoinHandle<()>)> = Vec::new();
    tasks.push(("aggregation", poll_task));
    tasks.push(("offline-sweep", sweep_task));
    tasks.push(("dispatcher", dispatcher_task));
    if let Some(task) = broker_task {
        tasks.push(("broker", task));
    }
    if let Some(task) = retention_task {
        tasks.push(("retention", task));
    }
    for (name, task) in tasks {
        if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await.is_err() {
            warn!(task = name, "background task missed the shutdown deadline");
        }
    }

    if let Err(e) = config.save(&config_path) {
        warn!(error = %e, "could not persist settings");
    }
    lifecycle.transition_to(LifecycleState::Stopped)?;
    info!("shutdown complete");
    Ok(0)
}

fn finish_verify(warnings: Vec<String>) -> i32 {
    if warnings.is_empty() {
        println!("Configuration valid. All subsystems available.");
        0
    } else {
        for warning in &warnings {
            println!("warning: {warning}");
        }
        2
    }
}

fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Subscribe the operations layer to the live event stream.
fn wire_subscriptions(
    bus: &Arc<EventBus>,
    history: &Option<Arc<NodeHistoryDb>>,
    states: &Arc<NodeStateTracker>,
    drift: &Arc<ConfigDriftDetector>,
    alerts: &Arc<AlertEngine>,
) {
    // Position events append to history (throttled internally).
    if let Some(db) = history.clone() {
        bus.subscribe(
            Some(EventType::NodePosition),
            Arc::new(move |event: &Event| {
                let (Some(node_id), Some(lat), Some(lon)) =
                    (event.node_id.as_deref(), event.lat, event.lon)
                else {
                    return;
                };
                if let Err(e) =
                    db.record_observation(node_id, lat, lon, None, &event.source, None, None, "", None)
                {
                    tracing::debug!(error = %e, "observation not recorded");
                }
            }),
        );
    }

    // Every node event is a heartbeat for the connectivity tracker.
    for event_type in [
        EventType::NodePosition,
        EventType::NodeInfo,
        EventType::NodeTelemetry,
    ] {
        let states = states.clone();
        bus.subscribe(
            Some(event_type),
            Arc::new(move |event: &Event| {
                if let Some(ref node_id) = event.node_id {
                    states.record_heartbeat(node_id);
                }
            }),
        );
    }

    // Info events feed the drift detector.
    {
        let drift = drift.clone();
        bus.subscribe(
            Some(EventType::NodeInfo),
            Arc::new(move |event: &Event| {
                let Some(ref node_id) = event.node_id else {
                    return;
                };
                let fields: HashMap<String, Value> = event
                    .data
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                drift.check_node(node_id, &fields);
            }),
        );
    }

    // Telemetry events get an immediate rule pass on the reported metrics.
    {
        let alerts = alerts.clone();
        bus.subscribe(
            Some(EventType::NodeTelemetry),
            Arc::new(move |event: &Event| {
                let Some(ref node_id) = event.node_id else {
                    return;
                };
                let mut props = meshmap_core::geo::NodeProperties::new(node_id.clone());
                props.network = Some(event.source.clone());
                props.battery = event.data.get("battery").and_then(Value::as_f64);
                props.voltage = event.data.get("voltage").and_then(Value::as_f64);
                props.snr = event.data.get("snr").and_then(Value::as_f64);
                props.channel_util = event.data.get("channel_util").and_then(Value::as_f64);
                props.air_util_tx = event.data.get("air_util_tx").and_then(Value::as_f64);
                alerts.evaluate_node(node_id, &props, None, None);
            }),
        );
    }
}

/// Periodic full collection keeps API reads warm and re-scores every node.
async fn aggregation_loop(
    aggregator: Arc<Aggregator>,
    states: Arc<NodeStateTracker>,
    health: Arc<NodeHealthScorer>,
    alerts: Arc<AlertEngine>,
    interval_seconds: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs_f64(interval_seconds.max(60.0));
    loop {
        let snapshot = aggregator.collect_all().await;
        for feature in &snapshot.features {
            let node_id = feature.properties.id.clone();
            if node_id.is_empty() {
                continue;
            }
            let connectivity = states.state_of(&node_id);
            let score = health
                .score_node(&node_id, &feature.properties, connectivity, None)
                .map(|s| s.score as f64);
            alerts.evaluate_node(&node_id, &feature.properties, score, None);
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Minute-resolution sweep for offline transitions and absence alerts.
async fn offline_sweep_loop(
    states: Arc<NodeStateTracker>,
    store: Arc<NodeStore>,
    alerts: Arc<AlertEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
        }
        for node_id in states.check_offline(None) {
            let last_seen = store
                .get_node(&node_id)
                .map(|n| n.last_seen as f64)
                .unwrap_or(0.0);
            alerts.evaluate_offline(&node_id, last_seen, states.offline_threshold(), None);
        }
    }
}

/// Hourly retention pass over the history database.
async fn retention_loop(db: Arc<NodeHistoryDb>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
        }
        match db.prune_old_data(None) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "history retention pass complete"),
            Err(e) => warn!(error = %e, "history retention failed"),
        }
    }
}
