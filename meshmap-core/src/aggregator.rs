//! Data aggregator: parallel fan-out across collectors, merge, dedup.
//!
//! Owns the collector handles, the broker subscriber, the event bus, the
//! circuit-breaker registry, and the perf monitor. `collect_all` runs every
//! node source concurrently under a deadline; a slow collector's result is
//! simply absent from the cycle and its cache covers the next read. The
//! merged snapshot is persisted behind a data mutex for `/api/*` readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info};

use crate::broker::{BrokerConfig, BrokerSubscriber};
use crate::circuit::CircuitBreakerRegistry;
use crate::collect::CollectorHandle;
use crate::collectors::aredn::ArednCollector;
use crate::collectors::hamclock::HamClockCollector;
use crate::collectors::meshtastic::MeshtasticCollector;
use crate::collectors::noaa::NoaaAlertCollector;
use crate::collectors::reticulum::ReticulumCollector;
use crate::config::MapsConfig;
use crate::event_bus::{Event, EventBus};
use crate::geo::{deduplicate_features, FeatureCollection};
use crate::lease::LeaseManager;
use crate::now_ts;
use crate::perf::PerfMonitor;
use crate::store::NodeStore;
use crate::topology::{links_to_geojson, TopologyLink};

/// Default retry budget applied to every collector.
const DEFAULT_COLLECTOR_RETRIES: u32 = 2;

/// A collector slower than this is dropped from the cycle.
const COLLECT_DEADLINE: Duration = Duration::from_secs(60);

/// Overlay keys folded out of per-source collection properties.
const OVERLAY_KEYS: [&str; 3] = ["space_weather", "solar_terminator", "hamclock"];

#[derive(Default)]
struct AggregateData {
    snapshot: Option<FeatureCollection>,
    overlay: serde_json::Map<String, Value>,
    last_collect_time: f64,
    last_counts: HashMap<String, usize>,
    source_up: HashMap<String, bool>,
}

pub struct Aggregator {
    collectors: Vec<Arc<CollectorHandle>>,
    /// Sources whose features are overlays (polygons), not mesh nodes.
    overlay_only: Vec<&'static str>,
    aredn: Option<Arc<ArednCollector>>,
    hamclock: Option<Arc<HamClockCollector>>,
    broker: Option<Arc<BrokerSubscriber>>,
    bus: Arc<EventBus>,
    perf: Arc<PerfMonitor>,
    breakers: Arc<CircuitBreakerRegistry>,
    data: Mutex<AggregateData>,
}

impl Aggregator {
    /// Wire up collectors per the enable flags, in the documented
    /// enable-order (meshtastic, reticulum, hamclock, aredn, noaa_alerts).
    pub fn new(
        config: &MapsConfig,
        bus: Arc<EventBus>,
        store: Arc<NodeStore>,
        leases: Arc<LeaseManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let perf = Arc::new(PerfMonitor::new());
        let cache_ttl = config.cache_ttl_seconds();
        let mut collectors: Vec<Arc<CollectorHandle>> = Vec::new();

        let handle = |boxed: Box<dyn crate::collect::Collector>, name: &str, ttl: f64| {
            Arc::new(
                CollectorHandle::new(boxed)
                    .with_cache_ttl(ttl)
                    .with_max_retries(DEFAULT_COLLECTOR_RETRIES)
                    .with_breaker(breakers.get(name))
                    .with_shutdown(shutdown.clone()),
            )
        };

        let mut broker = None;
        if config.enable_meshtastic {
            let subscriber = Arc::new(BrokerSubscriber::new(
                BrokerConfig {
                    broker: config.mqtt_broker.clone(),
                    port: config.mqtt_port,
                    topic: config.mqtt_topic.clone(),
                    username: config.mqtt_username.clone(),
                    password: config.mqtt_password.clone(),
                    tls: config
                        .mqtt_tls
                        .unwrap_or(config.mqtt_username.is_some()),
                },
                store.clone(),
                bus.clone(),
            ));
            broker = Some(subscriber);

            let collector = MeshtasticCollector::new(
                &config.meshtasticd_host,
                config.meshtasticd_port,
                Some(store),
                leases,
            );
            collectors.push(handle(Box::new(collector), "meshtastic", cache_ttl));
        }

        if config.enable_reticulum {
            collectors.push(handle(
                Box::new(ReticulumCollector::default()),
                "reticulum",
                cache_ttl,
            ));
        }

        let mut hamclock = None;
        if config.enable_hamclock {
            let collector = Arc::new(HamClockCollector::new(
                &config.hamclock_host,
                config.hamclock_port,
                config.openhamclock_port,
            ));
            hamclock = Some(collector.clone());
            collectors.push(handle(Box::new(collector), "hamclock", cache_ttl));
        }

        let mut aredn = None;
        if config.enable_aredn {
            let collector = Arc::new(ArednCollector::new(config.aredn_nodes.clone()));
            aredn = Some(collector.clone());
            collectors.push(handle(Box::new(collector), "aredn", cache_ttl));
        }

        if config.enable_noaa_alerts {
            let collector = NoaaAlertCollector::new(
                config.noaa_alerts_area.clone(),
                config.noaa_alerts_severity.clone(),
            );
            // Weather alerts move fast; cap their TTL at five minutes.
            collectors.push(handle(
                Box::new(collector),
                "noaa_alerts",
                cache_ttl.min(300.0),
            ));
        }

        Self {
            collectors,
            overlay_only: vec!["noaa_alerts"],
            aredn,
            hamclock,
            broker,
            bus,
            perf,
            breakers,
            data: Mutex::new(AggregateData::default()),
        }
    }

    /// Collect from every node source in parallel and merge.
    pub async fn collect_all(self: &Arc<Self>) -> FeatureCollection {
        let cycle_start = Instant::now();

        let node_collectors: Vec<Arc<CollectorHandle>> = self
            .collectors
            .iter()
            .filter(|c| !self.overlay_only.contains(&c.source_name()))
            .cloned()
            .collect();

        let tasks = node_collectors.iter().map(|collector| {
            let collector = collector.clone();
            let perf = self.perf.clone();
            tokio::spawn(async move {
                let name = collector.source_name();
                let start = Instant::now();
                let outcome = tokio::time::timeout(COLLECT_DEADLINE, collector.collect()).await;
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                match outcome {
                    Ok(outcome) => {
                        perf.record_timing(
                            name,
                            elapsed_ms,
                            outcome.data.features.len(),
                            outcome.from_cache,
                        );
                        (name, Some(outcome))
                    }
                    Err(_) => {
                        error!(source = name, "collector missed the cycle deadline");
                        perf.record_timing(name, elapsed_ms, 0, false);
                        (name, None)
                    }
                }
            })
        });

        let joined = futures::future::join_all(tasks).await;

        let mut per_source_features: Vec<Vec<crate::geo::Feature>> = Vec::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut overlay = serde_json::Map::new();
        let mut up_states: Vec<(String, bool)> = Vec::new();

        for result in joined {
            let Ok((name, outcome)) = result else {
                continue;
            };
            match outcome {
                Some(outcome) => {
                    counts.insert(name.to_string(), outcome.data.features.len());
                    up_states.push((name.to_string(), outcome.ok));
                    for key in OVERLAY_KEYS {
                        if let Some(value) = outcome.data.properties.get(key) {
                            overlay.insert(key.to_string(), value.clone());
                        }
                    }
                    per_source_features.push(outcome.data.features);
                }
                None => {
                    counts.insert(name.to_string(), 0);
                    up_states.push((name.to_string(), false));
                }
            }
        }

        let all_features = deduplicate_features(per_source_features);
        let total = all_features.len();
        self.perf
            .record_cycle(cycle_start.elapsed().as_secs_f64() * 1000.0, total);

        let mut result = FeatureCollection::new(all_features, "aggregated");
        result.set_property("sources", json!(counts));
        result.set_property("total_nodes", json!(total));
        result.set_property(
            "enabled_sources",
            json!(self
                .collectors
                .iter()
                .map(|c| c.source_name())
                .collect::<Vec<_>>()),
        );
        result.set_property("overlay_data", Value::Object(overlay.clone()));

        // Persist the snapshot, then fire transition events outside the lock.
        let transitions: Vec<(String, bool)> = {
            let mut data = self.data.lock();
            data.snapshot = Some(result.clone());
            data.overlay = overlay;
            data.last_collect_time = now_ts();
            data.last_counts = counts.clone();
            let mut transitions = Vec::new();
            for (name, up) in up_states {
                let previous = data.source_up.insert(name.clone(), up);
                if previous != Some(up) {
                    transitions.push((name, up));
                }
            }
            transitions
        };
        for (name, up) in transitions {
            if up {
                self.bus.publish(&Event::service_up(&name));
            } else {
                self.bus.publish(&Event::service_down(&name, "collection failed"));
            }
        }
        self.bus.publish(&Event {
            event_type: crate::event_bus::EventType::DataRefreshed,
            timestamp: now_ts(),
            source: "aggregator".into(),
            node_id: None,
            lat: None,
            lon: None,
            data: serde_json::Map::new(),
        });

        info!(nodes = total, sources = counts.len(), "aggregation cycle complete");
        result
    }

    /// Latest persisted snapshot, collecting on first use.
    pub async fn geojson(self: &Arc<Self>) -> FeatureCollection {
        if let Some(snapshot) = self.data.lock().snapshot.clone() {
            return snapshot;
        }
        self.collect_all().await
    }

    /// Collect from a single named source.
    pub async fn collect_source(&self, source: &str) -> FeatureCollection {
        match self.collector(source) {
            Some(collector) => collector.collect().await.data,
            None => FeatureCollection::empty(source),
        }
    }

    pub fn collector(&self, source: &str) -> Option<&Arc<CollectorHandle>> {
        self.collectors.iter().find(|c| c.source_name() == source)
    }

    /// Merged topology: broker-store links plus Wi-Fi-mesh LQM edges.
    pub fn topology_links(&self) -> Vec<TopologyLink> {
        let mut links = self
            .broker
            .as_ref()
            .map(|b| b.store().topology_links())
            .unwrap_or_default();
        if let Some(ref aredn) = self.aredn {
            links.extend(aredn.topology_links());
        }
        links
    }

    pub fn topology_geojson(&self) -> FeatureCollection {
        links_to_geojson(&self.topology_links())
    }

    /// Cached overlay data; refills from the propagation source alone rather
    /// than triggering a full aggregation.
    pub async fn overlay(&self) -> serde_json::Map<String, Value> {
        {
            let data = self.data.lock();
            if !data.overlay.is_empty() {
                return data.overlay.clone();
            }
        }
        let Some(hamclock) = self.collector("hamclock") else {
            return serde_json::Map::new();
        };
        let outcome = hamclock.collect().await;
        let mut overlay = serde_json::Map::new();
        for key in OVERLAY_KEYS {
            if let Some(value) = outcome.data.properties.get(key) {
                overlay.insert(key.to_string(), value.clone());
            }
        }
        self.data.lock().overlay = overlay.clone();
        overlay
    }

    /// Weather alert overlay (polygon features), served separately from the
    /// node snapshot.
    pub async fn weather_alerts(&self) -> FeatureCollection {
        self.collect_source("noaa_alerts").await
    }

    pub fn hamclock_data(&self) -> Value {
        self.hamclock
            .as_ref()
            .map(|h| h.hamclock_data())
            .unwrap_or_else(|| json!({"available": false}))
    }

    pub fn source_health(&self) -> Value {
        let health: serde_json::Map<String, Value> = self
            .collectors
            .iter()
            .map(|c| (c.source_name().to_string(), c.health_info()))
            .collect();
        Value::Object(health)
    }

    pub fn breaker_states(&self) -> Value {
        json!(self.breakers.all_states())
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn perf(&self) -> &Arc<PerfMonitor> {
        &self.perf
    }

    pub fn broker(&self) -> Option<&Arc<BrokerSubscriber>> {
        self.broker.as_ref()
    }

    pub fn last_collect_age_seconds(&self) -> Option<f64> {
        let data = self.data.lock();
        (data.last_collect_time > 0.0).then(|| now_ts() - data.last_collect_time)
    }

    pub fn last_collect_counts(&self) -> HashMap<String, usize> {
        self.data.lock().last_counts.clone()
    }

    pub fn enabled_collector_count(&self) -> usize {
        self.collectors.len()
    }

    pub fn enabled_collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.source_name()).collect()
    }

    pub fn clear_all_caches(&self) {
        for collector in &self.collectors {
            collector.clear_cache();
        }
        let mut data = self.data.lock();
        data.snapshot = None;
        data.overlay = serde_json::Map::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{Collector, FetchError};
    use crate::geo::{Feature, NodeProperties};
    use async_trait::async_trait;

    struct FixedCollector {
        name: &'static str,
        ids: Vec<&'static str>,
    }

    #[async_trait]
    impl Collector for FixedCollector {
        fn source_name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
            let features = self
                .ids
                .iter()
                .map(|id| {
                    Feature::point(*id, 40.0, -105.0, self.name, NodeProperties::new(*id))
                        .unwrap()
                })
                .collect();
            Ok(FeatureCollection::new(features, self.name))
        }
    }

    fn test_aggregator(collectors: Vec<Arc<CollectorHandle>>) -> Arc<Aggregator> {
        Arc::new(Aggregator {
            collectors,
            overlay_only: vec![],
            aredn: None,
            hamclock: None,
            broker: None,
            bus: Arc::new(EventBus::new()),
            perf: Arc::new(PerfMonitor::new()),
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            data: Mutex::new(AggregateData::default()),
        })
    }

    #[tokio::test]
    async fn test_dedup_across_sources_first_collector_wins() {
        let first = Arc::new(CollectorHandle::new(Box::new(FixedCollector {
            name: "meshtastic",
            ids: vec!["!deadbeef", "!01"],
        })));
        let second = Arc::new(CollectorHandle::new(Box::new(FixedCollector {
            name: "aredn",
            ids: vec!["!deadbeef", "!02"],
        })));
        let aggregator = test_aggregator(vec![first, second]);

        let result = aggregator.collect_all().await;
        assert_eq!(result.features.len(), 3);
        let dupe: Vec<_> = result
            .features
            .iter()
            .filter(|f| f.properties.id == "!deadbeef")
            .collect();
        assert_eq!(dupe.len(), 1);
        assert_eq!(dupe[0].properties.network.as_deref(), Some("meshtastic"));
        assert_eq!(result.properties["total_nodes"], 3);
    }

    #[tokio::test]
    async fn test_service_transitions_published_once() {
        let collector = Arc::new(CollectorHandle::new(Box::new(FixedCollector {
            name: "meshtastic",
            ids: vec!["!01"],
        })));
        let aggregator = test_aggregator(vec![collector]);

        let ups = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let u = ups.clone();
        aggregator.bus.subscribe(
            Some(crate::event_bus::EventType::ServiceUp),
            Arc::new(move |_| {
                u.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }),
        );

        aggregator.collect_all().await;
        aggregator.collect_all().await;
        // Up fires on the first transition only.
        assert_eq!(ups.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_snapshot_served_to_readers() {
        let collector = Arc::new(CollectorHandle::new(Box::new(FixedCollector {
            name: "meshtastic",
            ids: vec!["!01"],
        })));
        let aggregator = test_aggregator(vec![collector]);
        assert!(aggregator.last_collect_age_seconds().is_none());

        let first = aggregator.geojson().await;
        assert_eq!(first.features.len(), 1);
        assert!(aggregator.last_collect_age_seconds().is_some());
        assert_eq!(aggregator.last_collect_counts()["meshtastic"], 1);
    }
}
