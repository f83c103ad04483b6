//! Collection-cycle performance monitor.
//!
//! Bounded per-source sample buffers feed p50/p90/p99 latency, min/max/avg,
//! and cache-hit ratios for the `/api/perf` endpoint.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::now_ts;

/// Samples retained per source for percentile computation.
const MAX_SAMPLES: usize = 128;

#[derive(Default)]
struct SourceTimings {
    samples_ms: VecDeque<f64>,
    count: u64,
    total_ms: f64,
    cache_hits: u64,
    total_nodes: u64,
    last_ms: f64,
    last_time: f64,
    min_ms: f64,
    max_ms: f64,
}

#[derive(Default)]
struct CycleTimings {
    count: u64,
    total_ms: f64,
    last_ms: f64,
    total_nodes: u64,
}

struct MonitorInner {
    start_time: f64,
    total_collections: u64,
    sources: HashMap<String, SourceTimings>,
    cycle: CycleTimings,
}

pub struct PerfMonitor {
    inner: Mutex<MonitorInner>,
}

impl Default for PerfMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                start_time: now_ts(),
                total_collections: 0,
                sources: HashMap::new(),
                cycle: CycleTimings::default(),
            }),
        }
    }

    /// Record one collection timing for a source.
    pub fn record_timing(&self, source: &str, duration_ms: f64, node_count: usize, from_cache: bool) {
        let mut inner = self.inner.lock();
        let s = inner.sources.entry(source.to_string()).or_default();
        if s.count == 0 {
            s.min_ms = duration_ms;
        }
        s.count += 1;
        s.total_ms += duration_ms;
        s.last_ms = duration_ms;
        s.last_time = now_ts();
        s.total_nodes += node_count as u64;
        if from_cache {
            s.cache_hits += 1;
        }
        s.min_ms = s.min_ms.min(duration_ms);
        s.max_ms = s.max_ms.max(duration_ms);
        s.samples_ms.push_back(duration_ms);
        if s.samples_ms.len() > MAX_SAMPLES {
            s.samples_ms.pop_front();
        }
    }

    /// Record a full collection cycle.
    pub fn record_cycle(&self, duration_ms: f64, total_nodes: usize) {
        let mut inner = self.inner.lock();
        inner.cycle.count += 1;
        inner.cycle.total_ms += duration_ms;
        inner.cycle.last_ms = duration_ms;
        inner.cycle.total_nodes += total_nodes as u64;
        inner.total_collections += 1;
    }

    pub fn source_stats(&self, source: &str) -> Option<Value> {
        let inner = self.inner.lock();
        inner.sources.get(source).map(|s| format_source(source, s))
    }

    pub fn stats(&self) -> Value {
        let inner = self.inner.lock();
        let uptime = now_ts() - inner.start_time;

        let sources: serde_json::Map<String, Value> = inner
            .sources
            .iter()
            .map(|(name, s)| (name.clone(), format_source(name, s)))
            .collect();

        let cycle = (inner.cycle.count > 0).then(|| {
            json!({
                "count": inner.cycle.count,
                "avg_ms": round2(inner.cycle.total_ms / inner.cycle.count as f64),
                "last_duration_ms": round2(inner.cycle.last_ms),
                "total_nodes_collected": inner.cycle.total_nodes,
            })
        });

        json!({
            "uptime_seconds": uptime as u64,
            "total_collections": inner.total_collections,
            "collections_per_minute": round2(
                inner.total_collections as f64 / (uptime / 60.0).max(1.0)
            ),
            "sources": sources,
            "cycle": cycle,
        })
    }
}

fn format_source(name: &str, s: &SourceTimings) -> Value {
    let mut sorted: Vec<f64> = s.samples_ms.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    json!({
        "source": name,
        "count": s.count,
        "avg_ms": if s.count > 0 { round2(s.total_ms / s.count as f64) } else { 0.0 },
        "min_ms": round2(s.min_ms),
        "max_ms": round2(s.max_ms),
        "p50_ms": round2(percentile(&sorted, 0.50)),
        "p90_ms": round2(percentile(&sorted, 0.90)),
        "p99_ms": round2(percentile(&sorted, 0.99)),
        "last_duration_ms": round2(s.last_ms),
        "last_timestamp": s.last_time,
        "cache_hit_ratio": if s.count > 0 {
            round3(s.cache_hits as f64 / s.count as f64)
        } else {
            0.0
        },
        "total_nodes_collected": s.total_nodes,
    })
}

/// Nearest-rank percentile over a pre-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let monitor = PerfMonitor::new();
        for i in 1..=100 {
            monitor.record_timing("meshtastic", i as f64, 10, false);
        }
        let stats = monitor.source_stats("meshtastic").unwrap();
        assert_eq!(stats["p50_ms"], 50.0);
        assert_eq!(stats["p90_ms"], 90.0);
        assert_eq!(stats["p99_ms"], 99.0);
        assert_eq!(stats["min_ms"], 1.0);
        assert_eq!(stats["max_ms"], 100.0);
    }

    #[test]
    fn test_cache_hit_ratio() {
        let monitor = PerfMonitor::new();
        monitor.record_timing("aredn", 5.0, 1, true);
        monitor.record_timing("aredn", 15.0, 1, false);
        monitor.record_timing("aredn", 5.0, 1, true);
        monitor.record_timing("aredn", 5.0, 1, true);
        let stats = monitor.source_stats("aredn").unwrap();
        assert_eq!(stats["cache_hit_ratio"], 0.75);
    }

    #[test]
    fn test_sample_buffer_bounded() {
        let monitor = PerfMonitor::new();
        for i in 0..1000 {
            monitor.record_timing("hamclock", i as f64, 0, false);
        }
        let stats = monitor.source_stats("hamclock").unwrap();
        // Percentiles come from the retained window, totals from all samples.
        assert_eq!(stats["count"], 1000);
        assert!(stats["p50_ms"].as_f64().unwrap() >= (1000 - MAX_SAMPLES) as f64);
    }

    #[test]
    fn test_cycle_stats() {
        let monitor = PerfMonitor::new();
        monitor.record_cycle(120.0, 42);
        monitor.record_cycle(80.0, 40);
        let stats = monitor.stats();
        assert_eq!(stats["cycle"]["count"], 2);
        assert_eq!(stats["cycle"]["avg_ms"], 100.0);
        assert_eq!(stats["total_collections"], 2);
    }
}
