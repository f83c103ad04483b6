//! Base collector framework: cache + retry + circuit breaker + stale
//! fallback.
//!
//! Concrete collectors implement [`Collector::fetch`] only; everything else
//! (TTL caching, bounded retry with backoff, breaker consultation, and the
//! stale-cache fallback) lives in [`CollectorHandle::collect`]. Parse
//! failures are never retried (the same request would fail again); transient
//! transport failures are retried up to the configured budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::circuit::CircuitBreaker;
use crate::geo::FeatureCollection;
use crate::now_ts;
use crate::reconnect::ReconnectStrategy;

pub const DEFAULT_CACHE_TTL_SECONDS: f64 = 900.0;

/// Fetch failures, split by retry policy.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level failure; retried up to the collector's budget.
    #[error("transient: {0}")]
    Transient(String),
    /// Malformed upstream response; retrying would fail identically.
    #[error("parse: {0}")]
    Parse(String),
}

impl FetchError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_decode() || e.is_body() {
            FetchError::Parse(e.to_string())
        } else {
            FetchError::Transient(e.to_string())
        }
    }
}

/// A data source that produces a feature sequence on demand. The single
/// polymorphism point of the collector framework.
#[async_trait]
pub trait Collector: Send + Sync {
    fn source_name(&self) -> &'static str;
    async fn fetch(&self) -> Result<FeatureCollection, FetchError>;
}

#[derive(Default)]
struct HandleStats {
    last_error: Option<String>,
    last_error_time: f64,
    last_success_time: f64,
    total_collections: u64,
    total_errors: u64,
}

/// Outcome of one collection, with cache provenance for perf accounting.
pub struct CollectOutcome {
    pub data: FeatureCollection,
    pub from_cache: bool,
    /// False only when the source failed and no cache could stand in;
    /// feeds the aggregator's service.up/service.down transitions.
    pub ok: bool,
}

/// Shared collectors can be driven through an `Arc`.
#[async_trait]
impl<T: Collector> Collector for Arc<T> {
    fn source_name(&self) -> &'static str {
        (**self).source_name()
    }

    async fn fetch(&self) -> Result<FeatureCollection, FetchError> {
        (**self).fetch().await
    }
}

pub struct CollectorHandle {
    collector: Box<dyn Collector>,
    cache: Mutex<Option<(FeatureCollection, f64)>>,
    cache_ttl: f64,
    max_retries: u32,
    breaker: Option<Arc<CircuitBreaker>>,
    shutdown: Option<watch::Receiver<bool>>,
    stats: Mutex<HandleStats>,
}

impl CollectorHandle {
    pub fn new(collector: Box<dyn Collector>) -> Self {
        Self {
            collector,
            cache: Mutex::new(None),
            cache_ttl: DEFAULT_CACHE_TTL_SECONDS,
            max_retries: 0,
            breaker: None,
            shutdown: None,
            stats: Mutex::new(HandleStats::default()),
        }
    }

    pub fn with_cache_ttl(mut self, seconds: f64) -> Self {
        self.cache_ttl = seconds;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Retry backoffs observe this signal so shutdown is never blocked on a
    /// sleeping collector.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn source_name(&self) -> &'static str {
        self.collector.source_name()
    }

    /// Collect from this source per the framework contract.
    pub async fn collect(&self) -> CollectOutcome {
        let source = self.collector.source_name();

        // Circuit open: skip the fetch entirely, serve whatever cache exists.
        if let Some(ref breaker) = self.breaker {
            if !breaker.can_send() {
                debug!(source, "circuit open, serving cache");
                let cached = self.cached_any_age();
                let ok = cached.is_some();
                return CollectOutcome {
                    data: cached.unwrap_or_else(|| FeatureCollection::empty(source)),
                    from_cache: true,
                    ok,
                };
            }
        }

        if let Some(data) = self.cached_fresh() {
            debug!(source, "returning cached data");
            return CollectOutcome {
                data,
                from_cache: true,
                ok: true,
            };
        }

        let strategy = ReconnectStrategy::for_collector();
        let attempts = 1 + self.max_retries;
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..attempts {
            match self.collector.fetch().await {
                Ok(data) => {
                    if let Some(ref breaker) = self.breaker {
                        breaker.record_success();
                    }
                    {
                        let mut cache = self.cache.lock();
                        *cache = Some((data.clone(), now_ts()));
                    }
                    {
                        let mut stats = self.stats.lock();
                        stats.last_success_time = now_ts();
                        stats.total_collections += 1;
                    }
                    let count = data.features.len();
                    if attempt > 0 {
                        info!(source, nodes = count, retries = attempt, "collected");
                    } else {
                        info!(source, nodes = count, "collected");
                    }
                    return CollectOutcome {
                        data,
                        from_cache: false,
                        ok: true,
                    };
                }
                Err(e) => {
                    let is_parse = matches!(e, FetchError::Parse(_));
                    last_error = Some(e);
                    if is_parse {
                        break;
                    }
                    if attempt + 1 < attempts {
                        let delay = strategy.next_delay();
                        debug!(
                            source,
                            attempt = attempt + 1,
                            delay_secs = format!("{delay:.1}"),
                            "fetch failed, retrying"
                        );
                        if self.sleep_interruptible(delay).await {
                            break;
                        }
                    }
                }
            }
        }

        // All attempts failed.
        if let Some(ref breaker) = self.breaker {
            breaker.record_failure();
        }
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".into());
        {
            let mut stats = self.stats.lock();
            stats.last_error = Some(message.clone());
            stats.last_error_time = now_ts();
            stats.total_errors += 1;
        }
        error!(source, error = %message, "collection failed");

        if let Some(data) = self.cached_any_age() {
            warn!(source, "returning stale cache");
            return CollectOutcome {
                data,
                from_cache: true,
                ok: true,
            };
        }
        CollectOutcome {
            data: FeatureCollection::empty(source),
            from_cache: false,
            ok: false,
        }
    }

    /// Returns true when interrupted by shutdown.
    async fn sleep_interruptible(&self, delay: f64) -> bool {
        let sleep = tokio::time::sleep(Duration::from_secs_f64(delay));
        match self.shutdown.clone() {
            Some(mut rx) => {
                tokio::select! {
                    _ = rx.changed() => true,
                    _ = sleep => false,
                }
            }
            None => {
                sleep.await;
                false
            }
        }
    }

    fn cached_fresh(&self) -> Option<FeatureCollection> {
        let cache = self.cache.lock();
        cache
            .as_ref()
            .filter(|(_, at)| now_ts() - at < self.cache_ttl)
            .map(|(data, _)| data.clone())
    }

    fn cached_any_age(&self) -> Option<FeatureCollection> {
        self.cache.lock().as_ref().map(|(data, _)| data.clone())
    }

    pub fn clear_cache(&self) {
        *self.cache.lock() = None;
    }

    pub fn cache_age_seconds(&self) -> Option<u64> {
        self.cache
            .lock()
            .as_ref()
            .map(|(_, at)| (now_ts() - at).max(0.0) as u64)
    }

    /// Health snapshot for `/api/status`.
    pub fn health_info(&self) -> Value {
        let now = now_ts();
        let stats = self.stats.lock();
        let mut info = json!({
            "source": self.collector.source_name(),
            "total_collections": stats.total_collections,
            "total_errors": stats.total_errors,
            "has_cache": self.cache.lock().is_some(),
        });
        if stats.last_success_time > 0.0 {
            info["last_success_age_seconds"] = json!((now - stats.last_success_time) as u64);
        }
        if let Some(ref err) = stats.last_error {
            info["last_error"] = json!(err);
            info["last_error_age_seconds"] = json!((now - stats.last_error_time) as u64);
        }
        if let Some(age) = self.cache_age_seconds() {
            info["cache_age_seconds"] = json!(age);
        }
        info
    }
}
