//! Prometheus export for `presspool`.
//! Bring your own `prometheus::Registry`; gauges and counters are registered into it.
//!
//! - [`PoolGauges`] mirrors a [`HubStats`] snapshot: capacity, active, and
//!   waiting per pool, in-flight requests per HTTP service, cache counters.
//! - [`PrometheusSink`] is a telemetry sink counting every event by kind and
//!   timing HTTP requests.

use presspool::cache::CacheStats;
use presspool::telemetry::{
    CacheEvent, Event, PoolEvent, RequestOutcome, RetryEvent, TelemetrySink,
};
use presspool::HubStats;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Gauges fed from [`HubStats`] snapshots.
#[derive(Clone, Debug)]
pub struct PoolGauges {
    capacity: IntGaugeVec,
    active: IntGaugeVec,
    waiting: IntGaugeVec,
    http_in_flight: IntGaugeVec,
    cache: IntGaugeVec,
}

impl PoolGauges {
    /// Register the gauges into `registry`.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let capacity = IntGaugeVec::new(
            Opts::new("presspool_pool_capacity", "Connections per service pool"),
            &["service"],
        )?;
        let active = IntGaugeVec::new(
            Opts::new("presspool_pool_active", "Connections currently checked out"),
            &["service"],
        )?;
        let waiting = IntGaugeVec::new(
            Opts::new("presspool_pool_waiting", "Callers queued for a connection"),
            &["service"],
        )?;
        let http_in_flight = IntGaugeVec::new(
            Opts::new("presspool_http_in_flight", "In-flight requests per HTTP service"),
            &["service"],
        )?;
        let cache = IntGaugeVec::new(
            Opts::new("presspool_cache_operations", "Cache operation counts since start"),
            &["backend", "operation"],
        )?;
        for gauge in [&capacity, &active, &waiting, &http_in_flight, &cache] {
            registry.register(Box::new(gauge.clone()))?;
        }
        Ok(Self { capacity, active, waiting, http_in_flight, cache })
    }

    /// Overwrite every gauge with the values in `stats`.
    pub fn record(&self, stats: &HubStats) {
        for pool in &stats.pools {
            let labels = [pool.service.as_str()];
            self.capacity.with_label_values(&labels).set(to_i64(pool.capacity));
            self.active.with_label_values(&labels).set(to_i64(pool.active));
            self.waiting.with_label_values(&labels).set(to_i64(pool.waiting));
        }
        for http in &stats.http {
            self.http_in_flight.with_label_values(&[http.service.as_str()]).set(to_i64(http.in_flight));
        }
        self.record_cache(&stats.cache);
    }

    fn record_cache(&self, cache: &CacheStats) {
        let counts = [
            ("hit", cache.hits),
            ("miss", cache.misses),
            ("write", cache.writes),
            ("delete", cache.deletes),
            ("error", cache.errors),
        ];
        for (operation, count) in counts {
            self.cache
                .with_label_values(&[cache.backend, operation])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    pub fn active(&self, service: &str) -> i64 {
        self.active.with_label_values(&[service]).get()
    }

    pub fn waiting(&self, service: &str) -> i64 {
        self.waiting.with_label_values(&[service]).get()
    }

    pub fn capacity(&self, service: &str) -> i64 {
        self.capacity.with_label_values(&[service]).get()
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Telemetry sink counting events and timing requests.
#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    request_seconds: HistogramVec,
}

impl PrometheusSink {
    /// Create a sink and register its metrics into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            Opts::new("presspool_events_total", "Pool, retry, cache, and request events"),
            &["kind", "event"],
        )?;
        let request_seconds = HistogramVec::new(
            HistogramOpts::new("presspool_request_duration_seconds", "Upstream HTTP request latency"),
            &["service", "outcome"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(request_seconds.clone()))?;
        Ok(Self { registry, events, request_seconds })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for one `(kind, event)` label pair.
    pub fn count(&self, kind: &str, event: &str) -> u64 {
        self.events.with_label_values(&[kind, event]).get()
    }
}

fn labels(event: &Event) -> (&'static str, &'static str) {
    match event {
        Event::Pool(pool) => (
            "pool",
            match pool {
                PoolEvent::Acquired { .. } => "acquired",
                PoolEvent::Queued { .. } => "queued",
                PoolEvent::Released { handed_off: true, .. } => "handed_off",
                PoolEvent::Released { .. } => "released",
                PoolEvent::Closed { .. } => "closed",
            },
        ),
        Event::Retry(retry) => (
            "retry",
            match retry {
                RetryEvent::Attempt { .. } => "attempt",
                RetryEvent::Exhausted { .. } => "exhausted",
            },
        ),
        Event::Cache(cache) => (
            "cache",
            match cache {
                CacheEvent::Hit { .. } => "hit",
                CacheEvent::Miss { .. } => "miss",
                CacheEvent::BackendError { .. } => "backend_error",
            },
        ),
        Event::Request(request) => (
            "request",
            match request {
                RequestOutcome::Success { .. } => "success",
                RequestOutcome::Failure { .. } => "failure",
            },
        ),
    }
}

impl tower_service::Service<Event> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Event) -> Self::Future {
        let (kind, name) = labels(&event);
        self.events.with_label_values(&[kind, name]).inc();
        if let Event::Request(outcome) = &event {
            let (service, duration) = match outcome {
                RequestOutcome::Success { service, duration, .. }
                | RequestOutcome::Failure { service, duration, .. } => (service, duration),
            };
            self.request_seconds
                .with_label_values(&[service.as_str(), name])
                .observe(duration.as_secs_f64());
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
