//! One object wiring pools, HTTP clients, the cache, retry, and telemetry.
//!
//! Build a [`Hub`] once at startup and share it behind an `Arc`:
//!
//! ```rust
//! use std::sync::Arc;
//! use presspool::config::{PoolSettings, ServiceConfig};
//! use presspool::{Hub, Result};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let hub = Arc::new(
//!     Hub::builder(PoolSettings::publishing_defaults(), |service: &str, _: &ServiceConfig, id: usize| -> Result<String> {
//!         Ok(format!("{service}-client-{id}"))
//!     })
//!     .build()
//!     .unwrap(),
//! );
//! let conn = hub.acquire("search").await.unwrap();
//! assert!(conn.starts_with("search-client-"));
//! drop(conn);
//! hub.shutdown();
//! # });
//! ```

use std::fmt;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::batch::{BatchItem, BatchOptions, BatchProcessor};
use crate::cache::{CacheStats, CacheStore};
use crate::config::{CacheSettings, PoolSettings, RetrySettings};
use crate::http::{HttpPools, HttpResponse, HttpStats, RequestSpec};
use crate::pool::{PoolStats, PooledConnection};
use crate::registry::{ClientFactory, PoolRegistry};
use crate::retry::RetryPolicy;
use crate::telemetry::EventBus;
use crate::{Error, Result};

/// Snapshot of everything the hub manages.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub pools: Vec<PoolStats>,
    pub http: Vec<HttpStats>,
    pub cache: CacheStats,
    /// Telemetry events lost to a full event queue.
    pub events_dropped: u64,
}

/// Shared entry point for everything that talks to rate-limited upstreams.
pub struct Hub<C: Clone> {
    registry: PoolRegistry<C>,
    http: HttpPools,
    batch: BatchProcessor,
    retry: RetryPolicy<Error>,
    events: EventBus,
}

impl<C: Clone> fmt::Debug for Hub<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.registry)
            .field("http", &self.http)
            .field("cache", self.batch.cache())
            .field("retry", &self.retry)
            .finish()
    }
}

impl<C> Hub<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn builder<F>(settings: PoolSettings, factory: F) -> HubBuilder<C>
    where
        F: ClientFactory<C> + 'static,
    {
        HubBuilder {
            settings,
            factory: Box::new(factory),
            cache: None,
            cache_settings: CacheSettings::default(),
            retry: None,
            retry_settings: RetrySettings::default(),
            events: EventBus::disabled(),
        }
    }

    /// Take a pooled client for `service`, waiting in FIFO order if needed.
    pub async fn acquire(&self, service: &str) -> Result<PooledConnection<C>> {
        self.registry.acquire(service).await
    }

    /// Shared HTTP client for an HTTP-kind `service`.
    pub fn http_client(&self, service: &str) -> Result<reqwest::Client> {
        self.http.client(service)
    }

    /// One HTTP request with metrics and status classification, no retry.
    pub async fn request(&self, service: &str, spec: RequestSpec) -> Result<HttpResponse> {
        self.http.request(service, spec).await
    }

    /// HTTP request retried on 429/529/timeouts, honoring `Retry-After`.
    pub async fn request_with_retry(&self, service: &str, spec: RequestSpec) -> Result<HttpResponse> {
        self.call_with_retry(service, || self.http.request(service, spec.clone())).await
    }

    /// Run `operation` under the hub's retry policy.
    ///
    /// Exhaustion surfaces as [`Error::RetryExhausted`] naming `service` and
    /// the attempt count; non-transient errors come back unchanged.
    pub async fn call_with_retry<T, Fut, Op>(&self, service: &str, operation: Op) -> Result<T>
    where
        T: Send,
        Fut: Future<Output = Result<T>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.retry
            .labeled(service)
            .execute(operation)
            .await
            .map_err(|err| Error::from_retry(service, err))
    }

    /// Cache-aware batch over arbitrary work.
    pub async fn batch_process<I, T, E, F, Fut>(
        &self,
        items: Vec<I>,
        work: F,
        options: &BatchOptions,
    ) -> Vec<BatchItem<I, T>>
    where
        I: Serialize + Clone,
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.batch.process(items, work, options).await
    }

    /// Batch where every cache miss borrows a client from `service`'s pool
    /// and runs under the retry policy while holding it.
    pub async fn batch_on<I, T, F, Fut>(
        &self,
        service: &str,
        items: Vec<I>,
        work: F,
        options: &BatchOptions,
    ) -> Vec<BatchItem<I, T>>
    where
        I: Serialize + Clone + Send + Sync,
        T: Serialize + DeserializeOwned + Send,
        F: Fn(I, C) -> Fut + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let work = &work;
        self.batch
            .process(
                items,
                |item: I| async move {
                    let conn = self.acquire(service).await?;
                    self.call_with_retry(service, || work(item.clone(), conn.client().clone())).await
                },
                options,
            )
            .await
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            pools: self.registry.stats(),
            http: self.http.stats(),
            cache: self.batch.cache().stats(),
            events_dropped: self.events.dropped(),
        }
    }

    /// Close every pool and HTTP client. Waiters and later callers get `PoolClosed`.
    pub fn shutdown(&self) {
        self.registry.close();
        self.http.close();
        tracing::info!(target: "presspool::hub", "hub shut down");
    }

    pub fn registry(&self) -> &PoolRegistry<C> {
        &self.registry
    }

    pub fn http(&self) -> &HttpPools {
        &self.http
    }

    pub fn cache(&self) -> &CacheStore {
        self.batch.cache()
    }

    pub fn retry_policy(&self) -> &RetryPolicy<Error> {
        &self.retry
    }
}

/// Builder for [`Hub`].
pub struct HubBuilder<C> {
    settings: PoolSettings,
    factory: Box<dyn ClientFactory<C>>,
    cache: Option<CacheStore>,
    cache_settings: CacheSettings,
    retry: Option<RetryPolicy<Error>>,
    retry_settings: RetrySettings,
    events: EventBus,
}

impl<C> HubBuilder<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Use this cache instead of building one from settings.
    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_settings(mut self, settings: CacheSettings) -> Self {
        self.cache_settings = settings;
        self
    }

    /// Use this retry policy instead of building one from settings.
    pub fn retry(mut self, policy: RetryPolicy<Error>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn retry_settings(mut self, settings: RetrySettings) -> Self {
        self.retry_settings = settings;
        self
    }

    /// Route pool, retry, cache, and request events to `events`.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<Hub<C>> {
        let events = self.events;
        let registry =
            PoolRegistry::new(self.settings.clone(), BoxedFactory(self.factory))?.with_events(events.clone());
        let http = HttpPools::new(self.settings)?.with_events(events.clone());
        let cache = match self.cache {
            Some(cache) => cache,
            None => CacheStore::from_settings(&self.cache_settings)?,
        }
        .with_events(events.clone());
        let retry = match self.retry {
            Some(policy) => policy,
            None => RetryPolicy::from_settings(&self.retry_settings)?,
        }
        .with_events(events.clone());

        Ok(Hub { registry, http, batch: BatchProcessor::new(cache), retry, events })
    }
}

struct BoxedFactory<C>(Box<dyn ClientFactory<C>>);

impl<C> ClientFactory<C> for BoxedFactory<C> {
    fn create(&self, service: &str, config: &crate::config::ServiceConfig, id: usize) -> Result<C> {
        self.0.create(service, config, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::telemetry::{Event, MemorySink, PoolEvent};
    use crate::{InstantSleeper, Jitter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_retry() -> RetryPolicy<Error> {
        RetryPolicy::builder().with_jitter(Jitter::None).with_sleeper(InstantSleeper).build().unwrap()
    }

    fn hub() -> Hub<usize> {
        let settings = PoolSettings::publishing_defaults();
        Hub::builder(settings, |_: &str, _: &ServiceConfig, id: usize| -> Result<usize> { Ok(id) })
            .retry(fast_retry())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn exhausted_retry_names_service_and_attempts() {
        let hub = hub();
        let err = hub
            .call_with_retry("text-generation", || async {
                Err::<(), _>(Error::from_status(529, "Overloaded", None))
            })
            .await
            .unwrap_err();

        assert!(err.is_retry_exhausted());
        assert_eq!(err.attempts(), Some(5));
        let message = err.to_string();
        assert!(message.starts_with("text-generation: retry exhausted after 5 attempts"), "{message}");
        assert_eq!(err.status(), Some(529));
    }

    #[tokio::test]
    async fn non_transient_errors_pass_through() {
        let hub = hub();
        let err = hub
            .call_with_retry("search", || async {
                Err::<(), _>(Error::from_status(401, "bad key", None))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamRejected { status: Some(401), .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_on_respects_pool_capacity() {
        let hub = hub();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let options = BatchOptions::new("images").concurrency(8);

        let results = hub
            .batch_on(
                "image-generation",
                (0..8u32).collect(),
                |prompt: u32, client: usize| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(format!("image {prompt} via client {client}"))
                    }
                },
                &options,
            )
            .await;

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(hub.stats().pools[0].active, 0);
    }

    #[tokio::test]
    async fn stats_and_shutdown() {
        let sink = MemorySink::new();
        let hub = Hub::builder(PoolSettings::publishing_defaults(), |_: &str, _: &ServiceConfig, id: usize| -> Result<usize> {
            Ok(id)
        })
        .events(EventBus::spawn(sink.clone(), 64))
        .build()
        .unwrap();

        let conn = hub.acquire("search").await.unwrap();
        let stats = hub.stats();
        assert_eq!(stats.pools.len(), 1);
        assert_eq!((stats.pools[0].capacity, stats.pools[0].active), (2, 1));
        assert_eq!(stats.cache.backend, "memory");
        drop(conn);

        hub.shutdown();
        assert!(hub.acquire("search").await.unwrap_err().is_pool_closed());

        for _ in 0..50 {
            if sink.len() >= 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let events = sink.events();
        assert!(events.iter().any(|e| matches!(e, Event::Pool(PoolEvent::Acquired { .. }))));
        assert!(events.iter().any(|e| matches!(e, Event::Pool(PoolEvent::Closed { .. }))));
    }
}
