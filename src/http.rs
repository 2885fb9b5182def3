//! HTTP-backed services: one shared client per service, bounded by a socket
//! ceiling instead of a wait queue.
//!
//! Each HTTP-kind service gets a `reqwest::Client` with keep-alive and an
//! idle-per-host limit equal to its capacity, plus a semaphore capping
//! in-flight requests at the same number. Contention is absorbed by the
//! semaphore and the transport; there is no explicit FIFO queue.
//!
//! [`HttpPools::request`] runs one request, records its outcome, and maps
//! non-success statuses into classified [`Error`]s. 429 and 529 become
//! [`Error::UpstreamOverloaded`] carrying the `Retry-After` hint, so a
//! [`RetryPolicy`](crate::RetryPolicy) wrapped around the call waits at least
//! as long as the server asked.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use reqwest::header::RETRY_AFTER;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::classify::parse_retry_after;
use crate::config::{PoolSettings, ServiceConfig, ServiceKind};
use crate::telemetry::{Event, EventBus, RequestOutcome};
use crate::{Error, Result};

const KEEPALIVE: Duration = Duration::from_secs(60);
/// Longest slice of an error body kept in the error message.
const MAX_ERROR_BODY: usize = 512;

/// One request against a service's base URL.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    /// Path (and optional query) relative to the service's `base_url`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), query: Vec::new(), headers: Vec::new(), body: None }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST with a JSON body.
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self { body: Some(body), ..Self::new(Method::POST, path) }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A fully read successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| Error::Transport {
            message: format!("response body is not the expected JSON: {e}"),
        })
    }
}

/// Usage counters for one HTTP service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HttpStats {
    pub service: String,
    pub max_sockets: usize,
    pub in_flight: usize,
    pub requests: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
}

#[derive(Clone)]
struct HttpService {
    name: String,
    config: ServiceConfig,
    base_url: Url,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl HttpService {
    fn build(name: &str, config: &ServiceConfig) -> Result<Self> {
        let raw = config.base_url.as_deref().ok_or_else(|| Error::InvalidConfig {
            message: format!("service '{name}': http services need a base_url"),
        })?;
        let base_url = Url::parse(raw).map_err(|e| Error::InvalidConfig {
            message: format!("service '{name}': base_url '{raw}': {e}"),
        })?;
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.capacity)
            .tcp_keepalive(Some(KEEPALIVE))
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("service '{name}': cannot build http client: {e}"),
            })?;
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            base_url,
            client,
            permits: Arc::new(Semaphore::new(config.capacity)),
            counters: Arc::new(Counters::default()),
        })
    }

    fn stats(&self) -> HttpStats {
        HttpStats {
            service: self.name.clone(),
            max_sockets: self.config.capacity,
            in_flight: self.config.capacity.saturating_sub(self.permits.available_permits()),
            requests: self.counters.requests.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// Shared HTTP clients for every HTTP-kind service.
pub struct HttpPools {
    settings: PoolSettings,
    services: RwLock<HashMap<String, HttpService>>,
    closed: AtomicBool,
    events: EventBus,
}

impl fmt::Debug for HttpPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPools")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl HttpPools {
    pub fn new(settings: PoolSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            services: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            events: EventBus::disabled(),
        })
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Shared client for `service`, built on first use.
    ///
    /// Requests sent directly on this client bypass the in-flight ceiling;
    /// use [`request`](Self::request) to stay within it.
    pub fn client(&self, service: &str) -> Result<reqwest::Client> {
        Ok(self.service(service)?.client)
    }

    /// Send `spec` to `service` and read the whole response.
    pub async fn request(&self, service: &str, spec: RequestSpec) -> Result<HttpResponse> {
        let svc = self.service(service)?;
        let _permit = svc
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed { service: service.to_string() })?;

        let url = svc.base_url.join(&spec.path).map_err(|e| Error::InvalidConfig {
            message: format!("service '{service}': bad request path '{}': {e}", spec.path),
        })?;
        let mut builder = svc.client.request(spec.method.clone(), url);
        if let Some(credential) = &svc.config.credential {
            let secret = credential.resolve()?;
            builder = match &svc.config.credential_header {
                Some(header) => builder.header(header.as_str(), secret),
                None => builder.bearer_auth(secret),
            };
        }
        if !spec.query.is_empty() {
            builder = builder.query(&spec.query);
        }
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        svc.counters.requests.fetch_add(1, Ordering::Relaxed);
        let result = Self::send(builder, started).await;
        let duration = started.elapsed();

        match &result {
            Ok(response) => {
                debug!(
                    target: "presspool::http",
                    service,
                    status = response.status,
                    duration_ms = duration.as_millis() as u64,
                    "request completed"
                );
                self.events.emit(Event::Request(RequestOutcome::Success {
                    service: service.to_string(),
                    status: response.status,
                    duration,
                }));
            }
            Err(err) => {
                svc.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "presspool::http",
                    service,
                    status = err.status(),
                    transient = err.is_transient(),
                    error = %err,
                    "request failed"
                );
                self.events.emit(Event::Request(RequestOutcome::Failure {
                    service: service.to_string(),
                    status: err.status(),
                    duration,
                }));
            }
        }
        result
    }

    async fn send(builder: reqwest::RequestBuilder, started: Instant) -> Result<HttpResponse> {
        let response = builder.send().await.map_err(|e| match e.is_timeout() {
            true => Error::Timeout { elapsed: started.elapsed() },
            false => Error::from(e),
        })?;
        let status_code = response.status();
        let status = status_code.as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.map_err(Error::from)?;

        if (200..300).contains(&status) {
            return Ok(HttpResponse { status, body });
        }
        let message = match body.trim() {
            // The reason phrase carries the overload signal when the body is empty.
            "" => match status_code.canonical_reason() {
                Some(reason) => format!("HTTP {status} {reason}"),
                None => format!("HTTP {status}"),
            },
            text => text.chars().take(MAX_ERROR_BODY).collect(),
        };
        Err(Error::from_status(status, message, retry_after))
    }

    /// Counters for every HTTP service used so far, sorted by name.
    pub fn stats(&self) -> Vec<HttpStats> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<_> = services.values().map(HttpService::stats).collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Drop every client and fail queued and future requests with `PoolClosed`.
    pub fn close(&self) {
        let services = {
            let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *services)
        };
        for svc in services.values() {
            svc.permits.close();
        }
        if !services.is_empty() {
            info!(target: "presspool::http", services = services.len(), "http clients closed");
        }
    }

    fn service(&self, service: &str) -> Result<HttpService> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed { service: service.to_string() });
        }
        if let Some(svc) = self.services.read().unwrap_or_else(PoisonError::into_inner).get(service)
        {
            return Ok(svc.clone());
        }
        let config = self
            .settings
            .service(service)
            .ok_or_else(|| Error::UnknownService { service: service.to_string() })?;
        if config.kind != ServiceKind::Http {
            return Err(Error::InvalidConfig {
                message: format!("service '{service}' is a client pool; use acquire"),
            });
        }

        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed { service: service.to_string() });
        }
        if let Some(svc) = services.get(service) {
            return Ok(svc.clone());
        }
        let svc = HttpService::build(service, config)?;
        info!(
            target: "presspool::http",
            service,
            max_sockets = config.capacity,
            "http client created"
        );
        services.insert(service.to_string(), svc.clone());
        Ok(svc)
    }
}
