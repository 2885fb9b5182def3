//! TTL cache in front of expensive upstream calls.
//!
//! [`CacheStore`] maps a namespace plus a list of key arguments to a JSON
//! value. Storage is delegated to a [`CacheBackend`]: a remote key-value
//! service when one is configured, otherwise an in-process map.
//!
//! Caching is an optimization, never a dependency: every backend failure
//! (error, timeout, undecodable value) is logged, counted, and turned into a
//! miss or a no-op write. Callers of `get`/`set`/`del`/`clear` never see it.
//!
//! Keys are `"{namespace}:{digest}"` where `digest` is the first 32 hex
//! characters of the SHA-256 of the JSON-encoded arguments joined with `:`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::telemetry::{CacheEvent, Event, EventBus};
use crate::{Error, Result};

pub mod memory;
pub mod remote;

pub use memory::MemoryBackend;
pub use remote::RemoteBackend;

const DIGEST_HEX_LEN: usize = 32;

/// Storage used by [`CacheStore`]. Values are opaque strings.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Short name for logs and stats.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Live keys matching `pattern`; a trailing `*` matches any suffix.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Number of stored entries, when cheap to know.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Counters reported by [`CacheStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub errors: u64,
    /// Entries held in process; `None` for remote backends.
    pub entries: Option<usize>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

/// Namespaced, failure-tolerant cache. Cheap to clone.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    request_timeout: Duration,
    default_ttl: Duration,
    counters: Arc<Counters>,
    events: EventBus,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .field("request_timeout", &self.request_timeout)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, settings: &CacheSettings) -> Self {
        Self {
            backend,
            request_timeout: settings.request_timeout(),
            default_ttl: settings.default_ttl(),
            counters: Arc::new(Counters::default()),
            events: EventBus::disabled(),
        }
    }

    /// In-process store with default settings.
    pub fn in_memory() -> Self {
        let settings = CacheSettings::default();
        Self::new(Arc::new(MemoryBackend::new(settings.prune_threshold)), &settings)
    }

    /// Remote backend when `settings.remote` is set, in-process map otherwise.
    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        settings.validate()?;
        let backend: Arc<dyn CacheBackend> = match &settings.remote {
            Some(remote) => Arc::new(RemoteBackend::new(remote, settings.request_timeout())?),
            None => Arc::new(MemoryBackend::new(settings.prune_threshold)),
        };
        Ok(Self::new(backend, settings))
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// TTL used when a caller does not pick one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Look up a value. Backend failures and undecodable values read as a miss.
    pub async fn get<K, T>(&self, namespace: &str, args: &K) -> Option<T>
    where
        K: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let key = self.key_or_log(namespace, args)?;
        let raw = self.guarded("get", self.backend.get(&key)).await.flatten();
        let value = raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target: "presspool::cache", key = %key, error = %e, "cached value does not decode");
                None
            }
        });

        let namespace = namespace.to_string();
        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.events.emit(Event::Cache(CacheEvent::Hit { namespace }));
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.events.emit(Event::Cache(CacheEvent::Miss { namespace }));
        }
        value
    }

    /// Store `value` for `ttl`, overwriting any existing entry.
    pub async fn set<K, V>(&self, namespace: &str, args: &K, value: &V, ttl: Duration)
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let Some(key) = self.key_or_log(namespace, args) else { return };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target: "presspool::cache", key = %key, error = %e, "value does not serialize; not cached");
                return;
            }
        };
        if self.guarded("set", self.backend.set(&key, raw, ttl)).await.is_some() {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove one entry.
    pub async fn del<K>(&self, namespace: &str, args: &K)
    where
        K: Serialize + ?Sized,
    {
        let Some(key) = self.key_or_log(namespace, args) else { return };
        if self.guarded("del", self.backend.del(&key)).await.is_some() {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every entry under `namespace`.
    pub async fn clear(&self, namespace: &str) {
        let pattern = format!("{namespace}:*");
        let Some(keys) = self.guarded("keys", self.backend.keys(&pattern)).await else { return };
        let mut removed = 0u64;
        for key in keys {
            if self.guarded("del", self.backend.del(&key)).await.is_some() {
                removed += 1;
            }
        }
        self.counters.deletes.fetch_add(removed, Ordering::Relaxed);
        debug!(target: "presspool::cache", namespace, removed, "namespace cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            backend: self.backend.name(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            entries: self.backend.len_hint(),
        }
    }

    /// Run a backend call under the request timeout; `None` on any failure.
    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let err = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => err,
            Err(_) => Error::CacheBackendUnavailable {
                message: format!("{operation} timed out after {:?}", self.request_timeout),
            },
        };
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: "presspool::cache",
            backend = self.backend.name(),
            operation,
            error = %err,
            "cache backend failure ignored"
        );
        self.events.emit(Event::Cache(CacheEvent::BackendError { operation }));
        None
    }

    fn key_or_log<K>(&self, namespace: &str, args: &K) -> Option<String>
    where
        K: Serialize + ?Sized,
    {
        match derive_key(namespace, args) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(target: "presspool::cache", namespace, error = %e, "key arguments do not serialize");
                None
            }
        }
    }
}

/// Build the storage key for `namespace` and `args`.
///
/// A JSON array contributes each element in order; any other value counts
/// as a single argument. Identical inputs always give identical keys.
pub fn derive_key<K>(namespace: &str, args: &K) -> Result<String>
where
    K: Serialize + ?Sized,
{
    let value = serde_json::to_value(args).map_err(|e| Error::InvalidConfig {
        message: format!("cache key arguments: {e}"),
    })?;
    let parts: Vec<String> = match &value {
        serde_json::Value::Array(items) => items.iter().map(|item| item.to_string()).collect(),
        other => vec![other.to_string()],
    };
    let digest = Sha256::digest(parts.join(":").as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    Ok(format!("{namespace}:{}", &hex[..DIGEST_HEX_LEN]))
}

/// `true` when `key` matches `pattern` (exact, or prefix with trailing `*`).
pub(crate) fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
