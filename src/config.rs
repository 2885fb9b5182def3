//! Typed configuration for service pools, the cache, and retry defaults.
//!
//! Everything is validated once at startup. Credentials are never written
//! inline: a [`CredentialRef`] names where the secret lives and is resolved
//! only when a request is built.
//!
//! ```rust
//! use presspool::config::PoolSettings;
//!
//! let settings = PoolSettings::from_json_str(r#"{
//!     "services": {
//!         "text-generation": { "capacity": 5, "timeout_ms": 120000 },
//!         "search": { "kind": "http", "capacity": 2,
//!                     "base_url": "https://search.example.com",
//!                     "credential": { "env": "SEARCH_API_KEY" } }
//!     }
//! }"#).unwrap();
//! assert_eq!(settings.service("text-generation").unwrap().capacity, 5);
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{Backoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::jitter::{Jitter, DEFAULT_JITTER_FACTOR};
use crate::{Error, Result};

/// Text generation upstreams tolerate the most concurrency.
pub const TEXT_GENERATION_CAPACITY: usize = 5;
/// Image generation is slower and more aggressively rate limited.
pub const IMAGE_GENERATION_CAPACITY: usize = 3;
/// Search APIs get the smallest share.
pub const SEARCH_CAPACITY: usize = 2;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CACHE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;
const DEFAULT_PRUNE_THRESHOLD: usize = 1_000;

/// Environment variable holding the remote cache endpoint.
pub const CACHE_URL_ENV: &str = "PRESSPOOL_CACHE_URL";
/// Environment variable naming the variable that holds the cache token.
pub const CACHE_TOKEN_VAR_ENV: &str = "PRESSPOOL_CACHE_TOKEN_VAR";

/// Where a secret can be read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRef {
    /// Name of an environment variable.
    Env(String),
    /// Path to a file whose trimmed contents are the secret.
    File(PathBuf),
}

impl CredentialRef {
    /// Read the secret. Fails with `InvalidConfig` if it is missing or empty.
    pub fn resolve(&self) -> Result<String> {
        let value = match self {
            CredentialRef::Env(var) => std::env::var(var).map_err(|_| Error::InvalidConfig {
                message: format!("credential variable {var} is not set"),
            })?,
            CredentialRef::File(path) => {
                std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
                    message: format!("credential file {}: {e}", path.display()),
                })?
            }
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(Error::InvalidConfig { message: format!("credential {self} is empty") });
        }
        Ok(value)
    }
}

impl std::fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialRef::Env(var) => write!(f, "env:{var}"),
            CredentialRef::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// How a service's capacity is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Fixed set of clients handed out through a FIFO wait queue.
    #[default]
    Client,
    /// Shared HTTP client with a socket ceiling and no explicit queue.
    Http,
}

/// Settings for one named upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Pool size (or socket ceiling for `http` services).
    pub capacity: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    /// Header the credential is sent in; `Authorization: Bearer` when unset.
    #[serde(default)]
    pub credential_header: Option<String>,
    #[serde(default)]
    pub kind: ServiceKind,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ServiceConfig {
    /// Client-kind service with the default timeout.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            base_url: None,
            credential: None,
            credential_header: None,
            kind: ServiceKind::Client,
        }
    }

    /// HTTP-kind service rooted at `base_url`.
    pub fn http(capacity: usize, base_url: impl Into<String>) -> Self {
        Self { base_url: Some(base_url.into()), kind: ServiceKind::Http, ..Self::with_capacity(capacity) }
    }

    pub fn credential(mut self, credential: CredentialRef) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn credential_header(mut self, header: impl Into<String>) -> Self {
        self.credential_header = Some(header.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the invariants for a service named `name`.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.capacity == 0 {
            return Err(invalid(format!("service '{name}': capacity must be a positive integer")));
        }
        if self.timeout_ms == 0 {
            return Err(invalid(format!("service '{name}': timeout_ms must be > 0")));
        }
        if self.kind == ServiceKind::Http && self.base_url.is_none() {
            return Err(invalid(format!("service '{name}': http services need a base_url")));
        }
        if let Some(url) = &self.base_url {
            if reqwest::Url::parse(url).is_err() {
                return Err(invalid(format!("service '{name}': base_url '{url}' is not a URL")));
            }
        }
        Ok(())
    }
}

/// All configured services, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl PoolSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: PoolSettings = serde_json::from_str(json)
            .map_err(|e| invalid(format!("pool settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Text generation, image generation, and search with their usual capacities.
    pub fn publishing_defaults() -> Self {
        Self::new()
            .with_service("text-generation", ServiceConfig::with_capacity(TEXT_GENERATION_CAPACITY).timeout_ms(300_000))
            .with_service("image-generation", ServiceConfig::with_capacity(IMAGE_GENERATION_CAPACITY).timeout_ms(120_000))
            .with_service("search", ServiceConfig::with_capacity(SEARCH_CAPACITY).timeout_ms(30_000))
    }

    pub fn with_service(mut self, name: impl Into<String>, config: ServiceConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, config) in &self.services {
            if name.trim().is_empty() {
                return Err(invalid("service names must not be empty".to_string()));
            }
            config.validate(name)?;
        }
        Ok(())
    }
}

/// Remote key-value endpoint for the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCacheConfig {
    pub url: String,
    pub token: CredentialRef,
}

/// Cache store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Remote backend; in-process map when absent.
    #[serde(default)]
    pub remote: Option<RemoteCacheConfig>,
    #[serde(default = "default_cache_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// In-memory entry count that triggers an expiry sweep.
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: usize,
}

fn default_cache_timeout_ms() -> u64 {
    DEFAULT_CACHE_TIMEOUT_MS
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_prune_threshold() -> usize {
    DEFAULT_PRUNE_THRESHOLD
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            remote: None,
            request_timeout_ms: DEFAULT_CACHE_TIMEOUT_MS,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
        }
    }
}

impl CacheSettings {
    /// Read `PRESSPOOL_CACHE_URL` and `PRESSPOOL_CACHE_TOKEN_VAR`; both must be
    /// set for the remote backend to be used.
    pub fn from_env() -> Self {
        let remote = match (std::env::var(CACHE_URL_ENV), std::env::var(CACHE_TOKEN_VAR_ENV)) {
            (Ok(url), Ok(token_var)) if !url.is_empty() && !token_var.is_empty() => {
                Some(RemoteCacheConfig { url, token: CredentialRef::Env(token_var) })
            }
            _ => None,
        };
        Self { remote, ..Self::default() }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(invalid("cache request_timeout_ms must be > 0".to_string()));
        }
        if let Some(remote) = &self.remote {
            if reqwest::Url::parse(&remote.url).is_err() {
                return Err(invalid(format!("cache url '{}' is not a URL", remote.url)));
            }
        }
        Ok(())
    }
}

/// Retry defaults in serializable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("retry max_attempts must be > 0".to_string()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("retry max_delay_ms must be >= base_delay_ms".to_string()));
        }
        if !(0.0..=2.0).contains(&self.jitter_factor) {
            return Err(invalid("retry jitter_factor must be within 0.0..=2.0".to_string()));
        }
        Ok(())
    }

    /// Exponential backoff described by these settings.
    pub fn backoff(&self) -> Result<Backoff> {
        let base = Duration::from_millis(self.base_delay_ms);
        if self.max_delay_ms == 0 {
            return Ok(Backoff::constant(base));
        }
        Backoff::exponential(base)
            .with_max(Duration::from_millis(self.max_delay_ms))
            .map_err(|e| invalid(format!("retry backoff: {e}")))
    }

    pub fn jitter(&self) -> Jitter {
        if self.jitter_factor == 0.0 {
            Jitter::None
        } else {
            Jitter::proportional(self.jitter_factor)
        }
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidConfig { message }
}
