//! Named connection pools, created lazily on first use.
//!
//! The registry owns one [`ConnectionPool`] per configured client-kind
//! service. Pools are built on the first `acquire` for their name, using a
//! [`ClientFactory`] to create `capacity` clients. HTTP-kind services are
//! served by [`HttpPools`](crate::HttpPools) instead and are rejected here.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::config::{PoolSettings, ServiceConfig, ServiceKind};
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::telemetry::EventBus;
use crate::{Error, Result};

/// Creates the clients that back a pool.
pub trait ClientFactory<C>: Send + Sync {
    /// Build client number `id` (0-based) for `service`.
    fn create(&self, service: &str, config: &ServiceConfig, id: usize) -> Result<C>;
}

impl<C, F> ClientFactory<C> for F
where
    F: Fn(&str, &ServiceConfig, usize) -> Result<C> + Send + Sync,
{
    fn create(&self, service: &str, config: &ServiceConfig, id: usize) -> Result<C> {
        self(service, config, id)
    }
}

/// Lazily populated map of service name to pool.
pub struct PoolRegistry<C: Clone> {
    settings: PoolSettings,
    factory: Arc<dyn ClientFactory<C>>,
    pools: RwLock<HashMap<String, ConnectionPool<C>>>,
    closed: AtomicBool,
    events: EventBus,
}

impl<C: Clone> fmt::Debug for PoolRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("services", &self.settings.services.keys().collect::<Vec<_>>())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<C> PoolRegistry<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Validate `settings` and build an empty registry.
    pub fn new<F>(settings: PoolSettings, factory: F) -> Result<Self>
    where
        F: ClientFactory<C> + 'static,
    {
        settings.validate()?;
        Ok(Self {
            settings,
            factory: Arc::new(factory),
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            events: EventBus::disabled(),
        })
    }

    /// Report pool activity to `events`. Affects pools created afterwards.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Pool for `service`, creating it on first use.
    pub fn pool(&self, service: &str) -> Result<ConnectionPool<C>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed { service: service.to_string() });
        }
        if let Some(pool) = self.pools.read().unwrap_or_else(PoisonError::into_inner).get(service) {
            return Ok(pool.clone());
        }

        let config = self
            .settings
            .service(service)
            .ok_or_else(|| Error::UnknownService { service: service.to_string() })?;
        if config.kind != ServiceKind::Client {
            return Err(Error::InvalidConfig {
                message: format!("service '{service}' is an http service; use HttpPools"),
            });
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have built it while we waited for the write lock.
        if let Some(pool) = pools.get(service) {
            return Ok(pool.clone());
        }
        // Re-check under the write lock so a concurrent close() cannot miss us.
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed { service: service.to_string() });
        }
        let clients = (0..config.capacity)
            .map(|id| self.factory.create(service, config, id))
            .collect::<Result<Vec<_>>>()?;
        let pool = ConnectionPool::with_events(service, clients, self.events.clone())?;
        info!(
            target: "presspool::pool",
            service,
            capacity = config.capacity,
            "connection pool created"
        );
        pools.insert(service.to_string(), pool.clone());
        Ok(pool)
    }

    /// Take a connection for `service`, waiting in FIFO order if needed.
    pub async fn acquire(&self, service: &str) -> Result<PooledConnection<C>> {
        self.pool(service)?.acquire().await
    }

    /// Stats for every pool created so far, sorted by service name.
    pub fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<_> = pools.values().map(ConnectionPool::stats).collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Close every pool. Later `acquire` calls fail with `PoolClosed`.
    pub fn close(&self) {
        let pools = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *pools)
        };
        for pool in pools.values() {
            pool.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
