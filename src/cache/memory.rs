//! In-process cache backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{matches_pattern, CacheBackend};
use crate::clock::{Clock, MonotonicClock};
use crate::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: u64,
}

/// `HashMap` with lazy expiry.
///
/// Expired entries are invisible to readers and removed when touched. Once
/// the map grows past `prune_threshold` entries, a write sweeps out
/// everything that has expired.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    prune_threshold: usize,
}

impl MemoryBackend {
    pub fn new(prune_threshold: usize) -> Self {
        Self::with_clock(prune_threshold, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(prune_threshold: usize, clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock, prune_threshold }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if now < entry.expires_at => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = self.clock.now_millis();
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut entries = self.lock();
        entries.insert(key.to_string(), Entry { value, expires_at: now.saturating_add(ttl_millis) });
        if entries.len() > self.prune_threshold {
            let before = entries.len();
            entries.retain(|_, entry| now < entry.expires_at);
            debug!(
                target: "presspool::cache",
                pruned = before - entries.len(),
                remaining = entries.len(),
                "expired entries swept"
            );
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = self.clock.now_millis();
        let entries = self.lock();
        Ok(entries
            .iter()
            .filter(|(key, entry)| now < entry.expires_at && matches_pattern(key, pattern))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.len())
    }
}
