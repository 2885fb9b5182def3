//! Cache-aware batch processing with bounded concurrency.
//!
//! [`BatchProcessor::process`] runs a work function over a list of items and
//! returns one [`BatchItem`] per input, in input order. Each item is looked
//! up in the cache first (keyed by the item itself under the batch
//! namespace); only misses invoke the work function, and successes are
//! written back. A failing item records its error message and never aborts
//! the rest of the batch.
//!
//! Two schedules are available:
//! - [`Schedule::Waves`] (default): items run in groups of `concurrency`, and
//!   a group fully settles before the next one starts.
//! - [`Schedule::SlidingWindow`]: up to `concurrency` items are in flight at
//!   all times; a new one starts as soon as any finishes.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::CacheStore;

const DEFAULT_CONCURRENCY: usize = 5;

type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// How items are scheduled against the concurrency limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Schedule {
    #[default]
    Waves,
    SlidingWindow,
}

/// Options for one batch run.
#[derive(Clone)]
pub struct BatchOptions {
    pub namespace: String,
    pub concurrency: usize,
    /// Cache TTL for fresh results; the store's default when `None`.
    pub ttl: Option<Duration>,
    pub schedule: Schedule,
    on_progress: Option<ProgressFn>,
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("namespace", &self.namespace)
            .field("concurrency", &self.concurrency)
            .field("ttl", &self.ttl)
            .field("schedule", &self.schedule)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl BatchOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            concurrency: DEFAULT_CONCURRENCY,
            ttl: None,
            schedule: Schedule::default(),
            on_progress: None,
        }
    }

    /// Values below 1 are treated as 1.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Called with `(completed, total)` after each item settles.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

/// Outcome for one input item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem<I, T> {
    pub item: I,
    /// The work result, or the failure's message.
    pub outcome: Result<T, String>,
    /// `true` when served from the cache without running the work.
    pub cached: bool,
}

impl<I, T> BatchItem<I, T> {
    pub fn result(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

struct Progress {
    completed: Mutex<usize>,
    total: usize,
    callback: Option<ProgressFn>,
}

impl Progress {
    /// Count one settled item. The lock keeps reported counts strictly increasing.
    fn tick(&self) {
        let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        *completed += 1;
        if let Some(callback) = &self.callback {
            callback(*completed, self.total);
        }
    }
}

/// Runs batches against a shared cache.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    cache: CacheStore,
}

impl BatchProcessor {
    pub fn new(cache: CacheStore) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Process `items` with `work`; `results[i]` always belongs to `items[i]`.
    pub async fn process<I, T, E, F, Fut>(
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
        let total = items.len();
        let concurrency = options.concurrency.max(1);
        let progress = Progress { completed: Mutex::new(0), total, callback: options.on_progress.clone() };
        let started = Instant::now();

        let results: Vec<BatchItem<I, T>> = match options.schedule {
            Schedule::Waves => {
                let mut results = Vec::with_capacity(total);
                let mut items = items.into_iter().peekable();
                while items.peek().is_some() {
                    let wave: Vec<_> = items
                        .by_ref()
                        .take(concurrency)
                        .map(|item| self.run_one(item, &work, options, &progress))
                        .collect();
                    results.extend(futures::future::join_all(wave).await);
                }
                results
            }
            Schedule::SlidingWindow => {
                stream::iter(items)
                    .map(|item| self.run_one(item, &work, options, &progress))
                    .buffered(concurrency)
                    .collect()
                    .await
            }
        };

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        let cached = results.iter().filter(|r| r.cached).count();
        info!(
            target: "presspool::batch",
            namespace = %options.namespace,
            total,
            cached,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        results
    }

    async fn run_one<I, T, E, F, Fut>(
        &self,
        item: I,
        work: &F,
        options: &BatchOptions,
        progress: &Progress,
    ) -> BatchItem<I, T>
    where
        I: Serialize + Clone,
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.cache.get::<I, T>(&options.namespace, &item).await {
            progress.tick();
            return BatchItem { item, outcome: Ok(hit), cached: true };
        }

        let outcome = match work(item.clone()).await {
            Ok(value) => {
                let ttl = options.ttl.unwrap_or_else(|| self.cache.default_ttl());
                self.cache.set(&options.namespace, &item, &value, ttl).await;
                Ok(value)
            }
            Err(e) => {
                debug!(
                    target: "presspool::batch",
                    namespace = %options.namespace,
                    error = %e,
                    "batch item failed"
                );
                Err(e.to_string())
            }
        };
        progress.tick();
        BatchItem { item, outcome, cached: false }
    }
}
