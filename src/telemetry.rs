//! Telemetry events and sinks.
//!
//! Pools, retry loops, the cache, and the HTTP path describe what they do as
//! typed [`Event`]s. Events flow to a sink, which is any
//! `tower::Service<Event>`; the built-ins log, discard, or buffer them.
//!
//! Producers never await a sink. They hand events to an [`EventBus`], which
//! pushes into a bounded channel drained by a background task and counts
//! whatever it had to drop.
//!
//! ```rust
//! use presspool::telemetry::{Event, PoolEvent};
//!
//! let event = Event::Pool(PoolEvent::Queued { service: "images".into(), waiting: 3 });
//! assert_eq!(event.to_string(), "Pool::Queued(images, waiting=3)");
//! ```

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes events.
pub trait TelemetrySink:
    tower::Service<Event, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Everything the crate reports.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Pool(PoolEvent),
    Retry(RetryEvent),
    Cache(CacheEvent),
    Request(RequestOutcome),
}

/// Connection pool activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A caller received a connection.
    Acquired { service: String, connection_id: usize, active: usize, capacity: usize },
    /// A caller found every connection busy and joined the wait queue.
    Queued { service: String, waiting: usize },
    /// A connection came back; `handed_off` when it went straight to a waiter.
    Released { service: String, connection_id: usize, handed_off: bool },
    /// The pool shut down, failing `dropped_waiters` suspended callers.
    Closed { service: String, dropped_waiters: usize },
}

/// Retry loop activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A transient failure is about to be retried after `delay`.
    Attempt {
        /// 1-indexed number of the attempt that failed.
        attempt: usize,
        delay: Duration,
    },
    /// The attempt budget ran out.
    Exhausted { total_attempts: usize, total_duration: Duration },
}

/// Cache activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { namespace: String },
    Miss { namespace: String },
    /// The backend failed; the operation degraded to a miss or no-op.
    BackendError { operation: &'static str },
}

/// Outcome of one HTTP request made through a service pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { service: String, status: u16, duration: Duration },
    Failure { service: String, status: Option<u16>, duration: Duration },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Pool(event) => write!(f, "Pool::{}", event),
            Event::Retry(event) => write!(f, "Retry::{}", event),
            Event::Cache(event) => write!(f, "Cache::{}", event),
            Event::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::Acquired { service, connection_id, active, capacity } => {
                write!(f, "Acquired({}#{}, {}/{})", service, connection_id, active, capacity)
            }
            PoolEvent::Queued { service, waiting } => {
                write!(f, "Queued({}, waiting={})", service, waiting)
            }
            PoolEvent::Released { service, connection_id, handed_off } => {
                write!(f, "Released({}#{}, handed_off={})", service, connection_id, handed_off)
            }
            PoolEvent::Closed { service, dropped_waiters } => {
                write!(f, "Closed({}, dropped_waiters={})", service, dropped_waiters)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { namespace } => write!(f, "Hit({})", namespace),
            CacheEvent::Miss { namespace } => write!(f, "Miss({})", namespace),
            CacheEvent::BackendError { operation } => write!(f, "BackendError({})", operation),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { service, status, duration } => {
                write!(f, "Success({}, status={}, duration={:?})", service, status, duration)
            }
            RequestOutcome::Failure { service, status, duration } => match status {
                Some(status) => {
                    write!(f, "Failure({}, status={}, duration={:?})", service, status, duration)
                }
                None => write!(f, "Failure({}, duration={:?})", service, duration),
            },
        }
    }
}

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<Event> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: Event) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing` at DEBUG level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<Event> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Event) -> Self::Future {
        tracing::debug!(target: "presspool::telemetry", event = %event, "presspool_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory (default cap: 10,000).
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Oldest events are evicted once `capacity` is exceeded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// How many events were pushed out by the capacity bound.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn push(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.capacity {
                events.remove(0);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            events.push(event);
        }
    }
}

impl Service<Event> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Event) -> Self::Future {
        self.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Non-blocking hand-off from producers to a sink.
///
/// `emit` never waits: events go into a bounded queue and are dropped (and
/// counted) when it is full. A disabled bus discards everything.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: Option<tokio::sync::mpsc::Sender<Event>>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::disabled()
    }
}

impl EventBus {
    /// A bus that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Spawn a worker that drains events into `sink`. Must be called inside a
    /// tokio runtime.
    pub fn spawn<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<Event, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            use tower::ServiceExt;
            let mut sink = sink;
            while let Some(event) = rx.recv().await {
                if let Ok(ready) = sink.ready().await {
                    let _ = ready.call(event).await;
                }
            }
        });
        Self { tx: Some(tx), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Queue an event without waiting.
    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Events lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
