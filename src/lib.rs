#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # presspool
//!
//! Backpressure and resilience for pipelines that lean on rate-limited AI
//! upstreams: text generation, image generation, search.
//!
//! ## Features
//!
//! - **Connection pools** with a fixed number of clients per service and a
//!   strictly FIFO wait queue; callers wait instead of being rejected
//! - **HTTP pools** with a shared keep-alive client and an in-flight ceiling
//! - **Retry policies** with capped exponential backoff, proportional jitter,
//!   and overload classification (429, 529, overload wording, timeouts)
//! - **TTL cache** with deterministic keys, a REST key-value backend or an
//!   in-process map, and failures that degrade to misses
//! - **Batch processing** that preserves input order, skips cached items,
//!   and isolates per-item failures
//! - **Telemetry** as typed events delivered to `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use presspool::config::{PoolSettings, ServiceConfig};
//! use presspool::{BatchOptions, Hub, Result};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = Hub::builder(
//!         PoolSettings::publishing_defaults(),
//!         |service: &str, _: &ServiceConfig, id: usize| -> Result<String> {
//!             Ok(format!("{service}#{id}"))
//!         },
//!     )
//!     .build()
//!     .unwrap();
//!
//!     let chapters = hub
//!         .batch_on(
//!             "text-generation",
//!             vec!["Owls", "Ravens", "Herons"],
//!             |topic, client| async move { Ok(format!("{topic} (written by {client})")) },
//!             &BatchOptions::new("chapter").concurrency(2),
//!         )
//!         .await;
//!     assert_eq!(chapters.len(), 3);
//!     assert!(chapters[0].result().unwrap().starts_with("Owls"));
//! }
//! ```

pub mod backoff;
pub mod batch;
pub mod cache;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod jitter;
pub mod pool;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use backoff::Backoff;
pub use batch::{BatchItem, BatchOptions, BatchProcessor, Schedule};
pub use cache::{derive_key, CacheBackend, CacheStats, CacheStore, MemoryBackend, RemoteBackend};
pub use classify::Retryable;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{Error, Result, RetryError};
pub use http::{HttpPools, HttpResponse, HttpStats, RequestSpec};
pub use hub::{Hub, HubBuilder, HubStats};
pub use jitter::Jitter;
pub use pool::{ConnectionInfo, ConnectionPool, PoolStats, PooledConnection};
pub use registry::{ClientFactory, PoolRegistry};
pub use retry::{BuildError, RetryLayer, RetryPolicy, RetryPolicyBuilder, RetryService};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use telemetry::{Event, EventBus, LogSink, MemorySink, NullSink, TelemetrySink};
