//! Convenient re-exports for common presspool types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    batch::{BatchItem, BatchOptions, Schedule},
    cache::{CacheBackend, CacheStore},
    config::{CacheSettings, CredentialRef, PoolSettings, RetrySettings, ServiceConfig, ServiceKind},
    http::RequestSpec,
    hub::{Hub, HubStats},
    jitter::Jitter,
    pool::PooledConnection,
    retry::{RetryLayer, RetryPolicy},
    Error, Result, RetryError, Retryable,
};
