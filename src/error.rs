//! Error types shared by pools, caches, retry, and the HTTP path.
//!
//! The taxonomy is flat on purpose: callers match on one enum regardless of
//! which layer produced the failure.
//!
//! - `PoolClosed` / `UnknownService` / `InvalidConfig`: fatal, never retried.
//! - `UpstreamOverloaded` (429/529-class) and `Timeout`: transient, retried by
//!   [`RetryPolicy`](crate::RetryPolicy) when wrapped.
//! - `UpstreamRejected`: fatal for the call (validation, auth, other 4xx).
//! - `CacheBackendUnavailable`: only ever produced by cache backends; the
//!   [`CacheStore`](crate::CacheStore) logs it and degrades to a miss.
//! - `RetryExhausted`: the single descriptive error surfaced once the retry
//!   budget is spent, naming the service and the attempt count.
use std::sync::Arc;
use std::time::Duration;

use crate::classify;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Cap on failures stored inside [`RetryError::Exhausted`].
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for the pool, cache, retry, and request layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The pool (or the whole registry) was shut down.
    #[error("pool for service '{service}' is closed")]
    PoolClosed { service: String },
    /// No pool is configured under this name.
    #[error("no pool configured for service '{service}'")]
    UnknownService { service: String },
    /// Upstream signalled overload or temporary unavailability.
    #[error("upstream overloaded{}: {message}", status_suffix(.status))]
    UpstreamOverloaded { status: Option<u16>, message: String, retry_after: Option<Duration> },
    /// Upstream refused the request for a reason that retrying cannot fix.
    #[error("upstream rejected request{}: {message}", status_suffix(.status))]
    UpstreamRejected { status: Option<u16>, message: String },
    /// The call did not complete in time.
    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    /// Connection-level failure that carried no overload or timeout signal.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// A cache backend could not be reached or answered garbage.
    #[error("cache backend unavailable: {message}")]
    CacheBackendUnavailable { message: String },
    /// Every attempt failed with a transient error.
    #[error("{service}: retry exhausted after {attempts} attempts; last error: {last}")]
    RetryExhausted { service: String, attempts: usize, last: Box<Error> },
    /// Configuration rejected during startup validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl Error {
    /// Build a classified error from an HTTP status and response text.
    ///
    /// 429 and 529 are always overload. Any other status is overload only when
    /// the message carries overload vocabulary; otherwise it is a rejection.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        if classify::is_overload_status(status) || classify::is_overload_message(&message) {
            Error::UpstreamOverloaded { status: Some(status), message, retry_after }
        } else if status == 408 || status == 504 {
            Error::Timeout { elapsed: Duration::ZERO }
        } else {
            Error::UpstreamRejected { status: Some(status), message }
        }
    }

    /// Build a classified error from a bare message (SDK or socket errors).
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if classify::is_timeout_message(&message) {
            Error::Timeout { elapsed: Duration::ZERO }
        } else if classify::is_overload_message(&message) {
            Error::UpstreamOverloaded { status: None, message, retry_after: None }
        } else {
            Error::UpstreamRejected { status: None, message }
        }
    }

    /// Wrap a final retry outcome, naming the service that was called.
    pub fn from_retry(service: &str, err: RetryError<Error>) -> Self {
        match err {
            RetryError::Exhausted { attempts, failures } => {
                let last = failures.last().cloned().unwrap_or(Error::Transport {
                    message: "no failures recorded".to_string(),
                });
                Error::RetryExhausted { service: service.to_string(), attempts, last: Box::new(last) }
            }
            RetryError::Aborted { error, .. } => error,
        }
    }

    /// `true` for the 429/529/timeout class of failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::UpstreamOverloaded { .. } | Error::Timeout { .. } => true,
            Error::Transport { message } => classify::is_overload_message(message),
            _ => false,
        }
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::UpstreamOverloaded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_pool_closed(&self) -> bool {
        matches!(self, Error::PoolClosed { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Error::RetryExhausted { .. })
    }

    /// Attempts recorded on a `RetryExhausted` error.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Error::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// HTTP status carried by upstream errors, looking through `RetryExhausted`.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::UpstreamOverloaded { status, .. } | Error::UpstreamRejected { status, .. } => {
                *status
            }
            Error::RetryExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Error::Timeout { elapsed: Duration::ZERO };
        }
        if let Some(status) = err.status() {
            return Error::from_status(status.as_u16(), err.to_string(), None);
        }
        if err.is_connect() {
            return Error::Transport { message: err.to_string() };
        }
        Error::from_message(err.to_string())
    }
}

/// Final outcome of a failed [`RetryPolicy::execute`](crate::RetryPolicy::execute).
#[derive(Debug, Clone)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// A non-retryable error stopped the loop early.
    Aborted { attempts: usize, error: E },
}

impl<E> RetryError<E> {
    /// Construct `Exhausted`, keeping only the most recent `MAX_RETRY_FAILURES`.
    pub fn exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        RetryError::Exhausted { attempts, failures: Arc::new(trimmed) }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last underlying error, if one was recorded.
    pub fn last(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { failures, .. } => failures.last(),
            RetryError::Aborted { error, .. } => Some(error),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// Recorded failures (most recent last).
    pub fn failures(&self) -> &[E] {
        match self {
            RetryError::Exhausted { failures, .. } => failures.as_slice(),
            RetryError::Aborted { error, .. } => std::slice::from_ref(error),
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted { attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                match failures.last() {
                    Some(last) => write!(
                        f,
                        "retry exhausted after {} attempts{}; last error: {}",
                        attempts, truncated_note, last
                    ),
                    None => write!(
                        f,
                        "retry exhausted after {} attempts{}; no recorded failures",
                        attempts, truncated_note
                    ),
                }
            }
            RetryError::Aborted { attempts, error } => {
                write!(f, "non-retryable error on attempt {}: {}", attempts, error)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last().map(|e| e as &dyn std::error::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn overload_statuses_are_transient() {
        let err = Error::from_status(529, "Overloaded", None);
        assert!(err.is_transient());
        let err = Error::from_status(429, "slow down", Some(Duration::from_secs(3)));
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn other_client_errors_are_fatal() {
        assert!(!Error::from_status(400, "bad prompt", None).is_transient());
        assert!(!Error::from_status(401, "invalid x-api-key", None).is_transient());
        assert!(!Error::from_status(404, "not found", None).is_transient());
    }

    #[test]
    fn server_errors_use_message_vocabulary() {
        assert!(Error::from_status(503, "Service Unavailable", None).is_transient());
        assert!(!Error::from_status(500, "internal error", None).is_transient());
    }

    #[test]
    fn message_classification() {
        assert!(matches!(Error::from_message("connect ETIMEDOUT"), Error::Timeout { .. }));
        assert!(Error::from_message("Rate limit reached for requests").is_transient());
        assert!(!Error::from_message("prompt is too long").is_transient());
    }

    #[test]
    fn display_names_status() {
        let msg = Error::from_status(529, "Overloaded", None).to_string();
        assert!(msg.contains("HTTP 529"), "{msg}");
        let msg = Error::from_message("busy").to_string();
        assert!(!msg.contains("HTTP"), "{msg}");
    }

    #[test]
    fn from_retry_names_service_and_attempts() {
        let retry = RetryError::exhausted(
            5,
            vec![Error::from_status(529, "Overloaded", None); 5],
        );
        let err = Error::from_retry("text-generation", retry);
        assert_eq!(err.attempts(), Some(5));
        assert_eq!(err.status(), Some(529));
        let msg = err.to_string();
        assert!(msg.starts_with("text-generation: retry exhausted after 5 attempts"), "{msg}");
    }

    #[test]
    fn from_retry_unwraps_aborted() {
        let retry = RetryError::Aborted { attempts: 1, error: Error::from_status(400, "bad", None) };
        let err = Error::from_retry("search", retry);
        assert!(matches!(err, Error::UpstreamRejected { status: Some(400), .. }));
    }

    #[test]
    fn exhausted_caps_failures() {
        let retry: RetryError<Error> = RetryError::exhausted(
            25,
            (0..25).map(|i| Error::Transport { message: format!("fail {i}") }).collect(),
        );
        assert_eq!(retry.failures().len(), MAX_RETRY_FAILURES);
        let msg = retry.to_string();
        assert!(msg.contains("recorded last 10 failures"), "{msg}");
        assert!(msg.contains("fail 24"), "{msg}");
    }

    #[test]
    fn exhausted_display_handles_empty_failures() {
        let retry: RetryError<Error> = RetryError::exhausted(3, vec![]);
        assert!(retry.to_string().contains("no recorded failures"));
        assert!(retry.source().is_none());
    }
}
