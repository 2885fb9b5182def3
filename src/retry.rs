//! Retry policy for calls to overloaded upstreams.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - An error is retried when it is transient ([`Retryable::is_transient`], or a
//!   custom `should_retry` predicate). Anything else fails immediately with
//!   [`RetryError::Aborted`] and does not consume retry budget.
//! - The delay after the 0-based attempt `n` is `min(max, base * 2^n)` with
//!   jitter applied. A server `retry_after` hint raises the delay to at least
//!   that duration; it never shortens it. Hints beyond [`MAX_BACKOFF`] are
//!   clamped to it.
//! - Running out of attempts yields [`RetryError::Exhausted`] carrying the
//!   attempt count and the most recent failures.
//!
//! ```rust
//! use std::time::Duration;
//! use presspool::{Error, Jitter, RetryPolicy, InstantSleeper};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<Error>::builder()
//!     .max_attempts(3)
//!     .with_jitter(Jitter::None)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), _> = policy
//!     .execute(|| async { Err(Error::from_status(529, "Overloaded", None)) })
//!     .await;
//! assert_eq!(result.unwrap_err().attempts(), 3);
//! # });
//! ```

use crate::classify::Retryable;
use crate::config::RetrySettings;
use crate::error::{RetryError, MAX_RETRY_FAILURES};
use crate::telemetry::{Event, EventBus, RetryEvent};
use crate::backoff::MAX_BACKOFF;
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_layer::Layer;
use tower_service::Service;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retry policy combining backoff, jitter, classification, and a sleeper.
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Predicate<E>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
    label: Option<Arc<str>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
            sleeper: self.sleeper.clone(),
            events: self.events.clone(),
            label: self.label.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("label", &self.label)
            .field("sleeper", &"<sleeper>")
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: Retryable + std::fmt::Display + Send + Sync + 'static,
{
    /// Construct a new builder with defaults (5 attempts, 1s..64s, 0.3 jitter).
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Build from serialized settings.
    pub fn from_settings(settings: &RetrySettings) -> Result<Self, crate::Error> {
        settings.validate()?;
        Self::builder()
            .max_attempts(settings.max_attempts)
            .backoff(settings.backoff()?)
            .with_jitter(settings.jitter())
            .build()
            .map_err(|e| crate::Error::InvalidConfig { message: e.to_string() })
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Same policy, with log lines and events tagged by `label`.
    pub fn labeled(&self, label: &str) -> Self {
        Self { label: Some(Arc::from(label)), ..self.clone() }
    }

    /// Same policy, reporting retry events to `events`.
    pub fn with_events(&self, events: EventBus) -> Self {
        Self { events, ..self.clone() }
    }

    /// Delay before the attempt following the failed 0-based `attempt`.
    pub fn delay_for(&self, attempt: usize, error: &E) -> Duration {
        let delay = self.jitter.apply(self.backoff.delay(attempt));
        match error.retry_after() {
            Some(hint) if hint > MAX_BACKOFF => {
                tracing::warn!(
                    target: "presspool::retry",
                    service = self.label.as_deref().unwrap_or("unlabeled"),
                    hint_secs = hint.as_secs(),
                    max_secs = MAX_BACKOFF.as_secs(),
                    "retry-after hint clamped"
                );
                delay.max(MAX_BACKOFF)
            }
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, RetryError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures: VecDeque<E> = VecDeque::new();
        let started = Instant::now();
        let label = self.label.as_deref().unwrap_or("unlabeled");

        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !(self.should_retry)(&e) {
                        return Err(RetryError::Aborted { attempts: attempt + 1, error: e });
                    }

                    if attempt + 1 >= self.max_attempts {
                        tracing::error!(
                            target: "presspool::retry",
                            service = label,
                            attempts = self.max_attempts,
                            error = %e,
                            "retry budget exhausted"
                        );
                        self.events.emit(Event::Retry(RetryEvent::Exhausted {
                            total_attempts: self.max_attempts,
                            total_duration: started.elapsed(),
                        }));
                        failures.push_back(e);
                        return Err(RetryError::exhausted(
                            self.max_attempts,
                            failures.into_iter().collect(),
                        ));
                    }

                    let delay = self.delay_for(attempt, &e);
                    tracing::warn!(
                        target: "presspool::retry",
                        service = label,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient upstream failure, backing off"
                    );
                    self.events
                        .emit(Event::Retry(RetryEvent::Attempt { attempt: attempt + 1, delay }));

                    failures.push_back(e);
                    while failures.len() > MAX_RETRY_FAILURES {
                        failures.pop_front();
                    }

                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // Only reachable when max_attempts is 0, which the builder forbids.
        Err(RetryError::exhausted(self.max_attempts, failures.into_iter().collect()))
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Predicate<E>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
    label: Option<Arc<str>>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl<E> RetryPolicyBuilder<E>
where
    E: Retryable + std::fmt::Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
            jitter: Jitter::default(),
            should_retry: Arc::new(|e: &E| e.is_transient()),
            sleeper: Arc::new(TokioSleeper),
            events: EventBus::disabled(),
            label: None,
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff<B>(mut self, backoff: B) -> Self
    where
        B: Into<Backoff>,
    {
        self.backoff = backoff.into();
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the default transient-error classification.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(Arc::from(label));
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            events: self.events,
            label: self.label,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: Retryable + std::fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Tower layer applying a [`RetryPolicy`] to every request.
pub struct RetryLayer<E> {
    policy: RetryPolicy<E>,
}

impl<E> RetryLayer<E> {
    pub fn new(policy: RetryPolicy<E>) -> Self {
        Self { policy }
    }
}

impl<E> Clone for RetryLayer<E> {
    fn clone(&self) -> Self {
        Self { policy: self.policy.clone() }
    }
}

impl<S, E> Layer<S> for RetryLayer<E> {
    type Service = RetryService<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService { inner, policy: self.policy.clone() }
    }
}

/// Service produced by [`RetryLayer`].
pub struct RetryService<S, E> {
    inner: S,
    policy: RetryPolicy<E>,
}

impl<S: Clone, E> Clone for RetryService<S, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), policy: self.policy.clone() }
    }
}

impl<S, E, Request> Service<Request> for RetryService<S, E>
where
    Request: Clone + Send + Sync + 'static,
    S: Service<Request, Error = E> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
    E: Retryable + std::fmt::Display + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = RetryError<E>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|e| RetryError::Aborted { attempts: 0, error: e })
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let policy = self.policy.clone();
        // Take the readied service and leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let inner = futures::lock::Mutex::new(inner);
            policy
                .execute(|| {
                    let req = req.clone();
                    let inner = &inner;
                    async move {
                        let mut svc = inner.lock().await;
                        futures::future::poll_fn(|cx| svc.poll_ready(cx)).await?;
                        svc.call(req).await
                    }
                })
                .await
        })
    }
}
