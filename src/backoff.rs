//! Backoff schedules for retry policies.
//!
//! Attempt semantics: `attempt` is the 0-based index of the attempt that just
//! failed, so `delay(0)` is the wait before the second call. Exponential delay
//! is `min(max, base * 2^attempt)`; computations that would overflow saturate
//! to `MAX_BACKOFF`.
//!
//! ```rust
//! use std::time::Duration;
//! use presspool::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_secs(1))
//!     .with_max(Duration::from_secs(64))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_secs(1));
//! assert_eq!(backoff.delay(3), Duration::from_secs(8));
//! assert_eq!(backoff.delay(10), Duration::from_secs(64)); // capped
//! ```

use std::fmt;
use std::time::Duration;

/// Ceiling applied when a computation would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Default first delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(64);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, max: Duration },
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Default for Backoff {
    /// Exponential from 1s, capped at 64s.
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential { base: DEFAULT_BASE_DELAY, max: DEFAULT_MAX_DELAY },
        }
    }
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Doubling delay starting at `base`, capped only by `MAX_BACKOFF` until
    /// [`with_max`](Self::with_max) is applied.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, max: MAX_BACKOFF } }
    }

    /// Cap exponential growth at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = max.min(MAX_BACKOFF);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Delay to wait after the 0-based `attempt` failed.
    pub fn delay(&self, attempt: usize) -> Duration {
        match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Exponential { base, max } => {
                let exponent = attempt.min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let capped = nanos.min(max.as_nanos()).min(MAX_BACKOFF.as_nanos());
                Duration::from_nanos(capped as u64)
            }
        }
    }

    /// Configured cap (the constant delay for constant backoff).
    pub fn max_delay(&self) -> Duration {
        match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Exponential { max, .. } => *max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_schedule() {
        let backoff = Backoff::default();
        let expected = [1, 2, 4, 8, 16, 32, 64, 64];
        for (attempt, secs) in expected.iter().enumerate() {
            assert_eq!(backoff.delay(attempt), Duration::from_secs(*secs), "attempt {attempt}");
        }
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_millis(1000))
            .unwrap();
        let mut previous = backoff.delay(0);
        for attempt in 1..10 {
            let next = backoff.delay(attempt);
            if next < Duration::from_millis(1000) {
                assert_eq!(next, previous * 2);
            } else {
                assert_eq!(next, Duration::from_millis(1000));
            }
            previous = next;
        }
    }

    #[test]
    fn constant_ignores_attempt() {
        let backoff = Backoff::constant(Duration::from_millis(5));
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(40), Duration::from_millis(5));
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(2));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay((u32::MAX as usize) + 10), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validation() {
        assert!(matches!(
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(2)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(10)).with_max(Duration::from_secs(5)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }

    #[test]
    fn zero_base_stays_zero() {
        assert_eq!(Backoff::exponential(Duration::ZERO).delay(6), Duration::ZERO);
    }
}
