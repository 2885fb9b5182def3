//! Jitter applied to backoff delays.
//!
//! - `None`: exact delays, for tests and tightly controlled workflows.
//! - `Proportional { factor }`: multiplies the delay by a uniform draw from
//!   `[1 - factor/2, 1 + factor/2]`, so a factor of 0.3 spreads a 10s delay
//!   over 8.5s..=11.5s. This keeps concurrent retriers from waking together.
//! - `Full`: uniform in `[0, delay]`.
//!
//! RNG: `rand`'s thread-local generator by default; a seeded RNG can be
//! injected via `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Default spread used by retry policies.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// Randomization strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the backoff delay unchanged.
    None,
    /// `delay ± (factor / 2) * delay`, uniformly distributed.
    Proportional { factor: f64 },
    /// Uniform in `[0, delay]`.
    Full,
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Proportional { factor: DEFAULT_JITTER_FACTOR }
    }
}

impl Jitter {
    /// Proportional jitter; `factor` is clamped into `[0.0, 2.0]`.
    pub fn proportional(factor: f64) -> Self {
        let factor = if factor.is_finite() { factor.clamp(0.0, 2.0) } else { 0.0 };
        Jitter::Proportional { factor }
    }

    pub fn full() -> Self {
        Jitter::Full
    }

    /// Apply jitter using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional { factor } => {
                if factor == 0.0 || delay.is_zero() {
                    return delay;
                }
                let half = factor / 2.0;
                let scale = rng.random_range((1.0 - half)..=(1.0 + half));
                let secs = delay.as_secs_f64() * scale;
                Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(delay)
            }
            Jitter::Full => {
                let millis = Self::as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
        }
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn proportional_stays_within_band() {
        let jitter = Jitter::proportional(0.3);
        let delay = Duration::from_secs(10);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let jittered = jitter.apply_with_rng(delay, &mut rng);
            assert!(jittered >= Duration::from_millis(8_500), "{jittered:?}");
            assert!(jittered <= Duration::from_millis(11_500), "{jittered:?}");
        }
    }

    #[test]
    fn proportional_actually_varies() {
        let jitter = Jitter::default();
        let mut rng = StdRng::seed_from_u64(42);
        let samples: Vec<_> =
            (0..20).map(|_| jitter.apply_with_rng(Duration::from_secs(1), &mut rng)).collect();
        assert!(samples.iter().any(|d| *d != samples[0]));
    }

    #[test]
    fn zero_factor_is_identity() {
        let jitter = Jitter::proportional(0.0);
        assert_eq!(jitter.apply(Duration::from_millis(750)), Duration::from_millis(750));
    }

    #[test]
    fn factor_is_clamped() {
        assert_eq!(Jitter::proportional(5.0), Jitter::Proportional { factor: 2.0 });
        assert_eq!(Jitter::proportional(-1.0), Jitter::Proportional { factor: 0.0 });
        assert_eq!(Jitter::proportional(f64::NAN), Jitter::Proportional { factor: 0.0 });
    }

    #[test]
    fn full_is_bounded_by_delay() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let jittered = Jitter::Full.apply_with_rng(Duration::from_secs(1), &mut rng);
            assert!(jittered <= Duration::from_secs(1));
        }
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
    }
}
