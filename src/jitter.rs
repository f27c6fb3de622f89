//! Jitter applied to computed backoff delays.
//!
//! Server-directed delays (`Retry-After`) are never jittered; jitter exists
//! to spread delays this client chose on its own.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// Use the exact computed delay.
    None,
    /// Scale the delay by `1 + U(-factor, +factor)`.
    Proportional { factor: f64 },
}

impl Jitter {
    /// Proportional jitter with the factor clamped into `[0, 1]`.
    pub fn proportional(factor: f64) -> Self {
        let factor = if factor.is_finite() { factor.clamp(0.0, 1.0) } else { 0.0 };
        if factor == 0.0 {
            Jitter::None
        } else {
            Jitter::Proportional { factor }
        }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Deterministic variant for tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional { factor } => {
                if delay.is_zero() {
                    return delay;
                }
                let spread = rng.random_range(-factor..=*factor);
                Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + spread))
            }
        }
    }
}
