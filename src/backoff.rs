//! Exponential backoff for the retry engine.

use std::time::Duration;

/// Capped exponential backoff: `min(max, base * factor^(attempt-1))`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        // A factor below 1 would shrink toward zero; clamp to constant.
        let factor = if factor.is_finite() { factor.max(1.0) } else { 2.0 };
        Self { base, max, factor }
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Delay before the attempt following `attempt` (1-indexed), saturating
    /// at the cap for large attempt numbers instead of overflowing.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as i32;
        let multiplier = self.factor.powi(exponent);
        let secs = self.base.as_secs_f64() * multiplier;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
