//! Retry policy: exponential backoff with a cap and a bounded number of attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::{DomainError, DomainResult};

/// Retry policy configuration.
///
/// Pure: no clock, no I/O. The processor adds the returned delay to its
/// injected `now` to compute `next_retry_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which an event is quarantined (terminal `FAILED`).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Fraction (0.0-1.0) by which a delay may be shortened to spread retries.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff and no jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(DomainError::validation("base_delay must be greater than zero"));
        }
        if self.base_delay > self.max_delay {
            return Err(DomainError::validation("base_delay must not exceed max_delay"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DomainError::validation("jitter must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Delay before the next attempt, given how many attempts were made (1-indexed).
    ///
    /// `min(base * 2^(attempts - 1), max)`, optionally shortened by jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        // 2^31 already exceeds any sane cap; clamp the exponent so the shift cannot overflow.
        let exponent = (attempts - 1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter <= 0.0 {
            return delay;
        }

        // Deterministic spread derived from the attempt number, like a cheap hash.
        let fraction = f64::from((attempts.wrapping_mul(17)) % 100) / 100.0;
        let shortened = delay.as_secs_f64() * (1.0 - self.jitter.min(1.0) * fraction);
        Duration::from_secs_f64(shortened.max(0.0)).min(self.max_delay)
    }

    /// Whether an event that has now made `attempts` attempts has no attempts left.
    pub fn is_final(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
