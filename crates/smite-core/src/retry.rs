//! Exponential backoff policy.
//!
//! Used by the panel reconciler for transient apply failures and by the node
//! agent for reconnecting to the panel.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a delay cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Policy with the given base and cap, unlimited attempts.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay_ms: duration_ms(initial_delay),
            max_delay_ms: duration_ms(max_delay),
            ..Self::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
