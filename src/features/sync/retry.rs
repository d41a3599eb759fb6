//! Retry policy for queued mutations.
//!
//! Exponential backoff from a per-class base delay, jittered and capped.
//! Auth and validation failures are terminal on the first attempt.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::remote::ErrorKind;
use crate::config::{RetryClassConfig, RetryConfig};

/// Retry class of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// 5 retries, 1s base, 60s cap, 20% jitter by default.
    Critical,
    /// 3 retries, 1s base, 30s cap, 20% jitter by default.
    Normal,
    /// 1 retry, 1s base, 10s cap, 10% jitter by default.
    Background,
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Background => "background",
        };
        write!(f, "{s}")
    }
}

/// Backoff and terminal-failure rules for one operation class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    config: RetryClassConfig,
}

impl RetryPolicy {
    /// Create a policy from an explicit tuple.
    #[must_use]
    pub const fn new(config: RetryClassConfig) -> Self {
        Self { config }
    }

    /// Policy for a class, taken from the configured tuples.
    #[must_use]
    pub const fn for_class(class: OperationClass, retry: &RetryConfig) -> Self {
        let config = match class {
            OperationClass::Critical => retry.critical,
            OperationClass::Normal => retry.normal,
            OperationClass::Background => retry.background,
        };
        Self::new(config)
    }

    /// Number of retries allowed after the first attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// [`next_delay`](Self::next_delay) with a caller-supplied RNG.
    pub fn next_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.config.base_delay();
        let cap = self.config.max_delay();
        let shift = attempt.min(20);
        let exponential = base.saturating_mul(1_u32 << shift).min(cap);

        let jitter = self.config.jitter_fraction.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 {
            exponential.mul_f64(1.0 + rng.gen_range(-jitter..=jitter))
        } else {
            exponential
        };

        jittered.min(cap)
    }

    /// Whether a failure after `attempt` earlier attempts ends the item.
    #[must_use]
    pub const fn is_terminal(&self, attempt: u32, kind: ErrorKind) -> bool {
        !kind.is_retryable() || attempt >= self.config.max_retries
    }
}
