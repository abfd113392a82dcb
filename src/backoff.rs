//! Backoff strategies for maintenance-queue retries.
//!
//! Attempt semantics: attempt index `0` represents the initial run (no
//! delay), and retries start at `attempt = 1`. Delays saturate at a
//! documented maximum to avoid overflow.

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Backoff strategy for retried jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// Exponentially increasing delay with optional cap
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create an exponential backoff strategy
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Cap the exponential delay. No-op for constant backoff.
    pub fn with_max(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { max, .. } = &mut self {
            *max = Some(cap);
        }
        self
    }

    /// Calculate the delay for a given attempt number (0-based; 0 = initial
    /// run, no delay).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, max } => {
                // 2^(attempt-1), saturating well before Duration overflows.
                let multiplier = 2u128.saturating_pow(attempt - 1);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map(|m| delay.min(m)).unwrap_or(delay)
            }
        }
    }
}
