//! Counter storage backends.
//!
//! The [`CounterStore`] trait decouples the admission arithmetic from
//! where the counters live: [`RedisCounterStore`] keeps shared state in
//! Redis behind atomic server-side scripts, [`MemoryCounterStore`] keeps
//! process-local state for single-instance use and as the degraded-mode
//! fallback. Both expose identical operations; the cache layer composes
//! them behind the circuit breaker.

pub mod memory;
pub mod redis;

pub use memory::MemoryCounterStore;
pub use redis::RedisCounterStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::rule::Rule;

/// Result of one counter observation or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Requests counted in the current window, including this one when the
    /// call admitted it.
    pub count: u64,
    /// Wall-clock instant (epoch millis) when the window resets.
    pub reset_time_ms: u64,
    /// Whether the observed/updated count stays within the rule's limit.
    pub allowed: bool,
}

/// Storage interface for rate-limit counters.
///
/// Every operation is atomic per key. Implementations must purge expired
/// state before reading cardinality on every mutating path.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically check the counter against the rule and admit (increment)
    /// when below the limit. Denials never increment.
    async fn check_and_increment(
        &self,
        key: &str,
        rule: &Rule,
    ) -> Result<CounterSnapshot, StoreError>;

    /// Non-mutating observation of the current count.
    async fn current(&self, key: &str, rule: &Rule) -> Result<CounterSnapshot, StoreError>;

    /// Compensating decrement: remove the newest in-window arrival.
    async fn revert(&self, key: &str, rule: &Rule) -> Result<(), StoreError>;

    /// Purge all state under a key.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Delete exhausted keys matching a glob pattern. Returns the number
    /// of keys deleted.
    async fn cleanup(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Count live keys matching a glob pattern (admin stats).
    async fn key_count(&self, pattern: &str) -> Result<u64, StoreError>;
}

/// Align an instant to the start of its fixed window.
pub(crate) fn aligned_window_start(now_ms: u64, window_ms: u64) -> u64 {
    if window_ms == 0 {
        return now_ms;
    }
    (now_ms / window_ms) * window_ms
}

/// Glob match supporting the `prefix*` patterns the maintenance pipeline
/// issues; anything without a trailing `*` is an exact match.
pub(crate) fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_alignment() {
        assert_eq!(aligned_window_start(1_234, 1_000), 1_000);
        assert_eq!(aligned_window_start(2_000, 1_000), 2_000);
        assert_eq!(aligned_window_start(59_999, 60_000), 0);
        assert_eq!(aligned_window_start(60_000, 60_000), 60_000);
    }

    #[test]
    fn pattern_matching() {
        assert!(pattern_matches("rl:*", "rl:api:abcd1234:10.0.0.1"));
        assert!(pattern_matches("rl:api:*", "rl:api:abcd1234:10.0.0.1"));
        assert!(!pattern_matches("rl:auth:*", "rl:api:abcd1234:10.0.0.1"));
        assert!(pattern_matches("rl:api:abcd1234:10.0.0.1", "rl:api:abcd1234:10.0.0.1"));
        assert!(!pattern_matches("rl:api:abcd1234:10.0.0.1", "rl:api:abcd1234:10.0.0.2"));
    }
}
