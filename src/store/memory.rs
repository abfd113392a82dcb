//! Process-local counter store.
//!
//! Serves two roles: the whole store for single-instance deployments, and
//! the degraded-mode fallback when the distributed store is unreachable.
//! Counters always use fixed-window arithmetic here, even for sliding
//! rules: keeping a per-client timestamp set in process memory is exactly
//! the growth the fallback exists to avoid, so sliding rules degrade to
//! the aligned-window approximation while the fallback is active.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::rule::Rule;
use crate::store::{aligned_window_start, pattern_matches, CounterSnapshot, CounterStore};

/// Per-key counter record.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    reset_time_ms: u64,
    #[allow(dead_code)]
    created_at_ms: u64,
}

/// In-memory fixed-window counter store.
///
/// The map offers atomic per-key upsert; each operation completes under
/// the entry's shard lock, so concurrent callers against one key are
/// serialised.
#[derive(Debug)]
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), clock }
    }

    /// Number of live entries (admin stats).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose window has passed. Returns the number
    /// removed. The maintenance worker calls this on the local-cache TTL
    /// interval.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_time_ms >= now);
        before - self.entries.len()
    }

    fn fresh_entry(&self, now: u64, window_ms: u64) -> CounterEntry {
        CounterEntry {
            count: 0,
            reset_time_ms: aligned_window_start(now, window_ms) + window_ms,
            created_at_ms: now,
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        rule: &Rule,
    ) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now_millis();
        let window_ms = rule.window_millis();
        let max = u64::from(rule.max_requests);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| self.fresh_entry(now, window_ms));

        if now >= entry.reset_time_ms {
            *entry = self.fresh_entry(now, window_ms);
        }

        let allowed = entry.count < max;
        if allowed {
            entry.count += 1;
        }

        Ok(CounterSnapshot { count: entry.count, reset_time_ms: entry.reset_time_ms, allowed })
    }

    async fn current(&self, key: &str, rule: &Rule) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now_millis();
        let window_ms = rule.window_millis();
        let max = u64::from(rule.max_requests);

        let snapshot = match self.entries.get(key) {
            Some(entry) if now < entry.reset_time_ms => CounterSnapshot {
                count: entry.count,
                reset_time_ms: entry.reset_time_ms,
                allowed: entry.count < max,
            },
            _ => CounterSnapshot {
                count: 0,
                reset_time_ms: aligned_window_start(now, window_ms) + window_ms,
                allowed: max > 0,
            },
        };
        Ok(snapshot)
    }

    async fn revert(&self, key: &str, _rule: &Rule) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if now < entry.reset_time_ms {
                entry.count = entry.count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn cleanup(&self, pattern: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| !pattern_matches(pattern, key) || entry.reset_time_ms >= now);
        Ok((before - self.entries.len()) as u64)
    }

    async fn key_count(&self, pattern: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let count = self
            .entries
            .iter()
            .filter(|entry| pattern_matches(pattern, entry.key()) && entry.reset_time_ms >= now)
            .count();
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn store_with_clock() -> (MemoryCounterStore, ManualClock) {
        let clock = ManualClock::starting_at(1_000_000);
        (MemoryCounterStore::new(Arc::new(clock.clone())), clock)
    }

    fn rule() -> Rule {
        Rule::new("api", Duration::from_secs(60), 3)
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_denies_without_increment() {
        let (store, _clock) = store_with_clock();
        let rule = rule();
        let key = rule.storage_key("10.0.0.1");

        for expected in 1..=3u64 {
            let snap = store.check_and_increment(&key, &rule).await.unwrap();
            assert!(snap.allowed);
            assert_eq!(snap.count, expected);
        }

        let denied = store.check_and_increment(&key, &rule).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 3, "denial must not increment");

        let again = store.check_and_increment(&key, &rule).await.unwrap();
        assert_eq!(again.count, 3);
    }

    #[tokio::test]
    async fn window_rollover_grants_fresh_admissions() {
        let (store, clock) = store_with_clock();
        let rule = rule();
        let key = rule.storage_key("10.0.0.1");

        for _ in 0..3 {
            store.check_and_increment(&key, &rule).await.unwrap();
        }
        assert!(!store.check_and_increment(&key, &rule).await.unwrap().allowed);

        clock.advance(61_000);
        let snap = store.check_and_increment(&key, &rule).await.unwrap();
        assert!(snap.allowed);
        assert_eq!(snap.count, 1);
    }

    #[tokio::test]
    async fn reset_time_is_window_aligned() {
        let clock = ManualClock::starting_at(61_500);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));
        let rule = rule();
        let snap = store.check_and_increment("k", &rule).await.unwrap();
        // window 60s, now 61.5s -> aligned window [60s, 120s)
        assert_eq!(snap.reset_time_ms, 120_000);
    }

    #[tokio::test]
    async fn current_does_not_mutate() {
        let (store, _clock) = store_with_clock();
        let rule = rule();
        store.check_and_increment("k", &rule).await.unwrap();

        let a = store.current("k", &rule).await.unwrap();
        let b = store.current("k", &rule).await.unwrap();
        assert_eq!(a.count, 1);
        assert_eq!(b.count, 1);
        assert!(a.allowed);
    }

    #[tokio::test]
    async fn current_on_missing_key_reports_zero() {
        let (store, _clock) = store_with_clock();
        let rule = rule();
        let snap = store.current("missing", &rule).await.unwrap();
        assert_eq!(snap.count, 0);
        assert!(snap.allowed);
    }

    #[tokio::test]
    async fn revert_decrements_within_window() {
        let (store, _clock) = store_with_clock();
        let rule = rule();
        store.check_and_increment("k", &rule).await.unwrap();
        store.check_and_increment("k", &rule).await.unwrap();

        store.revert("k", &rule).await.unwrap();
        assert_eq!(store.current("k", &rule).await.unwrap().count, 1);

        // Reverting past zero saturates.
        store.revert("k", &rule).await.unwrap();
        store.revert("k", &rule).await.unwrap();
        assert_eq!(store.current("k", &rule).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn revert_after_expiry_is_a_no_op() {
        let (store, clock) = store_with_clock();
        let rule = rule();
        store.check_and_increment("k", &rule).await.unwrap();
        clock.advance(120_000);
        store.revert("k", &rule).await.unwrap();
        let snap = store.current("k", &rule).await.unwrap();
        assert_eq!(snap.count, 0);
    }

    #[tokio::test]
    async fn reset_purges_the_key() {
        let (store, _clock) = store_with_clock();
        let rule = rule();
        for _ in 0..3 {
            store.check_and_increment("k", &rule).await.unwrap();
        }
        store.reset("k").await.unwrap();
        let snap = store.check_and_increment("k", &rule).await.unwrap();
        assert_eq!(snap.count, 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let (store, clock) = store_with_clock();
        let rule = rule();
        store.check_and_increment("old", &rule).await.unwrap();
        clock.advance(61_000);
        store.check_and_increment("fresh", &rule).await.unwrap();

        let removed = store.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_respects_pattern() {
        let (store, clock) = store_with_clock();
        let rule = rule();
        store.check_and_increment("rl:api:x:1", &rule).await.unwrap();
        store.check_and_increment("rl:auth:x:1", &rule).await.unwrap();
        clock.advance(61_000);

        let removed = store.cleanup("rl:api:*").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);

        let removed = store.cleanup("rl:*").await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn key_count_excludes_expired() {
        let (store, clock) = store_with_clock();
        let rule = rule();
        store.check_and_increment("rl:api:x:1", &rule).await.unwrap();
        store.check_and_increment("rl:api:x:2", &rule).await.unwrap();
        assert_eq!(store.key_count("rl:*").await.unwrap(), 2);

        clock.advance(61_000);
        assert_eq!(store.key_count("rl:*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_upserts_never_overshoot() {
        let clock = ManualClock::starting_at(1_000_000);
        let store = Arc::new(MemoryCounterStore::new(Arc::new(clock)));
        let rule = Arc::new(Rule::new("burst", Duration::from_secs(60), 50));

        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            let rule = rule.clone();
            handles.push(tokio::spawn(async move {
                store.check_and_increment("k", &rule).await.unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }
}
