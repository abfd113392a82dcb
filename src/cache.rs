//! Decision cache layer.
//!
//! Composes the circuit breaker, the distributed store, and the optional
//! in-memory fallback behind one `check`/`current`/`reset` surface that
//! produces [`Decision`]s. This is the only place admission results are
//! constructed, so header arithmetic and retry hints stay consistent
//! across backends.

use std::sync::Arc;

use metrics::counter;
use tracing::{error, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::rule::Rule;
use crate::store::{CounterSnapshot, CounterStore, MemoryCounterStore};

/// The outcome of evaluating one rule for one client.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    /// Requests counted in the current window.
    pub total_requests: u64,
    /// Admissions left before the rule denies.
    pub remaining_requests: u64,
    /// Epoch millis when the window resets.
    pub reset_time_ms: u64,
    /// Whole seconds to wait, present iff denied.
    pub retry_after_secs: Option<u64>,
    /// The rule that produced this decision.
    pub rule: Arc<Rule>,
}

impl Decision {
    fn from_snapshot(snapshot: CounterSnapshot, rule: Arc<Rule>, now_ms: u64) -> Self {
        let retry_after_secs = if snapshot.allowed {
            None
        } else {
            Some(snapshot.reset_time_ms.saturating_sub(now_ms).div_ceil(1000))
        };
        Self {
            allowed: snapshot.allowed,
            total_requests: snapshot.count,
            remaining_requests: u64::from(rule.max_requests).saturating_sub(snapshot.count),
            reset_time_ms: snapshot.reset_time_ms,
            retry_after_secs,
            rule,
        }
    }

    /// Admit with a full window: the limiter could not decide and the
    /// availability-over-strictness policy is in force.
    fn fail_open(rule: Arc<Rule>, now_ms: u64) -> Self {
        let window = rule.window_millis();
        Self {
            allowed: true,
            total_requests: 0,
            remaining_requests: u64::from(rule.max_requests),
            reset_time_ms: now_ms + window,
            retry_after_secs: None,
            rule,
        }
    }

    /// Deny for a full window: the limiter could not decide and fail-open
    /// has been switched off.
    fn fail_closed(rule: Arc<Rule>, now_ms: u64) -> Self {
        let window = rule.window_millis();
        Self {
            allowed: false,
            total_requests: u64::from(rule.max_requests),
            remaining_requests: 0,
            reset_time_ms: now_ms + window,
            retry_after_secs: Some(window.div_ceil(1000)),
            rule,
        }
    }
}

/// Breaker-guarded composition of primary and fallback counter stores.
pub struct LimiterCache {
    primary: Arc<dyn CounterStore>,
    fallback: Option<Arc<MemoryCounterStore>>,
    breaker: CircuitBreaker,
    fail_open: bool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LimiterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterCache")
            .field("breaker", &self.breaker)
            .field("fallback_enabled", &self.fallback.is_some())
            .field("fail_open", &self.fail_open)
            .finish()
    }
}

impl LimiterCache {
    pub fn new(
        primary: Arc<dyn CounterStore>,
        fallback: Option<Arc<MemoryCounterStore>>,
        breaker: CircuitBreaker,
        fail_open: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { primary, fallback, breaker, fail_open, clock }
    }

    /// Atomic check-and-increment, breaker-guarded.
    pub async fn check(&self, key: &str, rule: &Arc<Rule>) -> Decision {
        let now = self.clock.now_millis();
        let decision = self
            .breaker
            .execute(
                || async {
                    let snapshot = self.primary.check_and_increment(key, rule).await?;
                    Ok(Decision::from_snapshot(snapshot, rule.clone(), now))
                },
                || self.fallback_check(key, rule, now),
            )
            .await;

        counter!(
            "tollgate_decisions_total",
            "rule" => rule.id.clone(),
            "allowed" => if decision.allowed { "true" } else { "false" },
        )
        .increment(1);
        decision
    }

    async fn fallback_check(&self, key: &str, rule: &Arc<Rule>, now: u64) -> Decision {
        match &self.fallback {
            Some(memory) => match memory.check_and_increment(key, rule).await {
                Ok(snapshot) => Decision::from_snapshot(snapshot, rule.clone(), now),
                Err(err) => {
                    error!(target: "tollgate::cache", key, error = %err, "fallback store failed");
                    self.undecidable(rule.clone(), now)
                }
            },
            None => self.undecidable(rule.clone(), now),
        }
    }

    fn undecidable(&self, rule: Arc<Rule>, now: u64) -> Decision {
        if self.fail_open {
            Decision::fail_open(rule, now)
        } else {
            Decision::fail_closed(rule, now)
        }
    }

    /// Non-mutating observation. Bypasses the breaker; failures degrade to
    /// the fallback, then to the configured fail policy.
    pub async fn current(&self, key: &str, rule: &Arc<Rule>) -> Decision {
        let now = self.clock.now_millis();
        match self.primary.current(key, rule).await {
            Ok(snapshot) => Decision::from_snapshot(snapshot, rule.clone(), now),
            Err(err) => {
                warn!(target: "tollgate::cache", key, error = %err, "observation failed");
                match &self.fallback {
                    Some(memory) => match memory.current(key, rule).await {
                        Ok(snapshot) => Decision::from_snapshot(snapshot, rule.clone(), now),
                        Err(_) => self.undecidable(rule.clone(), now),
                    },
                    None => self.undecidable(rule.clone(), now),
                }
            }
        }
    }

    /// Compensating decrement, applied to both stores. The fallback only
    /// holds counts accumulated while the primary was unreachable, so a
    /// missing key there is the common case and reverts saturate at zero.
    pub async fn revert(&self, key: &str, rule: &Arc<Rule>) -> Result<(), StoreError> {
        let outcome = self.primary.revert(key, rule).await;
        if let Some(memory) = &self.fallback {
            let _ = memory.revert(key, rule).await;
        }
        outcome
    }

    /// Purge one key everywhere (administrative reset).
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        if let Some(memory) = &self.fallback {
            let _ = memory.reset(key).await;
        }
        self.primary.reset(key).await
    }

    /// Delete exhausted keys matching the pattern in both stores.
    pub async fn cleanup(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut deleted = 0;
        if let Some(memory) = &self.fallback {
            deleted += memory.cleanup(pattern).await.unwrap_or(0);
        }
        deleted += self.primary.cleanup(pattern).await?;
        Ok(deleted)
    }

    /// Live keys under the pattern, preferring the primary's view.
    pub async fn key_count(&self, pattern: &str) -> u64 {
        match self.primary.key_count(pattern).await {
            Ok(count) => count,
            Err(err) => {
                warn!(target: "tollgate::cache", error = %err, "key count failed");
                match &self.fallback {
                    Some(memory) => memory.key_count(pattern).await.unwrap_or(0),
                    None => 0,
                }
            }
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Entries currently held by the in-memory fallback.
    pub fn fallback_len(&self) -> usize {
        self.fallback.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    pub(crate) fn fallback_store(&self) -> Option<Arc<MemoryCounterStore>> {
        self.fallback.clone()
    }
}
