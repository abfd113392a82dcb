//! Redis-backed counter store.
//!
//! Sliding-window counters are sorted sets: one member per admitted
//! request, scored by arrival time in epoch milliseconds. The whole
//! purge/count/insert sequence runs as a single server-side script, so
//! concurrent check-and-increments against one key are linearised by
//! Redis. Fixed-window counters are JSON payloads tied to the aligned
//! window. Any sliding-path failure falls through to the fixed path on
//! the same store before the caller's fallback is consulted.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::RedisConfig;
use crate::error::StoreError;
use crate::rule::{Algorithm, Rule};
use crate::store::{CounterSnapshot, CounterStore};

use std::sync::Arc;

/// Purge expired members, count, and admit below the limit — one atomic
/// unit. The reread after insert removes the member again if a concurrent
/// writer (outside the script serialisation, e.g. during a cluster
/// failover replay) produced overshoot.
const SLIDING_CHECK: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local cutoff = ARGV[4]
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, 0, cutoff)
local count = redis.call('ZCARD', key)
if count >= max then
  redis.call('PEXPIRE', key, window)
  return {count, 0}
end
redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window)
local total = redis.call('ZCARD', key)
if total > max then
  redis.call('ZREM', key, member)
  return {total - 1, 0}
end
return {total, 1}
"#;

/// Count members strictly within the window without mutating.
const SLIDING_CURRENT: &str = r#"
return redis.call('ZCOUNT', KEYS[1], '(' .. ARGV[1], ARGV[2])
"#;

/// Remove the newest member with score <= now; purge expired members as a
/// side effect; refresh the TTL when members remain.
const SLIDING_REVERT: &str = r#"
local key = KEYS[1]
redis.call('ZREMRANGEBYSCORE', key, 0, ARGV[3])
local newest = redis.call('ZREVRANGEBYSCORE', key, ARGV[1], '-inf', 'LIMIT', 0, 1)
local removed = 0
if newest[1] then
  removed = redis.call('ZREM', key, newest[1])
end
if redis.call('ZCARD', key) > 0 then
  redis.call('PEXPIRE', key, tonumber(ARGV[2]))
end
return removed
"#;

/// Fixed-window payload `{count, reset_time, created_at}` aligned on
/// multiples of the window length. Denials never increment; the record is
/// only written on mutating calls, with TTL equal to the remaining window.
const FIXED_CHECK: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local incr = tonumber(ARGV[4])

local state = nil
local raw = redis.call('GET', key)
if raw then
  local ok, decoded = pcall(cjson.decode, raw)
  if ok then state = decoded end
end
if (not state) or now >= tonumber(state.reset_time) then
  local aligned = now - (now % window)
  state = { count = 0, reset_time = aligned + window, created_at = now }
end

local allowed = 0
if tonumber(state.count) < max then
  allowed = 1
  if incr == 1 then
    state.count = tonumber(state.count) + 1
  end
end

if incr == 1 then
  local ttl = tonumber(state.reset_time) - now
  if ttl < 1 then ttl = 1 end
  redis.call('SET', key, cjson.encode(state), 'PX', ttl)
end

return {tonumber(state.count), tonumber(state.reset_time), allowed}
"#;

const FIXED_REVERT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, state = pcall(cjson.decode, raw)
if not ok then return 0 end
local now = tonumber(ARGV[1])
if now >= tonumber(state.reset_time) or tonumber(state.count) <= 0 then return 0 end
state.count = tonumber(state.count) - 1
local ttl = tonumber(state.reset_time) - now
if ttl < 1 then ttl = 1 end
redis.call('SET', KEYS[1], cjson.encode(state), 'PX', ttl)
return 1
"#;

/// Counter store on a shared Redis connection pool.
pub struct RedisCounterStore {
    pool: Pool,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    max_retries: u32,
    sliding_check: redis::Script,
    sliding_current: redis::Script,
    sliding_revert: redis::Script,
    fixed_check: redis::Script,
    fixed_revert: redis::Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("call_timeout", &self.call_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create the store on a pool built from the connection settings.
    pub fn connect(config: &RedisConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let pool = deadpool_redis::Config::from_url(config.url())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self::with_pool(pool, config, clock))
    }

    /// Create the store from a `redis://` URL, keeping the retry/timeout
    /// settings from `config`.
    pub fn connect_url(
        url: &str,
        config: &RedisConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self::with_pool(pool, config, clock))
    }

    /// Create the store on an existing pool (shared process-scoped handle).
    pub fn with_pool(pool: Pool, config: &RedisConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            max_retries: config.max_retries_per_request.max(1),
            sliding_check: redis::Script::new(SLIDING_CHECK),
            sliding_current: redis::Script::new(SLIDING_CURRENT),
            sliding_revert: redis::Script::new(SLIDING_REVERT),
            fixed_check: redis::Script::new(FIXED_CHECK),
            fixed_revert: redis::Script::new(FIXED_REVERT),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Run one operation with the per-call deadline and bounded retries.
    async fn retrying<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut last = String::new();
        for attempt in 1..=self.max_retries {
            match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    debug!(target: "tollgate::store", op, attempt, error = %err, "redis call failed");
                    last = err.to_string();
                }
                Err(_) => {
                    debug!(target: "tollgate::store", op, attempt, "redis call timed out");
                    last = StoreError::Timeout {
                        elapsed: self.call_timeout,
                        limit: self.call_timeout,
                    }
                    .to_string();
                }
            }
        }
        Err(StoreError::RetriesExhausted { attempts: self.max_retries, last })
    }

    async fn sliding_check_once(
        &self,
        key: &str,
        rule: &Rule,
    ) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now_millis();
        let window = rule.window_millis();
        let cutoff = now.saturating_sub(window);
        let member = format!("{now}-{}", Uuid::new_v4());

        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .sliding_check
            .key(key)
            .arg(now)
            .arg(window)
            .arg(rule.max_requests)
            .arg(cutoff)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let &[count, allowed] = reply.as_slice() else {
            return Err(StoreError::MalformedReply(format!(
                "sliding check returned {} fields",
                reply.len()
            )));
        };
        Ok(CounterSnapshot {
            count: count.max(0) as u64,
            reset_time_ms: now + window,
            allowed: allowed == 1,
        })
    }

    async fn sliding_current_once(
        &self,
        key: &str,
        rule: &Rule,
    ) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now_millis();
        let window = rule.window_millis();
        let cutoff = now.saturating_sub(window);

        let mut conn = self.connection().await?;
        let count: i64 = self
            .sliding_current
            .key(key)
            .arg(cutoff)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        let count = count.max(0) as u64;
        Ok(CounterSnapshot {
            count,
            reset_time_ms: now + window,
            allowed: count < u64::from(rule.max_requests),
        })
    }

    async fn fixed_once(
        &self,
        key: &str,
        rule: &Rule,
        increment: bool,
    ) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now_millis();

        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .fixed_check
            .key(key)
            .arg(now)
            .arg(rule.window_millis())
            .arg(rule.max_requests)
            .arg(i32::from(increment))
            .invoke_async(&mut conn)
            .await?;

        let &[count, reset_time, allowed] = reply.as_slice() else {
            return Err(StoreError::MalformedReply(format!(
                "fixed check returned {} fields",
                reply.len()
            )));
        };
        Ok(CounterSnapshot {
            count: count.max(0) as u64,
            reset_time_ms: reset_time.max(0) as u64,
            allowed: allowed == 1,
        })
    }

    async fn sliding_revert_once(&self, key: &str, rule: &Rule) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let window = rule.window_millis();
        let cutoff = now.saturating_sub(window);

        let mut conn = self.connection().await?;
        let _removed: i64 = self
            .sliding_revert
            .key(key)
            .arg(now)
            .arg(window)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fixed_revert_once(&self, key: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut conn = self.connection().await?;
        let _removed: i64 =
            self.fixed_revert.key(key).arg(now).invoke_async(&mut conn).await?;
        Ok(())
    }

    /// Collect every key matching the pattern with a full SCAN pass.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        rule: &Rule,
    ) -> Result<CounterSnapshot, StoreError> {
        match rule.algorithm {
            Algorithm::Sliding => {
                match self.retrying("sliding_check", || self.sliding_check_once(key, rule)).await
                {
                    Ok(snapshot) => Ok(snapshot),
                    Err(err) => {
                        warn!(
                            target: "tollgate::store",
                            key,
                            rule = %rule.id,
                            error = %err,
                            "sliding path failed; degrading to fixed window"
                        );
                        self.retrying("fixed_check", || self.fixed_once(key, rule, true)).await
                    }
                }
            }
            Algorithm::Fixed => {
                self.retrying("fixed_check", || self.fixed_once(key, rule, true)).await
            }
        }
    }

    async fn current(&self, key: &str, rule: &Rule) -> Result<CounterSnapshot, StoreError> {
        match rule.algorithm {
            Algorithm::Sliding => {
                match self
                    .retrying("sliding_current", || self.sliding_current_once(key, rule))
                    .await
                {
                    Ok(snapshot) => Ok(snapshot),
                    Err(err) => {
                        warn!(
                            target: "tollgate::store",
                            key,
                            rule = %rule.id,
                            error = %err,
                            "sliding observation failed; degrading to fixed window"
                        );
                        self.retrying("fixed_current", || self.fixed_once(key, rule, false)).await
                    }
                }
            }
            Algorithm::Fixed => {
                self.retrying("fixed_current", || self.fixed_once(key, rule, false)).await
            }
        }
    }

    async fn revert(&self, key: &str, rule: &Rule) -> Result<(), StoreError> {
        match rule.algorithm {
            Algorithm::Sliding => {
                self.retrying("sliding_revert", || self.sliding_revert_once(key, rule)).await
            }
            Algorithm::Fixed => {
                self.retrying("fixed_revert", || self.fixed_revert_once(key)).await
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.retrying("reset", || async {
            let mut conn = self.connection().await?;
            let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn cleanup(&self, pattern: &str) -> Result<u64, StoreError> {
        // Every write path sets a TTL, so live keys expire on their own.
        // This pass deletes leaked keys (no TTL) and empty sorted sets left
        // behind by partial replays.
        let keys = self.scan_keys(pattern).await?;
        let mut conn = self.connection().await?;
        let mut deleted = 0u64;
        for key in keys {
            let pttl: i64 = redis::cmd("PTTL").arg(&key).query_async(&mut conn).await?;
            let exhausted = if pttl == -1 {
                true
            } else if pttl == -2 {
                false
            } else {
                let kind: String = redis::cmd("TYPE").arg(&key).query_async(&mut conn).await?;
                if kind == "zset" {
                    let members: i64 =
                        redis::cmd("ZCARD").arg(&key).query_async(&mut conn).await?;
                    members == 0
                } else {
                    false
                }
            };
            if exhausted {
                let removed: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                deleted += removed.max(0) as u64;
            }
        }
        Ok(deleted)
    }

    async fn key_count(&self, pattern: &str) -> Result<u64, StoreError> {
        Ok(self.scan_keys(pattern).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_script_purges_before_counting() {
        let purge = SLIDING_CHECK.find("ZREMRANGEBYSCORE").expect("purge present");
        let count = SLIDING_CHECK.find("ZCARD").expect("count present");
        assert!(purge < count, "purge must precede the cardinality read");
    }

    #[test]
    fn sliding_script_rolls_back_overshoot() {
        assert!(SLIDING_CHECK.contains("ZREM"));
        assert!(SLIDING_CHECK.contains("total > max"));
    }

    #[test]
    fn fixed_script_denies_without_increment() {
        // The increment is guarded by both the limit check and the
        // mutating flag.
        assert!(FIXED_CHECK.contains("if tonumber(state.count) < max"));
        assert!(FIXED_CHECK.contains("if incr == 1"));
    }

    #[test]
    fn revert_scripts_target_newest_member() {
        assert!(SLIDING_REVERT.contains("ZREVRANGEBYSCORE"));
        assert!(SLIDING_REVERT.contains("LIMIT"));
    }
}
