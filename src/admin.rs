//! Administrative surface: runtime stats and counter resets.
//!
//! Framework-independent by design — the embedding server maps
//! [`AdminError::InvalidInput`] to 400 and [`AdminError::Store`] to 500
//! and serialises the returned records however it likes.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::LimiterCache;
use crate::error::AdminError;
use crate::maintenance::{QueueStats, WorkerStats};
use crate::rule::Rule;
use crate::throttle::LocalThrottle;

/// Aggregate runtime statistics.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub uptime_secs: u64,
    pub operations_queue: QueueStats,
    pub periodic_cleanup_queue: QueueStats,
    /// Entries held by the in-memory fallback store.
    pub local_cache_entries: usize,
    /// Clients tracked by the local throttle.
    pub throttled_clients: usize,
    /// Live rate-limit keys in the distributed store.
    pub active_keys: u64,
    pub breaker_state: String,
}

/// Reset request: one client, one rule or all of them.
#[derive(Debug, Clone, Deserialize)]
pub struct ResetRequest {
    pub identifier: String,
    #[serde(default, rename = "ruleId")]
    pub rule_id: Option<String>,
}

impl ResetRequest {
    /// Parse from an untyped JSON body, rejecting missing or mistyped
    /// fields with a descriptive message.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, AdminError> {
        let object = value
            .as_object()
            .ok_or_else(|| AdminError::InvalidInput("body must be a JSON object".into()))?;

        let identifier = match object.get("identifier") {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::String(_)) => {
                return Err(AdminError::InvalidInput("identifier must be non-empty".into()))
            }
            Some(_) => {
                return Err(AdminError::InvalidInput("identifier must be a string".into()))
            }
            None => return Err(AdminError::InvalidInput("identifier is required".into())),
        };

        let rule_id = match object.get("ruleId") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(AdminError::InvalidInput("ruleId must be a string".into())),
        };

        Ok(Self { identifier, rule_id })
    }
}

/// Result of a reset.
#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub identifier: String,
    pub keys_reset: usize,
}

/// Handle onto the running gateway's administrative operations.
#[derive(Clone)]
pub struct AdminApi {
    cache: Arc<LimiterCache>,
    throttle: Option<Arc<LocalThrottle>>,
    rules: Vec<Arc<Rule>>,
    worker_stats: WorkerStats,
    started: Instant,
}

impl std::fmt::Debug for AdminApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminApi").field("rules", &self.rules.len()).finish_non_exhaustive()
    }
}

impl AdminApi {
    pub(crate) fn new(
        cache: Arc<LimiterCache>,
        throttle: Option<Arc<LocalThrottle>>,
        rules: Vec<Arc<Rule>>,
        worker_stats: WorkerStats,
    ) -> Self {
        Self { cache, throttle, rules, worker_stats, started: Instant::now() }
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            uptime_secs: self.started.elapsed().as_secs(),
            operations_queue: self.worker_stats.operations(),
            periodic_cleanup_queue: self.worker_stats.periodic_cleanup(),
            local_cache_entries: self.cache.fallback_len(),
            throttled_clients: self.throttle.as_ref().map(|t| t.len()).unwrap_or(0),
            active_keys: self.cache.key_count("rl:*").await,
            breaker_state: self.cache.breaker_state().to_string(),
        }
    }

    /// Reset the identifier's counters — every rule, or only `rule_id`
    /// when given — and drop its throttle record. Unknown rule ids are an
    /// input error; store failures propagate for the host's 500.
    pub async fn reset(&self, request: ResetRequest) -> Result<ResetOutcome, AdminError> {
        if request.identifier.is_empty() {
            return Err(AdminError::InvalidInput("identifier is required".into()));
        }

        let targets: Vec<&Arc<Rule>> = match &request.rule_id {
            Some(rule_id) => {
                let matched: Vec<_> =
                    self.rules.iter().filter(|rule| &rule.id == rule_id).collect();
                if matched.is_empty() {
                    return Err(AdminError::InvalidInput(format!(
                        "unknown rule id: {rule_id}"
                    )));
                }
                matched
            }
            None => self.rules.iter().collect(),
        };

        let mut keys_reset = 0;
        for rule in targets {
            let key = rule.storage_key(&request.identifier);
            self.cache.reset(&key).await?;
            keys_reset += 1;
        }

        if let Some(throttle) = &self.throttle {
            throttle.forget(&request.identifier);
        }

        info!(
            target: "tollgate::admin",
            identifier = %request.identifier,
            rule = request.rule_id.as_deref().unwrap_or("*"),
            keys_reset,
            "counters reset"
        );
        Ok(ResetOutcome { identifier: request.identifier, keys_reset })
    }
}
