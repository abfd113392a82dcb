//! Gateway configuration.
//!
//! Plain policy knobs are serde-friendly so deployments can load them
//! from files; the two behavioural hooks (denial body producer, global
//! key generator) are process-local callbacks and are skipped during
//! (de)serialization. Environment variables overlay the store connection
//! and host-facing settings.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::Decision;
use crate::rule::{RequestMeta, Rule};

/// Produces the JSON denial body for a denied decision.
pub type DenialBodyFn = Arc<dyn Fn(&Decision) -> serde_json::Value + Send + Sync>;

/// Global override for deriving the client identifier.
pub type KeyGeneratorFn = Arc<dyn for<'a> Fn(&RequestMeta<'a>) -> String + Send + Sync>;

/// Configuration rejected before startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("rule id must not be empty")]
    EmptyRuleId,
    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),
    #[error("rule {0} has max_requests = 0")]
    ZeroLimit(String),
    #[error("rule {0} has an empty window")]
    ZeroWindow(String),
}

/// Connection settings for the distributed counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    /// Bounded retries per logical store operation.
    #[serde(default = "default_max_retries")]
    pub max_retries_per_request: u32,
    /// Per-call deadline in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            max_retries_per_request: default_max_retries(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_max_retries() -> u32 {
    3
}
fn default_call_timeout_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_max_throttle_delay_ms() -> u64 {
    1000
}
fn default_local_cache_ttl_ms() -> u64 {
    60_000
}
fn default_worker_count() -> usize {
    2
}
fn default_port() -> u16 {
    8080
}
fn default_environment() -> String {
    "development".to_string()
}

/// Everything the gateway component recognises.
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Policies evaluated per request, in priority order: when several
    /// rules deny at once, the first configured denier wins.
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Emit the draft-standard `RateLimit-*` headers.
    #[serde(default = "default_true")]
    pub standard_headers: bool,
    /// Emit the legacy `X-RateLimit-*` headers.
    #[serde(default = "default_true")]
    pub legacy_headers: bool,

    /// Revert admissions whose response landed in [200, 300).
    #[serde(default)]
    pub skip_successful_requests: bool,
    /// Revert admissions whose response status was >= 400.
    #[serde(default)]
    pub skip_failed_requests: bool,

    #[serde(default)]
    pub enable_local_throttle: bool,
    #[serde(default = "default_max_throttle_delay_ms")]
    pub max_throttle_delay_ms: u64,

    /// Keep per-client counters in process memory while the distributed
    /// store is unreachable.
    #[serde(default)]
    pub enable_in_memory_fallback: bool,
    /// Admit when the limiter cannot decide (availability over
    /// strictness). Switch off to deny instead.
    #[serde(default = "default_true")]
    pub fail_open_when_unavailable: bool,

    #[serde(default)]
    pub redis: RedisConfig,

    /// Fallback sweep interval in milliseconds.
    #[serde(default = "default_local_cache_ttl_ms")]
    pub local_cache_ttl_ms: u64,
    /// Concurrent maintenance jobs.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Host-facing settings the embedding server reads back out.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Custom denial body producer; the default body is used when absent
    /// or when the producer panics.
    #[serde(skip)]
    pub on_limit_reached: Option<DenialBodyFn>,
    /// Global identifier override; per-rule scopes still win.
    #[serde(skip)]
    pub key_generator: Option<KeyGeneratorFn>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            standard_headers: true,
            legacy_headers: true,
            skip_successful_requests: false,
            skip_failed_requests: false,
            enable_local_throttle: false,
            max_throttle_delay_ms: default_max_throttle_delay_ms(),
            enable_in_memory_fallback: false,
            fail_open_when_unavailable: true,
            redis: RedisConfig::default(),
            local_cache_ttl_ms: default_local_cache_ttl_ms(),
            worker_count: default_worker_count(),
            allowed_origins: Vec::new(),
            port: default_port(),
            environment: default_environment(),
            on_limit_reached: None,
            key_generator: None,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("rules", &self.rules)
            .field("standard_headers", &self.standard_headers)
            .field("legacy_headers", &self.legacy_headers)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .field("enable_local_throttle", &self.enable_local_throttle)
            .field("enable_in_memory_fallback", &self.enable_in_memory_fallback)
            .field("fail_open_when_unavailable", &self.fail_open_when_unavailable)
            .field("worker_count", &self.worker_count)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    /// Defaults overlaid with recognised environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`,
    /// `ALLOWED_ORIGINS`, `PORT`, `APP_ENV`, `LOCAL_CACHE_TTL_MS`, and
    /// `WORKER_COUNT`. Unparseable values are logged and skipped.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            if !host.is_empty() {
                self.redis.host = host;
            }
        }
        if let Some(port) = env_parsed::<u16>("REDIS_PORT") {
            self.redis.port = port;
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            if !password.is_empty() {
                self.redis.password = Some(password);
            }
        }
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            self.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(port) = env_parsed::<u16>("PORT") {
            self.port = port;
        }
        if let Ok(environment) = std::env::var("APP_ENV") {
            if !environment.is_empty() {
                self.environment = environment;
            }
        }
        if let Some(ttl) = env_parsed::<u64>("LOCAL_CACHE_TTL_MS") {
            self.local_cache_ttl_ms = ttl;
        }
        if let Some(count) = env_parsed::<usize>("WORKER_COUNT") {
            self.worker_count = count.max(1);
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn local_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.local_cache_ttl_ms)
    }

    pub fn max_throttle_delay(&self) -> Duration {
        Duration::from_millis(self.max_throttle_delay_ms)
    }

    /// Reject configurations that cannot express a coherent policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if rule.id.is_empty() {
                return Err(ConfigError::EmptyRuleId);
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::DuplicateRuleId(rule.id.clone()));
            }
            if rule.max_requests == 0 {
                return Err(ConfigError::ZeroLimit(rule.id.clone()));
            }
            if rule.window.is_zero() {
                return Err(ConfigError::ZeroWindow(rule.id.clone()));
            }
        }
        Ok(())
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(target: "tollgate::config", var = name, value = %raw, "unparseable environment override");
                None
            }
        },
        _ => None,
    }
}
