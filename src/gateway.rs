//! Gateway assembly.
//!
//! Wires the configured pieces together — store, breaker, cache,
//! throttle, maintenance worker — and hands out the three surfaces an
//! embedding server needs: the tower [`RateLimitLayer`], the
//! [`AdminApi`], and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use crate::admin::AdminApi;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::cache::LimiterCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, GatewayConfig};
use crate::error::StoreError;
use crate::maintenance::MaintenanceWorker;
use crate::middleware::{RateLimitCore, RateLimitLayer};
use crate::rule::Rule;
use crate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};
use crate::throttle::{LocalThrottle, Pacing, TimerPacing};

/// Startup failures.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fully wired rate-limiting gateway component.
pub struct Gateway {
    core: Arc<RateLimitCore>,
    admin: AdminApi,
    worker: MaintenanceWorker,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("core", &self.core).finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build against the configured Redis store.
    pub fn connect(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let primary: Arc<dyn CounterStore> =
            Arc::new(RedisCounterStore::connect(&config.redis, clock.clone())?);
        Ok(Self::assemble(config, primary, clock, Arc::new(TimerPacing)))
    }

    /// Build on a caller-supplied primary store (single-instance
    /// deployments, tests).
    pub fn with_store(
        config: GatewayConfig,
        primary: Arc<dyn CounterStore>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        Ok(Self::assemble(config, primary, clock, Arc::new(TimerPacing)))
    }

    /// Build with injected time sources (deterministic tests).
    pub fn with_store_and_clock(
        config: GatewayConfig,
        primary: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        pacing: Arc<dyn Pacing>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        Ok(Self::assemble(config, primary, clock, pacing))
    }

    fn assemble(
        config: GatewayConfig,
        primary: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        pacing: Arc<dyn Pacing>,
    ) -> Self {
        let rules: Vec<Arc<Rule>> = config.rules.iter().cloned().map(Arc::new).collect();

        let fallback = config
            .enable_in_memory_fallback
            .then(|| Arc::new(MemoryCounterStore::new(clock.clone())));

        let cache = Arc::new(LimiterCache::new(
            primary,
            fallback,
            CircuitBreaker::new(BreakerConfig::default()).with_clock(clock.clone()),
            config.fail_open_when_unavailable,
            clock.clone(),
        ));

        let throttle = config.enable_local_throttle.then(|| {
            Arc::new(LocalThrottle::new(
                throttle_interval(&rules),
                config.max_throttle_delay(),
                clock.clone(),
                pacing,
            ))
        });

        let worker =
            MaintenanceWorker::spawn(cache.clone(), config.worker_count, config.local_cache_ttl());

        let admin =
            AdminApi::new(cache.clone(), throttle.clone(), rules.clone(), worker.stats());

        let core = Arc::new(RateLimitCore::new(
            &config,
            rules,
            cache,
            throttle,
            worker.handle(),
            clock,
        ));

        Self { core, admin, worker }
    }

    /// Tower layer to wrap the protected routes with.
    pub fn layer(&self) -> RateLimitLayer {
        RateLimitLayer::new(self.core.clone())
    }

    pub fn admin(&self) -> AdminApi {
        self.admin.clone()
    }

    /// Pause the maintenance queues, drain active jobs (bounded), and
    /// release the worker tasks.
    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}

/// The smoothing interval comes from the tightest configured rule (the
/// burst rule by convention): `window / max_requests`.
fn throttle_interval(rules: &[Arc<Rule>]) -> Duration {
    rules
        .iter()
        .min_by_key(|rule| rule.window)
        .map(|rule| rule.window / rule.max_requests.max(1))
        .unwrap_or(Duration::ZERO)
}
