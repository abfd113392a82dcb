#![forbid(unsafe_code)]

//! # tollgate
//!
//! Multi-rule HTTP rate limiting for gateway services: sliding-window
//! counters shared through Redis, a circuit-broken in-memory fallback,
//! tower middleware with advisory headers, and an asynchronous
//! maintenance pipeline for compensating reverts and expiry cleanup.
//!
//! ## Features
//!
//! - **Multiple overlapping rules** with differing windows; the first
//!   denier wins, otherwise the tightest admitted rule describes the
//!   client's budget
//! - **Sliding and fixed window counters**, atomic via server-side
//!   scripts on the shared store
//! - **Partial-failure tolerance**: sliding degrades to fixed, the store
//!   degrades to process-local counters behind a circuit breaker, and the
//!   limiter itself never turns an admission into a server error
//! - **Post-response reverts**: admissions that should not count (2xx
//!   and/or 4xx+, by policy) are compensated asynchronously
//! - **Advisory headers**: legacy `X-RateLimit-*`, draft `RateLimit-*`,
//!   graduated warnings, and response hardening
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tollgate::{Gateway, GatewayConfig, Rule};
//!
//! # fn main() -> Result<(), tollgate::GatewayError> {
//! let config = GatewayConfig::from_env()
//!     .with_rule(Rule::new("api", Duration::from_secs(60), 300))
//!     .with_rule(Rule::new("burst", Duration::from_secs(1), 50));
//!
//! let gateway = Gateway::connect(config)?;
//! let layer = gateway.layer(); // wrap your router with this
//! let admin = gateway.admin(); // stats + reset for the ops endpoints
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backoff;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod maintenance;
pub mod middleware;
pub mod rule;
pub mod store;
pub mod throttle;

// Re-exports
pub use admin::{AdminApi, GatewayStats, ResetOutcome, ResetRequest};
pub use backoff::Backoff;
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cache::{Decision, LimiterCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GatewayConfig, RedisConfig};
pub use error::{AdminError, StoreError};
pub use gateway::{Gateway, GatewayError};
pub use identity::{extract_identifier, PeerAddr};
pub use maintenance::{MaintenanceHandle, MaintenanceWorker, QueueStats};
pub use middleware::{Completion, RateLimitLayer, RateLimitService};
pub use rule::{Algorithm, DefaultScope, PathPrefixScope, RequestMeta, Rule, RuleScope};
pub use store::{CounterSnapshot, CounterStore, MemoryCounterStore, RedisCounterStore};
pub use throttle::{LocalThrottle, Pacing, RecordedPacing, TimerPacing};
