//! Circuit breaker guarding the distributed store, with lock-free atomics.
//!
//! Unlike a breaker that rejects calls outright, this one always has
//! somewhere to go: when the circuit is open the caller's fallback path
//! produces the result instead of the primary. Only check-and-increment
//! traffic is routed through the breaker; observational and
//! administrative store calls bypass it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// Time the circuit stays open before a recovery probe.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(30) }
    }
}

struct BreakerInner {
    state: AtomicU8,
    failure_count: AtomicUsize,
    last_failure_millis: AtomicU64,
}

/// Circuit breaker with a mandatory fallback path.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(BreakerInner {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                last_failure_millis: AtomicU64::new(0),
            }),
            config,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn failure_count(&self) -> usize {
        self.inner.failure_count.load(Ordering::Acquire)
    }

    /// Run `primary`, or the fallback when the circuit is open.
    ///
    /// Closed: primary runs; success resets the failure count, failure
    /// increments it and opens the circuit at the threshold. Open: the
    /// primary is skipped entirely until `recovery_timeout` has elapsed
    /// since the last failure, at which point one caller wins the
    /// transition to half-open and probes the primary — success closes the
    /// circuit, failure reopens it. Every path that does not produce a
    /// primary result produces the fallback's.
    pub async fn execute<T, P, PFut, F, FFut>(&self, primary: P, fallback: F) -> T
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, StoreError>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = T>,
    {
        if !self.try_acquire() {
            return fallback().await;
        }

        match primary().await {
            Ok(value) => {
                self.on_success();
                value
            }
            Err(err) => {
                self.on_failure(&err);
                fallback().await
            }
        }
    }

    /// Decide whether the primary may be attempted, performing the
    /// open → half-open transition when the recovery timeout has elapsed.
    fn try_acquire(&self) -> bool {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                STATE_CLOSED => return true,
                STATE_HALF_OPEN => return false,
                STATE_OPEN => {
                    let last = self.inner.last_failure_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(last);
                    if elapsed <= self.config.recovery_timeout.as_millis() as u64 {
                        return false;
                    }
                    match self.inner.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!(target: "tollgate::breaker", "circuit half-open, probing store");
                            return true;
                        }
                        // Lost the race; re-read the state.
                        Err(_) => continue,
                    }
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    fn on_success(&self) {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner.failure_count.store(0, Ordering::Release);
                    tracing::info!(target: "tollgate::breaker", "circuit closed");
                }
            }
            STATE_CLOSED => {
                self.inner.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self, err: &StoreError) {
        let failures = self.inner.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.last_failure_millis.store(self.clock.now_millis(), Ordering::Release);

        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::warn!(
                        target: "tollgate::breaker",
                        failures,
                        error = %err,
                        "recovery probe failed, circuit open"
                    );
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    tracing::error!(
                        target: "tollgate::breaker",
                        failures,
                        threshold = self.config.failure_threshold,
                        error = %err,
                        "circuit open"
                    );
                }
            }
            _ => {}
        }
    }
}
