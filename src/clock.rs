//! Clock abstractions used by the counter stores, breaker, and throttle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe time source abstraction.
///
/// Implementers must document their origin. Counter scores, window reset
/// times, and TTLs are all wall-clock values shared with the distributed
/// store, so production implementations must use milliseconds since the
/// UNIX epoch. Calls must be safe concurrently (`Send + Sync`). Overflow
/// must not silently wrap; prefer saturating semantics and document the
/// choice.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds since the implementer's origin.
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by `SystemTime::now()`, origin UNIX epoch.
///
/// Readings from different processes are comparable, which is what keys
/// the shared sorted-set scores. A system clock stepped backwards can
/// yield non-monotonic readings; the store scripts tolerate that by
/// treating scores as opaque ordering keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    /// Milliseconds since the UNIX epoch; saturates to 0 if the system
    /// clock reads before 1970.
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock at a specific reading.
    pub fn starting_at(millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(millis)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
