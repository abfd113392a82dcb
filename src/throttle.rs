//! Per-client inter-arrival smoothing.
//!
//! An optional stage ahead of rule evaluation that spaces a client's
//! requests at least `window / max_requests` apart by waiting, bounded by
//! a configurable ceiling. It deliberately trades latency for smoothness:
//! a client bursting under the limit is slowed instead of denied.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock::Clock;

/// Entries beyond this trigger a sweep on the next arrival.
const SWEEP_SIZE_THRESHOLD: usize = 1000;

/// Entries idle longer than this are swept.
const SWEEP_MAX_AGE: Duration = Duration::from_secs(60);

/// How the throttle waits out a computed smoothing delay.
///
/// The only production implementation parks the task on the tokio timer;
/// test implementations capture the computed delays instead so pacing
/// behavior can be asserted without real time passing.
pub trait Pacing: Send + Sync + std::fmt::Debug {
    fn pace(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Pace requests on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerPacing;

impl Pacing for TimerPacing {
    fn pace(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(delay))
    }
}

/// Record every computed delay and return immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordedPacing {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordedPacing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays the throttle has imposed so far, in arrival order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    pub fn clear(&self) {
        self.delays.lock().clear();
    }
}

impl Pacing for RecordedPacing {
    fn pace(&self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.delays.lock().push(delay);
        Box::pin(async {})
    }
}

/// Map of client identifier to last-arrival instant, with smoothing.
pub struct LocalThrottle {
    last_arrival: DashMap<String, u64>,
    min_interval_ms: u64,
    max_delay: Duration,
    clock: Arc<dyn Clock>,
    pacing: Arc<dyn Pacing>,
}

impl std::fmt::Debug for LocalThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalThrottle")
            .field("min_interval_ms", &self.min_interval_ms)
            .field("max_delay", &self.max_delay)
            .field("tracked_clients", &self.last_arrival.len())
            .finish()
    }
}

impl LocalThrottle {
    /// `min_interval` is the smoothing target, typically
    /// `burst_window / burst_max_requests`.
    pub fn new(
        min_interval: Duration,
        max_delay: Duration,
        clock: Arc<dyn Clock>,
        pacing: Arc<dyn Pacing>,
    ) -> Self {
        Self {
            last_arrival: DashMap::new(),
            min_interval_ms: u64::try_from(min_interval.as_millis()).unwrap_or(u64::MAX),
            max_delay,
            clock,
            pacing,
        }
    }

    /// Delay this arrival enough to keep the client at the smoothing
    /// interval, then record it.
    pub async fn pause(&self, identifier: &str) {
        self.maybe_sweep();

        let now = self.clock.now_millis();
        let delay = match self.last_arrival.get(identifier).map(|last| *last) {
            Some(last) => {
                let since = now.saturating_sub(last);
                Duration::from_millis(self.min_interval_ms.saturating_sub(since))
                    .min(self.max_delay)
            }
            None => Duration::ZERO,
        };

        if !delay.is_zero() {
            self.pacing.pace(delay).await;
        }
        self.last_arrival.insert(identifier.to_string(), self.clock.now_millis());
    }

    /// Drop the client's record (administrative reset).
    pub fn forget(&self, identifier: &str) {
        self.last_arrival.remove(identifier);
    }

    /// Tracked clients (admin stats).
    pub fn len(&self) -> usize {
        self.last_arrival.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_arrival.is_empty()
    }

    /// Size-threshold sweep plus age sweep; lazy cleanup alone would let
    /// the map grow with one entry per client ever seen.
    fn maybe_sweep(&self) {
        if self.last_arrival.len() <= SWEEP_SIZE_THRESHOLD {
            return;
        }
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(u64::try_from(SWEEP_MAX_AGE.as_millis()).unwrap_or(u64::MAX));
        self.last_arrival.retain(|_, last| *last >= cutoff);
    }
}
