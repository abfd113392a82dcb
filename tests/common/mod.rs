#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use tollgate::{
    Clock, CounterSnapshot, CounterStore, Gateway, GatewayConfig, ManualClock,
    MemoryCounterStore, RateLimitService, Rule, StoreError, TimerPacing,
};
use tower::util::ServiceFn;
use tower::{Layer, ServiceExt};

/// Inner service every harness protects: 200 with a fixed body, or the
/// status requested through the `x-test-status` header so skip policies
/// can be exercised.
pub async fn echo_handler(
    req: Request<String>,
) -> Result<Response<String>, std::convert::Infallible> {
    let status = req
        .headers()
        .get("x-test-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    let mut response = Response::new("ok".to_string());
    *response.status_mut() = status;
    Ok(response)
}

type BoxedEchoFuture = std::pin::Pin<
    Box<
        dyn std::future::Future<Output = Result<Response<String>, std::convert::Infallible>>
            + Send,
    >,
>;

pub type EchoService = ServiceFn<fn(Request<String>) -> BoxedEchoFuture>;

/// Gateway + protected service + the shared manual clock.
pub struct Harness {
    pub gateway: Gateway,
    pub clock: ManualClock,
    service: RateLimitService<EchoService>,
}

fn boxed_echo(req: Request<String>) -> BoxedEchoFuture {
    Box::pin(echo_handler(req))
}

impl Harness {
    /// Memory-backed gateway with a manual clock starting at t=1'000'000ms.
    pub fn memory(config: GatewayConfig) -> Self {
        let clock = ManualClock::starting_at(1_000_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryCounterStore::new(clock_arc.clone()));
        Self::with_store(config, store, clock)
    }

    /// Gateway over an arbitrary primary store (e.g. [`FailingStore`]).
    pub fn with_store(
        config: GatewayConfig,
        store: Arc<dyn CounterStore>,
        clock: ManualClock,
    ) -> Self {
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let gateway = Gateway::with_store_and_clock(
            config,
            store,
            clock_arc,
            Arc::new(TimerPacing),
        )
        .expect("valid test configuration");
        let service = gateway
            .layer()
            .layer(tower::service_fn(
                boxed_echo as fn(Request<String>) -> BoxedEchoFuture,
            ));
        Self { gateway, clock, service }
    }

    /// Drive one request through the gateway.
    pub async fn send(&self, request: Request<String>) -> Response<String> {
        self.service
            .clone()
            .oneshot(request)
            .await
            .expect("inner service is infallible")
    }

    /// GET `path` as client `ip` (via `x-forwarded-for`).
    pub async fn get(&self, path: &str, ip: &str) -> Response<String> {
        self.send(request(path, ip)).await
    }
}

/// Request builder used throughout the integration tests.
pub fn request(path: &str, ip: &str) -> Request<String> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(String::new())
        .expect("valid request")
}

pub fn request_with_status(path: &str, ip: &str, status: u16) -> Request<String> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .header("x-test-status", status.to_string())
        .body(String::new())
        .expect("valid request")
}

pub fn header_u64(response: &Response<String>, name: &str) -> Option<u64> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}

pub fn header_str<'a>(response: &'a Response<String>, name: &str) -> Option<&'a str> {
    response.headers().get(name)?.to_str().ok()
}

/// Primary store whose failure mode can be toggled at runtime: healthy it
/// counts in memory, failing it errors on every call. Drives the breaker
/// recovery paths without a network.
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryCounterStore,
    failing: std::sync::atomic::AtomicBool,
    pub check_calls: std::sync::atomic::AtomicUsize,
}

impl FlakyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryCounterStore::new(clock),
            failing: std::sync::atomic::AtomicBool::new(false),
            check_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), StoreError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(StoreError::Pool("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn check_and_increment(
        &self,
        key: &str,
        rule: &Rule,
    ) -> Result<CounterSnapshot, StoreError> {
        self.check_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.gate()?;
        self.inner.check_and_increment(key, rule).await
    }

    async fn current(&self, key: &str, rule: &Rule) -> Result<CounterSnapshot, StoreError> {
        self.gate()?;
        self.inner.current(key, rule).await
    }

    async fn revert(&self, key: &str, rule: &Rule) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.revert(key, rule).await
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.reset(key).await
    }

    async fn cleanup(&self, pattern: &str) -> Result<u64, StoreError> {
        self.gate()?;
        self.inner.cleanup(pattern).await
    }

    async fn key_count(&self, pattern: &str) -> Result<u64, StoreError> {
        self.gate()?;
        self.inner.key_count(pattern).await
    }
}

/// Primary store that always fails: drives the breaker and fallback
/// paths without a network.
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn check_and_increment(
        &self,
        _key: &str,
        _rule: &Rule,
    ) -> Result<CounterSnapshot, StoreError> {
        Err(StoreError::Pool("connection refused".into()))
    }

    async fn current(&self, _key: &str, _rule: &Rule) -> Result<CounterSnapshot, StoreError> {
        Err(StoreError::Pool("connection refused".into()))
    }

    async fn revert(&self, _key: &str, _rule: &Rule) -> Result<(), StoreError> {
        Err(StoreError::Pool("connection refused".into()))
    }

    async fn reset(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Pool("connection refused".into()))
    }

    async fn cleanup(&self, _pattern: &str) -> Result<u64, StoreError> {
        Err(StoreError::Pool("connection refused".into()))
    }

    async fn key_count(&self, _pattern: &str) -> Result<u64, StoreError> {
        Err(StoreError::Pool("connection refused".into()))
    }
}

/// Standard two-rule configuration: a per-minute quota and a one-second
/// burst rule.
pub fn api_and_burst(api_max: u32, burst_max: u32) -> GatewayConfig {
    GatewayConfig::default()
        .with_rule(Rule::new("api", Duration::from_secs(60), api_max))
        .with_rule(Rule::new("burst", Duration::from_secs(1), burst_max))
}
