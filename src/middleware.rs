//! Request middleware: rule composition, advisory headers, denial
//! responses, and the post-response revert hook.
//!
//! [`RateLimitLayer`] wraps any tower service whose response body can be
//! built from a `String` (axum's `Body` qualifies), so the core stays
//! framework-independent. Per request the composer throttles (optionally),
//! evaluates every applicable rule concurrently, picks the winning
//! decision — first denier in configured order, else the tightest
//! admitted rule — and stamps the advisory header sets on the response.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::future::join_all;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Request, Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, error};

use crate::cache::{Decision, LimiterCache};
use crate::clock::Clock;
use crate::config::{DenialBodyFn, GatewayConfig, KeyGeneratorFn};
use crate::identity::{extract_identifier, PeerAddr};
use crate::maintenance::MaintenanceHandle;
use crate::rule::{RequestMeta, Rule};
use crate::throttle::LocalThrottle;

const LEGACY_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const LEGACY_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const LEGACY_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const LEGACY_RETRY_AFTER: HeaderName = HeaderName::from_static("x-ratelimit-retryafter");
const STD_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const STD_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const STD_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const STD_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
const WARNING: HeaderName = HeaderName::from_static("x-ratelimit-warning");

/// `remaining / limit` at or below this ratio raises the advisory warning.
const WARNING_RATIO: f64 = 0.20;

/// One admitted rule, retained for the post-response hook.
#[derive(Debug, Clone)]
pub struct AdmittedRule {
    pub key: String,
    pub rule: Arc<Rule>,
}

/// Outcome of composing every applicable rule for one request.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// No rule applies; the request passes untouched.
    Bypass,
    Admit { winner: Decision, admitted: Vec<AdmittedRule> },
    Deny { winner: Decision, key: String },
}

/// Handle the transport invokes once the final response status is known.
///
/// The bundled service completes it itself after awaiting the inner
/// response; transports that emit the status before the limiter can see
/// it (streaming trailers, hijacked upgrades) may take it and defer.
#[derive(Debug)]
pub struct Completion {
    core: Arc<RateLimitCore>,
    admitted: Vec<AdmittedRule>,
}

impl Completion {
    /// Inspect the response status and enqueue compensating reverts when
    /// the skip policy says this request should not count.
    pub fn complete(self, status: StatusCode) {
        let successful = status.is_success();
        let failed = status.as_u16() >= 400;
        let revert = (self.core.skip_successful && successful)
            || (self.core.skip_failed && failed);
        if !revert {
            return;
        }
        for admitted in self.admitted {
            debug!(
                target: "tollgate::middleware",
                key = %admitted.key,
                rule = %admitted.rule.id,
                status = status.as_u16(),
                "scheduling revert"
            );
            self.core.maintenance.enqueue_revert(admitted.key, admitted.rule);
        }
    }
}

/// Shared composer state behind the layer, the service clones, and the
/// admin surface.
pub struct RateLimitCore {
    rules: Vec<Arc<Rule>>,
    cache: Arc<LimiterCache>,
    throttle: Option<Arc<LocalThrottle>>,
    maintenance: MaintenanceHandle,
    clock: Arc<dyn Clock>,
    standard_headers: bool,
    legacy_headers: bool,
    skip_successful: bool,
    skip_failed: bool,
    on_limit_reached: Option<DenialBodyFn>,
    key_generator: Option<KeyGeneratorFn>,
}

impl std::fmt::Debug for RateLimitCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitCore")
            .field("rules", &self.rules.len())
            .field("throttle", &self.throttle.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimitCore {
    pub(crate) fn new(
        config: &GatewayConfig,
        rules: Vec<Arc<Rule>>,
        cache: Arc<LimiterCache>,
        throttle: Option<Arc<LocalThrottle>>,
        maintenance: MaintenanceHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules,
            cache,
            throttle,
            maintenance,
            clock,
            standard_headers: config.standard_headers,
            legacy_headers: config.legacy_headers,
            skip_successful: config.skip_successful_requests,
            skip_failed: config.skip_failed_requests,
            on_limit_reached: config.on_limit_reached.clone(),
            key_generator: config.key_generator.clone(),
        }
    }

    /// The identifier the global extractor (or its override) yields.
    pub(crate) fn identifier(&self, meta: &RequestMeta<'_>) -> String {
        match &self.key_generator {
            Some(generator) => generator(meta),
            None => extract_identifier(meta.headers, meta.peer),
        }
    }

    /// Throttle, evaluate every rule concurrently, compose.
    pub(crate) async fn evaluate(&self, meta: &RequestMeta<'_>) -> Verdict {
        let identifier = self.identifier(meta);

        if let Some(throttle) = &self.throttle {
            throttle.pause(&identifier).await;
        }

        // Inert rules (skip-scoped) are excluded before evaluation. A
        // scope callback that panics makes its rule inert for this
        // request; one misbehaving rule must not take the request down.
        let applicable: Vec<(Arc<Rule>, String)> = self
            .rules
            .iter()
            .filter_map(|rule| {
                let skipped = match catch_unwind(AssertUnwindSafe(|| rule.scope().skip(meta)))
                {
                    Ok(skipped) => skipped,
                    Err(_) => {
                        error!(
                            target: "tollgate::middleware",
                            rule = %rule.id,
                            "skip predicate panicked; rule inert for this request"
                        );
                        return None;
                    }
                };
                if skipped {
                    return None;
                }
                let client = match catch_unwind(AssertUnwindSafe(|| rule.scope().key(meta))) {
                    Ok(Some(client)) => client,
                    Ok(None) => identifier.clone(),
                    Err(_) => {
                        error!(
                            target: "tollgate::middleware",
                            rule = %rule.id,
                            "key override panicked; rule inert for this request"
                        );
                        return None;
                    }
                };
                Some((rule.clone(), rule.storage_key(&client)))
            })
            .collect();

        if applicable.is_empty() {
            return Verdict::Bypass;
        }

        let decisions = join_all(
            applicable.iter().map(|(rule, key)| self.cache.check(key, rule)),
        )
        .await;

        if let Some(denied) = decisions.iter().position(|d| !d.allowed) {
            return Verdict::Deny {
                winner: decisions[denied].clone(),
                key: applicable[denied].1.clone(),
            };
        }

        // All admitted: the tightest bound describes the client's budget.
        let tightest = decisions
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.rule.max_requests)
            .map(|(i, _)| i)
            .unwrap_or(0);

        let admitted = applicable
            .into_iter()
            .map(|(rule, key)| AdmittedRule { key, rule })
            .collect();

        Verdict::Admit { winner: decisions[tightest].clone(), admitted }
    }

    pub(crate) fn completion(self: &Arc<Self>, admitted: Vec<AdmittedRule>) -> Completion {
        Completion { core: self.clone(), admitted }
    }

    /// Stamp the advisory and hardening header sets for a decision.
    pub(crate) fn apply_headers(&self, headers: &mut HeaderMap, decision: &Decision) {
        let limit = u64::from(decision.rule.max_requests);
        let remaining = decision.remaining_requests;
        let reset_unix_secs = decision.reset_time_ms / 1000;
        let now = self.clock.now_millis();
        let reset_delta_secs = decision.reset_time_ms.saturating_sub(now).div_ceil(1000);

        if self.legacy_headers {
            headers.insert(LEGACY_LIMIT, HeaderValue::from(limit));
            headers.insert(LEGACY_REMAINING, HeaderValue::from(remaining));
            headers.insert(LEGACY_RESET, HeaderValue::from(reset_unix_secs));
            if let Some(retry) = decision.retry_after_secs {
                headers.insert(LEGACY_RETRY_AFTER, HeaderValue::from(retry));
            }
        }

        if self.standard_headers {
            headers.insert(STD_LIMIT, HeaderValue::from(limit));
            headers.insert(STD_REMAINING, HeaderValue::from(remaining));
            headers.insert(STD_RESET, HeaderValue::from(reset_delta_secs));
            let policy = format!("{limit};w={}", decision.rule.window_secs());
            if let Ok(value) = HeaderValue::from_str(&policy) {
                headers.insert(STD_POLICY, value);
            }
            if let Some(retry) = decision.retry_after_secs {
                headers.insert(RETRY_AFTER, HeaderValue::from(retry));
            }
        }

        if remaining == 0 {
            headers.insert(WARNING, HeaderValue::from_static("Rate limit nearly exceeded"));
        } else if limit > 0 && (remaining as f64 / limit as f64) <= WARNING_RATIO {
            headers.insert(WARNING, HeaderValue::from_static("Approaching rate limit"));
        }

        apply_hardening_headers(headers);
    }

    /// Build the denial response: rule status code, advisory headers, and
    /// the configured (or default) JSON body.
    pub(crate) fn denial_response<B: From<String>>(&self, decision: &Decision) -> Response<B> {
        // A panicking custom producer falls back to the default body; the
        // status code is preserved either way.
        let body_value = match &self.on_limit_reached {
            Some(producer) => catch_unwind(AssertUnwindSafe(|| producer(decision)))
                .unwrap_or_else(|_| {
                    error!(
                        target: "tollgate::middleware",
                        rule = %decision.rule.id,
                        "denial body producer panicked; using default body"
                    );
                    default_denial_body(decision)
                }),
            None => default_denial_body(decision),
        };
        let body = serde_json::to_string(&body_value).unwrap_or_else(|err| {
            error!(target: "tollgate::middleware", error = %err, "denial body serialisation failed");
            serde_json::json!({ "error": "Rate limit exceeded" }).to_string()
        });

        let mut response = Response::new(B::from(body));
        *response.status_mut() = StatusCode::from_u16(decision.rule.status_code)
            .unwrap_or(StatusCode::TOO_MANY_REQUESTS);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.apply_headers(response.headers_mut(), decision);
        response
    }

    pub(crate) fn maintenance(&self) -> &MaintenanceHandle {
        &self.maintenance
    }
}

fn apply_hardening_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

fn default_denial_body(decision: &Decision) -> serde_json::Value {
    let message = decision
        .rule
        .message
        .clone()
        .unwrap_or_else(|| "Too many requests, please try again later.".to_string());
    serde_json::json!({
        "error": "Rate limit exceeded",
        "message": message,
        "ruleId": decision.rule.id,
        "limit": decision.rule.max_requests,
        "remaining": decision.remaining_requests,
        "resetTime": decision.reset_time_ms,
        "retryAfter": decision.retry_after_secs,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Layer that wraps a service with the rate-limit composer.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    core: Arc<RateLimitCore>,
}

impl RateLimitLayer {
    pub(crate) fn new(core: Arc<RateLimitCore>) -> Self {
        Self { core }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService { inner, core: self.core.clone() }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    core: Arc<RateLimitCore>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let core = self.core.clone();
        // Take the service that was polled ready; leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let peer = req.extensions().get::<PeerAddr>().map(|p| p.0);
            let meta = RequestMeta {
                method: req.method(),
                uri: req.uri(),
                headers: req.headers(),
                peer,
            };
            let verdict = core.evaluate(&meta).await;

            match verdict {
                Verdict::Bypass => inner.call(req).await,
                Verdict::Deny { winner, key } => {
                    core.maintenance().enqueue_denial_cleanup(key);
                    Ok(core.denial_response(&winner))
                }
                Verdict::Admit { winner, admitted } => {
                    let mut response = inner.call(req).await?;
                    core.apply_headers(response.headers_mut(), &winner);
                    let status = response.status();
                    core.completion(admitted).complete(status);
                    Ok(response)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::clock::ManualClock;
    use crate::maintenance::MaintenanceWorker;
    use crate::store::MemoryCounterStore;
    use std::time::Duration;

    struct Fixture {
        core: Arc<RateLimitCore>,
        worker: MaintenanceWorker,
    }

    fn fixture(mutate: impl FnOnce(&mut GatewayConfig)) -> Fixture {
        let clock_arc: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(1_000_000));
        let mut config = GatewayConfig::default();
        config.rules.push(Rule::new("api", Duration::from_secs(60), 10));
        mutate(&mut config);

        let rules: Vec<Arc<Rule>> = config.rules.iter().cloned().map(Arc::new).collect();
        let store = Arc::new(MemoryCounterStore::new(clock_arc.clone()));
        let cache = Arc::new(LimiterCache::new(
            store,
            None,
            CircuitBreaker::new(BreakerConfig::default()).with_clock(clock_arc.clone()),
            true,
            clock_arc.clone(),
        ));
        let worker = MaintenanceWorker::spawn(cache.clone(), 1, Duration::from_secs(60));
        let core = Arc::new(RateLimitCore::new(
            &config,
            rules,
            cache,
            None,
            worker.handle(),
            clock_arc,
        ));
        Fixture { core, worker }
    }

    fn decision(rule: Rule, count: u64, allowed: bool) -> Decision {
        let rule = Arc::new(rule);
        let remaining = u64::from(rule.max_requests).saturating_sub(count);
        Decision {
            allowed,
            total_requests: count,
            remaining_requests: remaining,
            reset_time_ms: 1_020_000,
            retry_after_secs: (!allowed).then_some(20),
            rule,
        }
    }

    #[tokio::test]
    async fn legacy_headers_can_be_disabled() {
        let fixture = fixture(|config| config.legacy_headers = false);
        let mut headers = HeaderMap::new();
        let d = decision(Rule::new("api", Duration::from_secs(60), 10), 3, true);
        fixture.core.apply_headers(&mut headers, &d);

        assert!(headers.get("x-ratelimit-limit").is_none());
        assert_eq!(headers.get("ratelimit-limit").unwrap(), "10");
        assert_eq!(headers.get("ratelimit-remaining").unwrap(), "7");
        fixture.worker.shutdown().await;
    }

    #[tokio::test]
    async fn standard_headers_can_be_disabled() {
        let fixture = fixture(|config| config.standard_headers = false);
        let mut headers = HeaderMap::new();
        let d = decision(Rule::new("api", Duration::from_secs(60), 10), 3, true);
        fixture.core.apply_headers(&mut headers, &d);

        assert!(headers.get("ratelimit-limit").is_none());
        assert!(headers.get("ratelimit-policy").is_none());
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
        fixture.worker.shutdown().await;
    }

    #[tokio::test]
    async fn reset_headers_use_both_conventions() {
        // Legacy reports absolute unix seconds, standard reports the
        // delta until reset.
        let fixture = fixture(|_| {});
        let mut headers = HeaderMap::new();
        let d = decision(Rule::new("api", Duration::from_secs(60), 10), 1, true);
        fixture.core.apply_headers(&mut headers, &d);

        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1020");
        assert_eq!(headers.get("ratelimit-reset").unwrap(), "20");
        fixture.worker.shutdown().await;
    }

    #[tokio::test]
    async fn denial_response_keeps_the_rule_status() {
        let fixture = fixture(|_| {});
        let d = decision(
            Rule::new("auth", Duration::from_secs(300), 5).with_status_code(423),
            5,
            false,
        );
        let response: Response<String> = fixture.core.denial_response(&d);
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert_eq!(response.headers().get("retry-after").unwrap(), "20");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["ruleId"], "auth");
        fixture.worker.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_status_codes_fall_back_to_429() {
        let fixture = fixture(|_| {});
        let d = decision(
            Rule::new("api", Duration::from_secs(60), 10).with_status_code(99),
            10,
            false,
        );
        let response: Response<String> = fixture.core.denial_response(&d);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        fixture.worker.shutdown().await;
    }

    #[tokio::test]
    async fn completion_without_skip_policy_enqueues_nothing() {
        let fixture = fixture(|_| {});
        let rule = Arc::new(Rule::new("api", Duration::from_secs(60), 10));
        let admitted =
            vec![AdmittedRule { key: rule.storage_key("10.0.0.1"), rule: rule.clone() }];
        fixture.core.completion(admitted).complete(StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = fixture.worker.operations_stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.completed, 0);
        fixture.worker.shutdown().await;
    }

    #[tokio::test]
    async fn completion_with_skip_successful_reverts_each_admitted_rule() {
        let fixture = fixture(|config| config.skip_successful_requests = true);
        let rule = Arc::new(Rule::new("api", Duration::from_secs(60), 10));
        let admitted =
            vec![AdmittedRule { key: rule.storage_key("10.0.0.1"), rule: rule.clone() }];
        fixture.core.completion(admitted).complete(StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = fixture.worker.operations_stats();
        assert_eq!(stats.completed, 1);
        fixture.worker.shutdown().await;
    }

    #[tokio::test]
    async fn completion_skip_failed_ignores_successes() {
        let fixture = fixture(|config| config.skip_failed_requests = true);
        let rule = Arc::new(Rule::new("api", Duration::from_secs(60), 10));
        let admitted =
            vec![AdmittedRule { key: rule.storage_key("10.0.0.1"), rule: rule.clone() }];

        fixture.core.completion(admitted.clone()).complete(StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.worker.operations_stats().completed, 0);

        fixture.core.completion(admitted).complete(StatusCode::BAD_GATEWAY);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fixture.worker.operations_stats().completed, 1);
        fixture.worker.shutdown().await;
    }
}
