//! Rate-limit policy records.
//!
//! A [`Rule`] binds a window, a limit, and a counting algorithm to a
//! scope. Rules are immutable once configured; the storage key embeds a
//! digest of the limiting parameters so that reconfiguring a rule can
//! never reuse counters accumulated under the old parameters.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Counting algorithm for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Count arrivals strictly within `(now - window, now]` using a
    /// per-request timestamp set.
    #[default]
    Sliding,
    /// Count arrivals in the discrete window aligned on multiples of the
    /// window length.
    Fixed,
}

/// Borrowed view of the request metadata a rule may inspect.
///
/// Rules never see the body; scoping decisions are made from routing
/// metadata only.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub peer: Option<SocketAddr>,
}

/// Per-rule scoping capability.
///
/// Static rules use [`DefaultScope`]; rules that need a custom client key
/// or a bypass predicate implement the relevant method. Keeping this a
/// trait (rather than boxed closures inside [`Rule`]) keeps rule records
/// serialisable and the intent nameable.
pub trait RuleScope: Send + Sync {
    /// When true, the rule is inert for this request and excluded from
    /// composition.
    fn skip(&self, req: &RequestMeta<'_>) -> bool {
        let _ = req;
        false
    }

    /// Override the client key for this rule. `None` defers to the global
    /// identifier extractor.
    fn key(&self, req: &RequestMeta<'_>) -> Option<String> {
        let _ = req;
        None
    }
}

/// Scope with no skip predicate and no key override.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScope;

impl RuleScope for DefaultScope {}

/// Scope that applies the rule only to paths under a prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixScope {
    prefix: String,
}

impl PathPrefixScope {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl RuleScope for PathPrefixScope {
    fn skip(&self, req: &RequestMeta<'_>) -> bool {
        !req.uri.path().starts_with(&self.prefix)
    }
}

fn default_scope() -> Arc<dyn RuleScope> {
    Arc::new(DefaultScope)
}

fn default_status_code() -> u16 {
    429
}

/// One rate-limiting policy.
#[derive(Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule id, reported in denial bodies and admin calls.
    pub id: String,
    /// Aggregation window.
    #[serde(with = "duration_millis")]
    pub window: Duration,
    /// Maximum admissions per window. Must be positive.
    pub max_requests: u32,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Status code returned on denial (429 unless overridden; auth-class
    /// rules conventionally use 423).
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    /// Optional denial message override.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(skip, default = "default_scope")]
    scope: Arc<dyn RuleScope>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("algorithm", &self.algorithm)
            .field("status_code", &self.status_code)
            .finish_non_exhaustive()
    }
}

impl Rule {
    /// Create a sliding-window rule with the default 429 status.
    pub fn new(id: impl Into<String>, window: Duration, max_requests: u32) -> Self {
        Self {
            id: id.into(),
            window,
            max_requests,
            algorithm: Algorithm::Sliding,
            status_code: default_status_code(),
            message: None,
            scope: default_scope(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_scope(mut self, scope: impl RuleScope + 'static) -> Self {
        self.scope = Arc::new(scope);
        self
    }

    pub fn scope(&self) -> &dyn RuleScope {
        self.scope.as_ref()
    }

    pub fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Window length in whole seconds, rounded up, minimum 1.
    pub fn window_secs(&self) -> u64 {
        self.window_millis().div_ceil(1000).max(1)
    }

    /// Short digest of the limiting parameters. Changing `window` or
    /// `max_requests` (or reusing an id with different parameters) yields
    /// a different digest and therefore fresh counters.
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.window_millis().to_be_bytes());
        hasher.update(self.max_requests.to_be_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(8);
        for byte in &digest[..4] {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Build the storage key for one client under this rule:
    /// `rl:{id}:{hash}:{identifier}`, identifier restricted to
    /// `[A-Za-z0-9._-]` with every other byte replaced by `_`.
    pub fn storage_key(&self, identifier: &str) -> String {
        format!(
            "rl:{}:{}:{}",
            self.id,
            self.config_hash(),
            sanitize_key_component(identifier)
        )
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
fn sanitize_key_component(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta<'a>(
        method: &'a Method,
        uri: &'a Uri,
        headers: &'a HeaderMap,
    ) -> RequestMeta<'a> {
        RequestMeta { method, uri, headers, peer: None }
    }

    #[test]
    fn storage_key_shape() {
        let rule = Rule::new("api", Duration::from_secs(60), 300);
        let key = rule.storage_key("203.0.113.9");
        assert!(key.starts_with("rl:api:"));
        assert!(key.ends_with(":203.0.113.9"));
        assert_eq!(key.split(':').count(), 4);
    }

    #[test]
    fn key_component_is_restricted_charset() {
        let rule = Rule::new("api", Duration::from_secs(60), 300);
        let key = rule.storage_key("2001:db8::5");
        let component = key.rsplit(':').next().unwrap();
        assert_eq!(component, "2001_db8__5");
        assert!(component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
    }

    #[test]
    fn changing_limit_changes_hash() {
        let before = Rule::new("api", Duration::from_secs(60), 300);
        let after = Rule::new("api", Duration::from_secs(60), 500);
        assert_ne!(before.config_hash(), after.config_hash());
        assert_ne!(before.storage_key("::1"), after.storage_key("::1"));
    }

    #[test]
    fn changing_window_changes_hash() {
        let before = Rule::new("api", Duration::from_secs(60), 300);
        let after = Rule::new("api", Duration::from_secs(120), 300);
        assert_ne!(before.config_hash(), after.config_hash());
    }

    #[test]
    fn same_parameters_same_hash() {
        let a = Rule::new("api", Duration::from_secs(60), 300);
        let b = Rule::new("api", Duration::from_secs(60), 300);
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn reused_id_with_other_parameters_never_collides() {
        let a = Rule::new("burst", Duration::from_millis(1000), 50);
        let b = Rule::new("burst", Duration::from_millis(1000), 10);
        assert_ne!(a.storage_key("10.0.0.1"), b.storage_key("10.0.0.1"));
    }

    #[test]
    fn default_scope_is_inert_never() {
        let rule = Rule::new("api", Duration::from_secs(60), 300);
        let method = Method::GET;
        let uri: Uri = "/api/data".parse().unwrap();
        let headers = HeaderMap::new();
        assert!(!rule.scope().skip(&meta(&method, &uri, &headers)));
        assert!(rule.scope().key(&meta(&method, &uri, &headers)).is_none());
    }

    #[test]
    fn path_prefix_scope_skips_other_paths() {
        let rule = Rule::new("auth", Duration::from_secs(300), 5)
            .with_scope(PathPrefixScope::new("/auth"));
        let method = Method::POST;
        let headers = HeaderMap::new();

        let login: Uri = "/auth/login".parse().unwrap();
        assert!(!rule.scope().skip(&meta(&method, &login, &headers)));

        let health: Uri = "/health".parse().unwrap();
        assert!(rule.scope().skip(&meta(&method, &health, &headers)));
    }

    #[test]
    fn window_secs_rounds_up() {
        assert_eq!(Rule::new("a", Duration::from_millis(1500), 5).window_secs(), 2);
        assert_eq!(Rule::new("b", Duration::from_millis(900), 5).window_secs(), 1);
        assert_eq!(Rule::new("c", Duration::from_secs(60), 5).window_secs(), 60);
    }

    #[test]
    fn serde_round_trip_restores_default_scope() {
        let rule = Rule::new("api", Duration::from_secs(60), 300)
            .with_status_code(423)
            .with_message("slow down");
        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "api");
        assert_eq!(back.window, Duration::from_secs(60));
        assert_eq!(back.max_requests, 300);
        assert_eq!(back.status_code, 423);
        assert_eq!(back.message.as_deref(), Some("slow down"));
    }
}
