//! Error types for the rate-limiting core.
//!
//! The request-admission path never surfaces these to a client: store
//! failures degrade through the fixed-window path, the local fallback, and
//! finally the fail-open decision. They exist so that the cache layer can
//! feed the circuit breaker and so that administrative callers can map
//! failures to proper status codes.

use std::time::Duration;

/// Failures raised by a counter store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not obtain a connection from the pool.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// The backend rejected or failed the command.
    #[error("store command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// A server-side script returned a malformed reply.
    #[error("script returned malformed reply: {0}")]
    MalformedReply(String),

    /// The call did not complete within the per-call deadline.
    #[error("store call timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    /// All bounded retries for one logical operation were spent.
    #[error("store operation exhausted {attempts} attempts; last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Failures surfaced by the administrative API.
///
/// `InvalidInput` maps to 400 at the host, `Store` to 500.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_error_wraps_store_error() {
        let err: AdminError = StoreError::Pool("pool drained".into()).into();
        assert!(matches!(err, AdminError::Store(_)));
        assert!(err.to_string().contains("pool drained"));
    }

    #[test]
    fn timeout_display_carries_both_durations() {
        let err = StoreError::Timeout {
            elapsed: Duration::from_millis(250),
            limit: Duration::from_millis(200),
        };
        let msg = err.to_string();
        assert!(msg.contains("250"));
        assert!(msg.contains("200"));
    }
}
