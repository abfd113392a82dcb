//! Client identifier extraction.
//!
//! Derives the string that keys rate-limit counters for one client.
//! Proxy headers are consulted in a fixed precedence order before the raw
//! peer address, and the chosen candidate is sanitised so header-injection
//! attempts cannot smuggle newlines or control characters into downstream
//! keys or logs.

use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;

/// Header precedence, most specific first. The first header present wins,
/// and for comma-separated lists the first element is the client.
const IDENTIFIER_HEADERS: [&str; 4] =
    ["x-forwarded-for", "x-real-ip", "x-client-ip", "cf-connecting-ip"];

/// Longest identifier kept, in bytes. 45 covers a full IPv6 literal with
/// an IPv4-mapped tail.
const MAX_IDENTIFIER_LEN: usize = 45;

/// Peer address extension inserted by the transport layer.
///
/// The middleware looks this up in request extensions; hosts that know the
/// peer socket address should insert it when accepting the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Extract the client identifier for a request.
///
/// Returns a trimmed, control-character-free string of at most 45 bytes.
/// Candidates that parse as IPv4/IPv6 literals are kept verbatim; anything
/// else is kept as-is when non-empty, otherwise `"unknown"`. Loopback
/// peers are identified by bare address; other peers carry a `host:port`
/// suffix so distinct sockets behind one NAT hop stay distinguishable.
pub fn extract_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    for name in IDENTIFIER_HEADERS {
        if let Some(value) = headers.get(name) {
            if let Ok(raw) = value.to_str() {
                let first = raw.split(',').next().unwrap_or(raw);
                let cleaned = sanitize(first);
                if !cleaned.is_empty() {
                    return cleaned;
                }
            }
        }
    }

    let fallback = match peer {
        Some(addr) if is_loopback(addr.ip()) => addr.ip().to_string(),
        Some(addr) => sanitize(&addr.to_string()),
        None => String::new(),
    };
    if fallback.is_empty() {
        "unknown".to_string()
    } else {
        fallback
    }
}

/// Trim, strip control characters, truncate, validate as an IP literal.
/// Non-literals are kept as-is; the result may be empty.
fn sanitize(candidate: &str) -> String {
    let stripped: String = candidate
        .trim()
        .chars()
        .filter(|c| !is_forbidden(*c))
        .collect();
    let truncated = truncate_to_boundary(&stripped, MAX_IDENTIFIER_LEN);

    if truncated.parse::<IpAddr>().is_ok() {
        return truncated.to_string();
    }
    truncated.to_string()
}

/// Control characters plus the C1 range, which some proxies leak through.
fn is_forbidden(c: char) -> bool {
    matches!(c, '\x00'..='\x1f' | '\u{7f}'..='\u{9f}')
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Cut at `max` bytes without splitting a UTF-8 character.
fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
