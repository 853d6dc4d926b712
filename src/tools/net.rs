//! Shared SSRF guard and circuit breaker for the OpenAPI and MCP tool factories.
//!
//! DNS-resolves the target host and rejects loopback, link-local, private, and cloud-metadata
//! addresses before a single byte goes out; the circuit breaker is grounded in the "5 failures ->
//! open for 60s, half-open on trial" contract both factories share.

use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::GatewayError;

pub(crate) fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

/// Deny-list covering loopback, link-local/metadata, RFC-1918, and IPv6
/// loopback/unspecified/link-local ranges.
pub(crate) fn is_ssrf_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            if o[0] == 127 {
                return true;
            }
            if o[0] == 169 && o[1] == 254 {
                return true;
            }
            if o[0] == 10 {
                return true;
            }
            if o[0] == 172 && (16..=31).contains(&o[1]) {
                return true;
            }
            if o[0] == 192 && o[1] == 168 {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Resolve `host` off the executor thread and reject it if any address is private, loopback,
/// link-local, or a reserved/metadata range (§4.7 "Security invariants shared by OpenAPI and
/// MCP callers").
pub async fn check_ssrf_blocked(host: &str) -> Result<(), GatewayError> {
    let host_owned = host.to_string();
    let addrs = tokio::task::spawn_blocking(move || {
        use std::net::ToSocketAddrs;
        format!("{host_owned}:443").to_socket_addrs()
    })
    .await
    .map_err(|e| GatewayError::Config(format!("DNS resolution task failed: {e}")))?
    .map_err(|_| GatewayError::SsrfBlocked { host: host.to_string() })?;

    for addr in addrs {
        if is_ssrf_ip(addr.ip()) {
            return Err(GatewayError::SsrfBlocked { host: host.to_string() });
        }
    }
    Ok(())
}

/// Exact-or-suffix hostname allowlist check (§4.7 "Hostname must match an allowlist").
pub fn host_allowed(host: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|entry| host == entry || host.ends_with(&format!(".{entry}")))
}

/// Pull the bare hostname out of an `http(s)://host[:port][/path]` URL. Shared by the OpenAPI
/// and MCP factories so both apply the SSRF/allowlist checks to the same notion of "host".
pub fn extract_host(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    Some(rest.split('/').next()?.split(':').next()?.to_string())
}

/// Comma-separated env var into a trimmed, non-empty `Vec<String>` (§4.7 "allowlist" fields).
pub(crate) fn env_list(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Standard base64 encoding for HTTP Basic auth headers.
pub(crate) fn base64_encode(input: &str) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(input.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerEntry {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Per-key (base URL) circuit breaker: `failure_threshold` consecutive failures opens the
/// circuit for `recovery` seconds, after which a single half-open trial is allowed through
/// (§4.7 "5 failures -> open for 60s, half-open on trial").
pub struct CircuitBreaker {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    failure_threshold: u32,
    recovery: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold,
            recovery,
        }
    }

    /// Returns `Err` without letting a call through if the circuit for `key` is open and the
    /// recovery window has not yet elapsed.
    pub fn check(&self, key: &str) -> Result<(), GatewayError> {
        let mut entries = self.entries.lock().expect("circuit breaker mutex poisoned");
        let entry = entries.entry(key.to_string()).or_insert(BreakerEntry {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
        });
        match entry.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let opened_at = entry.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= self.recovery {
                    entry.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen { url: key.to_string() })
                }
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut entries = self.entries.lock().expect("circuit breaker mutex poisoned");
        entries.insert(
            key.to_string(),
            BreakerEntry {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
            },
        );
    }

    pub fn record_failure(&self, key: &str) {
        let mut entries = self.entries.lock().expect("circuit breaker mutex poisoned");
        let entry = entries.entry(key.to_string()).or_insert(BreakerEntry {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
        });
        entry.failures += 1;
        if entry.state == BreakerState::HalfOpen || entry.failures >= self.failure_threshold {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_allowed_matches_exact_and_suffix() {
        let list = vec!["example.com".to_string()];
        assert!(host_allowed("example.com", &list));
        assert!(host_allowed("api.example.com", &list));
        assert!(!host_allowed("evil.com", &list));
        assert!(host_allowed("anything", &[]));
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_recovery() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));
        assert!(breaker.check("u").is_ok());
        breaker.record_failure("u");
        assert!(breaker.check("u").is_ok());
        breaker.record_failure("u");
        assert!(breaker.check("u").is_err());
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.check("u").is_ok());
        breaker.record_success("u");
        assert!(breaker.check("u").is_ok());
    }

    #[test]
    fn extract_host_strips_scheme_port_and_path() {
        assert_eq!(extract_host("https://api.example.com:8443/v1/x"), Some("api.example.com".to_string()));
        assert_eq!(extract_host("not a url"), None);
    }

    #[test]
    fn base64_encode_matches_known_vector() {
        assert_eq!(base64_encode("user:pass"), "dXNlcjpwYXNz");
    }

    #[test]
    fn ssrf_ip_blocks_private_ranges() {
        assert!(is_ssrf_ip("127.0.0.1".parse().unwrap()));
        assert!(is_ssrf_ip("169.254.169.254".parse().unwrap()));
        assert!(is_ssrf_ip("10.0.0.5".parse().unwrap()));
        assert!(!is_ssrf_ip("8.8.8.8".parse().unwrap()));
    }
}
