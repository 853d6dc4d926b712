//! Error taxonomy for the gateway.
//!
//! Every fallible operation in this crate returns one of the ten kinds below rather than a
//! generic `Box<dyn Error>`. Each variant knows whether it is safe to retry so that the single
//! retry combinator in [`crate::clients::retry`] can stay generic over providers.

use std::fmt;

/// The ten error kinds callers distinguish on, plus the data each needs to be actionable.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Missing or malformed configuration. Fatal on startup, `503` on a failed reload.
    Config(String),
    /// A vendor rejected our credentials. Never retried, never cached.
    ProviderAuth { provider: String, message: String },
    /// The vendor returned a rate-limit response. Retried with backoff, then falls over to the
    /// next preferred provider.
    ProviderRateLimit { provider: String, message: String },
    /// Prompt plus requested output would not fit in the model's context window.
    ContextOverflow {
        prompt_tokens: usize,
        context_window: usize,
        margin: usize,
    },
    /// A session or task has exhausted its token budget. Raised before any network call.
    BudgetExceeded {
        scope: String,
        used: usize,
        limit: usize,
    },
    /// The vendor returned content this crate could not parse into a `CompletionResponse`.
    Parse { provider: String, message: String },
    /// A tool call's parameters failed coercion, type, enum, range, pattern, or
    /// unknown-parameter validation. Never retried; caller-visible as a `400`.
    ToolValidation(String),
    /// A tool ran but failed; surfaced as `ToolResult { success: false, .. }`, never thrown.
    ToolExecution(String),
    /// An OpenAPI/MCP call was refused before any network contact because the target host
    /// resolved to a private, loopback, link-local, or metadata address.
    SsrfBlocked { host: String },
    /// A configured domain allowlist rejected the target host.
    DomainBlocked { host: String },
    /// The per-URL circuit breaker for an OpenAPI/MCP backend is open.
    CircuitOpen { url: String },
    /// Any other vendor-side failure: vendor name, status code if known, sanitised message.
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },
}

impl GatewayError {
    /// Whether the failing operation is safe to retry with backoff.
    ///
    /// `ProviderAuth`, `ToolValidation`, `SsrfBlocked`, and `DomainBlocked` are never retryable:
    /// retrying a rejected credential or a blocked host can't change the outcome.
    pub fn retryable(&self) -> bool {
        match self {
            GatewayError::ProviderRateLimit { .. } => true,
            GatewayError::CircuitOpen { .. } => true,
            GatewayError::Provider { status, .. } => {
                matches!(status, Some(code) if *code >= 500 || *code == 429)
            }
            GatewayError::Config(_)
            | GatewayError::ProviderAuth { .. }
            | GatewayError::ContextOverflow { .. }
            | GatewayError::BudgetExceeded { .. }
            | GatewayError::Parse { .. }
            | GatewayError::ToolValidation(_)
            | GatewayError::ToolExecution(_)
            | GatewayError::SsrfBlocked { .. }
            | GatewayError::DomainBlocked { .. } => false,
        }
    }

    /// Construct a [`GatewayError::Provider`] with its message passed through
    /// [`sanitize_message`](crate::error::sanitize_message) first.
    pub fn provider(provider: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        GatewayError::Provider {
            provider: provider.into(),
            status,
            message: sanitize_message(&message.into()),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Config(msg) => write!(f, "configuration error: {msg}"),
            GatewayError::ProviderAuth { provider, message } => {
                write!(f, "provider '{provider}' rejected credentials: {message}")
            }
            GatewayError::ProviderRateLimit { provider, message } => {
                write!(f, "provider '{provider}' rate limited: {message}")
            }
            GatewayError::ContextOverflow {
                prompt_tokens,
                context_window,
                margin,
            } => write!(
                f,
                "insufficient context window: prompt_tokens={prompt_tokens} context_window={context_window} margin={margin}"
            ),
            GatewayError::BudgetExceeded { scope, used, limit } => {
                write!(f, "{scope} token budget exceeded: {used}/{limit} tokens used")
            }
            GatewayError::Parse { provider, message } => {
                write!(f, "could not parse response from '{provider}': {message}")
            }
            GatewayError::ToolValidation(msg) => write!(f, "tool validation error: {msg}"),
            GatewayError::ToolExecution(msg) => write!(f, "tool execution error: {msg}"),
            GatewayError::SsrfBlocked { host } => {
                write!(f, "refused to contact '{host}': resolves to a private/loopback/metadata address")
            }
            GatewayError::DomainBlocked { host } => {
                write!(f, "refused to contact '{host}': not in the configured allowlist")
            }
            GatewayError::CircuitOpen { url } => write!(f, "circuit open for '{url}'"),
            GatewayError::Provider {
                provider,
                status,
                message,
            } => match status {
                Some(code) => write!(f, "provider '{provider}' error (HTTP {code}): {message}"),
                None => write!(f, "provider '{provider}' error: {message}"),
            },
        }
    }
}

impl std::error::Error for GatewayError {}

/// Redact secrets from a vendor error body before it can reach a caller.
///
/// Strips bearer-style API keys, long alphanumeric tokens (32+ chars, the shape of most vendor
/// secrets), and truncates embedded URLs down to `scheme://host` so query strings carrying
/// signed tokens never leak into logs or HTTP responses.
pub fn sanitize_message(raw: &str) -> String {
    let url_truncated = truncate_urls(raw);
    redact_long_tokens(&url_truncated)
}

fn truncate_urls(input: &str) -> String {
    // Matches scheme://host[/path?query] and keeps only scheme://host.
    let re = regex::Regex::new(r"(https?://[A-Za-z0-9.\-]+)(/[^\s]*)?").unwrap();
    re.replace_all(input, "$1").into_owned()
}

fn redact_long_tokens(input: &str) -> String {
    let re = regex::Regex::new(r"\b[A-Za-z0-9_\-]{32,}\b").unwrap();
    re.replace_all(input, "[REDACTED]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_matches_taxonomy() {
        assert!(!GatewayError::ProviderAuth {
            provider: "openai".into(),
            message: "bad key".into()
        }
        .retryable());
        assert!(GatewayError::ProviderRateLimit {
            provider: "openai".into(),
            message: "slow down".into()
        }
        .retryable());
        assert!(!GatewayError::ToolValidation("missing param".into()).retryable());
        assert!(GatewayError::CircuitOpen { url: "https://x".into() }.retryable());
    }

    #[test]
    fn sanitize_strips_tokens_and_query_strings() {
        let raw = "request to https://api.openai.com/v1/chat?key=abc failed: sk-ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 invalid";
        let clean = sanitize_message(raw);
        assert!(!clean.contains("key=abc"));
        assert!(!clean.contains("ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789"));
        assert!(clean.contains("https://api.openai.com"));
    }
}
