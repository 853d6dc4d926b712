//! MCP stateless tool factory.
//!
//! Grounded on `original_source/.../llm_service/tools/mcp.py::create_mcp_tool_class` for the
//! per-tool-name sliding-window rate limit, the single-`args`-object fallback parameter mode,
//! and the per-function `MCP_COST_<NAME>` cost override, and on
//! `original_source/.../llm_service/mcp_client.py::HttpStatelessClient` for the transport: a
//! `{function, args}` POST convention behind a host allowlist, a per-URL circuit breaker, and
//! capped exponential-backoff retries. The breaker and SSRF guard are reused from
//! [`crate::tools::net`] rather than reimplemented.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::Value;

use crate::clients::support::shared_http_client;
use crate::error::GatewayError;
use crate::tools::net::{check_ssrf_blocked, env_list, env_num, extract_host, host_allowed, CircuitBreaker};
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

lazy_static! {
    /// One breaker shared by every MCP client in the process, keyed by target URL, mirroring the
    /// originals' module-level `_breakers` dict.
    static ref MCP_BREAKER: CircuitBreaker = CircuitBreaker::new(
        env_num("MCP_CB_FAILURES", 5),
        Duration::from_secs_f64(env_num("MCP_CB_RECOVERY_SECONDS", 60.0)),
    );
}

fn allowed_domains() -> Vec<String> {
    env_list("MCP_ALLOWED_DOMAINS", "localhost,127.0.0.1")
}

fn max_response_bytes() -> usize {
    env_num("MCP_MAX_RESPONSE_BYTES", 10 * 1024 * 1024)
}

fn retries() -> u32 {
    env_num::<u32>("MCP_RETRIES", 3).max(1)
}

fn timeout_seconds() -> f64 {
    env_num("MCP_TIMEOUT_SECONDS", 10.0)
}

/// Config-declared shape of one remote function to expose as a tool (§4.7 "MCP registration").
#[derive(Debug, Clone, Deserialize)]
pub struct McpParamDef {
    pub name: String,
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

fn default_param_type() -> String {
    "object".to_string()
}

fn parse_param_type(s: &str) -> ParamType {
    match s.to_ascii_lowercase().as_str() {
        "string" => ParamType::String,
        "integer" => ParamType::Integer,
        "float" | "number" => ParamType::Number,
        "boolean" => ParamType::Boolean,
        "array" => ParamType::Array,
        _ => ParamType::Object,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    pub func_name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub parameters: Vec<McpParamDef>,
}

fn default_description() -> String {
    "MCP remote function".to_string()
}

fn default_category() -> String {
    "mcp".to_string()
}

/// Minimal stateless HTTP client for one MCP endpoint: host allowlist at construction, shared
/// circuit breaker, capped backoff retries, `{function, args}` POST convention.
struct McpClient {
    name: String,
    url: String,
    headers: HashMap<String, String>,
}

impl McpClient {
    fn new(name: String, url: String, headers: HashMap<String, String>) -> Result<Self, GatewayError> {
        let host = extract_host(&url).ok_or_else(|| GatewayError::Config(format!("MCP tool '{name}': could not parse host from url '{url}'")))?;
        if !host_allowed(&host, &allowed_domains()) {
            return Err(GatewayError::DomainBlocked { host });
        }
        Ok(Self { name, url, headers })
    }

    async fn invoke(&self, func_name: &str, args: Value) -> Result<Value, GatewayError> {
        let host = extract_host(&self.url).ok_or_else(|| GatewayError::Config(format!("MCP tool '{}': could not parse host from url", self.name)))?;
        check_ssrf_blocked(&host).await?;

        let payload = serde_json::json!({ "function": func_name, "args": args });
        let attempts = retries();
        let timeout = Duration::from_secs_f64(timeout_seconds());
        let max_bytes = max_response_bytes();

        let mut last_err = None;
        for attempt in 1..=attempts {
            MCP_BREAKER.check(&self.url)?;

            let mut request = shared_http_client().post(&self.url).json(&payload).timeout(timeout);
            for (k, v) in &self.headers {
                request = request.header(k.as_str(), v.as_str());
            }

            let result = async {
                let response = request.send().await.map_err(|e| GatewayError::ToolExecution(format!("MCP request failed: {e}")))?;
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    return Err(GatewayError::Provider { provider: self.name.clone(), status: Some(status), message: "MCP endpoint returned an error status".to_string() });
                }
                if let Some(len) = response.content_length() {
                    if len as usize > max_bytes {
                        return Err(GatewayError::ToolExecution("MCP response exceeds maximum size".to_string()));
                    }
                }
                let bytes = response.bytes().await.map_err(|e| GatewayError::ToolExecution(format!("failed to read MCP response: {e}")))?;
                if bytes.len() > max_bytes {
                    return Err(GatewayError::ToolExecution("MCP response exceeds maximum size".to_string()));
                }
                serde_json::from_slice::<Value>(&bytes).map_err(|e| GatewayError::Parse { provider: self.name.clone(), message: format!("invalid JSON from MCP endpoint: {e}") })
            }
            .await;

            match result {
                Ok(value) => {
                    MCP_BREAKER.record_success(&self.url);
                    return Ok(value);
                }
                Err(err) => {
                    MCP_BREAKER.record_failure(&self.url);
                    last_err = Some(err);
                    if attempt < attempts {
                        let delay = (2f64.powi(attempt as i32 - 1) * 0.5).min(5.0);
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::ToolExecution("MCP call failed with no recorded error".to_string())))
    }
}

/// Per-tool-name sliding-window rate limiter: at most `limit` calls per rolling 60s window
/// (§4.7 "MCP rate limiting", `MCP_RATE_LIMIT_DEFAULT`).
struct SlidingWindow {
    calls: Mutex<VecDeque<Instant>>,
    limit: usize,
}

impl SlidingWindow {
    fn new(limit: usize) -> Self {
        Self { calls: Mutex::new(VecDeque::new()), limit: limit.max(1) }
    }

    fn allow(&self) -> bool {
        let window = Duration::from_secs(60);
        let now = Instant::now();
        let mut calls = self.calls.lock().expect("mcp rate limiter mutex poisoned");
        while let Some(front) = calls.front() {
            if now.duration_since(*front) > window {
                calls.pop_front();
            } else {
                break;
            }
        }
        if calls.len() >= self.limit {
            return false;
        }
        calls.push_back(now);
        true
    }
}

/// A tool backed by one MCP remote function (§4.7 "MCP stateless client and tool factory").
pub struct McpTool {
    metadata: ToolMetadata,
    client: McpClient,
    func_name: String,
    has_declared_schema: bool,
    window: SlidingWindow,
}

impl McpTool {
    pub fn new(def: &McpToolDef) -> Result<Self, GatewayError> {
        let client = McpClient::new(def.name.clone(), def.url.clone(), def.headers.clone())?;
        let has_declared_schema = !def.parameters.is_empty();
        let parameters = if has_declared_schema {
            def.parameters
                .iter()
                .map(|p| {
                    let mut param = ToolParameter::new(p.name.clone(), parse_param_type(&p.param_type), p.description.clone());
                    param.required = p.required;
                    param.default = p.default.clone();
                    param
                })
                .collect()
        } else {
            vec![ToolParameter::new("args", ParamType::Object, "arguments object passed to the MCP function")]
        };

        let limit = env_num::<usize>("MCP_RATE_LIMIT_DEFAULT", 60);
        Ok(Self {
            metadata: ToolMetadata {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters,
                category: def.category.clone(),
                dangerous: false,
                rate_limit: None,
                session_aware: false,
            },
            client,
            func_name: def.func_name.clone(),
            has_declared_schema,
            window: SlidingWindow::new(limit),
        })
    }

    /// `MCP_COST_<NAME>` override, uppercased tool name, defaulting to 0.001 (§4.7 "per-function
    /// cost override"). Exposed for callers that surface cost in tool metadata responses.
    pub fn cost_per_use(&self) -> f64 {
        let key = format!("MCP_COST_{}", self.metadata.name.to_ascii_uppercase());
        env_num(&key, 0.001)
    }
}

#[async_trait]
impl Tool for McpTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        if !self.window.allow() {
            return Err(GatewayError::ToolValidation(format!("rate limit exceeded for '{}'", self.metadata.name)));
        }

        let call_args = if self.has_declared_schema {
            params
        } else {
            match params.get("args") {
                Some(v) if v.is_object() => v.clone(),
                Some(_) => return Err(GatewayError::ToolValidation("'args' must be an object".to_string())),
                None => Value::Object(Default::default()),
            }
        };

        self.client.invoke(&self.func_name, call_args).await
    }
}

/// Build and register every MCP tool declared in config, continuing past a single bad entry
/// rather than aborting startup (§4.7 "best-effort MCP registration"). Returns the errors for
/// any definitions that failed, so the caller can log them.
pub fn load_mcp_tools_from_config(registry: &mut crate::tools::registry::ToolRegistry, defs: &[McpToolDef]) -> Vec<GatewayError> {
    let mut errors = Vec::new();
    for def in defs {
        match McpTool::new(def) {
            Ok(tool) => {
                if let Err(e) = registry.register(std::sync::Arc::new(tool), true) {
                    errors.push(e);
                }
            }
            Err(e) => errors.push(e),
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, url: &str) -> McpToolDef {
        McpToolDef {
            name: name.to_string(),
            func_name: "do_thing".to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            description: "test".to_string(),
            category: "mcp".to_string(),
            parameters: vec![],
        }
    }

    #[test]
    fn rejects_disallowed_host_at_construction() {
        let err = McpTool::new(&def("x", "https://evil.example.net/rpc")).unwrap_err();
        assert!(matches!(err, GatewayError::DomainBlocked { .. }));
    }

    #[test]
    fn accepts_allowlisted_localhost_and_falls_back_to_args_parameter() {
        let tool = McpTool::new(&def("calc_remote", "http://localhost:9000/rpc")).unwrap();
        assert_eq!(tool.metadata().parameters.len(), 1);
        assert_eq!(tool.metadata().parameters[0].name, "args");
    }

    #[test]
    fn declared_schema_replaces_args_fallback() {
        let mut d = def("weather", "http://127.0.0.1:9000/rpc");
        d.parameters.push(McpParamDef {
            name: "city".to_string(),
            param_type: "string".to_string(),
            description: "city name".to_string(),
            required: true,
            default: None,
        });
        let tool = McpTool::new(&d).unwrap();
        assert_eq!(tool.metadata().parameters.len(), 1);
        assert_eq!(tool.metadata().parameters[0].name, "city");
    }

    #[test]
    fn sliding_window_blocks_after_limit() {
        let window = SlidingWindow::new(2);
        assert!(window.allow());
        assert!(window.allow());
        assert!(!window.allow());
    }
}
