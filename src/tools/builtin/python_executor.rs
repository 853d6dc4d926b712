//! `python_executor` built-in tool.
//!
//! The downstream invocation is out of scope: the original dispatches to an agent-core service
//! over gRPC that runs user code through a WASI-compiled CPython interpreter. Only the
//! request/response contract is modeled here, behind the [`PythonExecutor`] trait, so the
//! concrete transport can change (gRPC there, a plain HTTP call here) without touching the
//! session-state sandboxing around it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

const MAX_SESSIONS: usize = 100;
const SESSION_TTL: Duration = Duration::from_secs(3600);
const STATE_PREFIX: &str = "__SESSION_STATE__:";
const STATE_SUFFIX: &str = "__END_SESSION__";

/// The downstream call this tool makes on every invocation: run `code` under a WASI CPython
/// interpreter and return whatever it wrote to stdout.
#[async_trait]
pub trait PythonExecutor: Send + Sync {
    async fn run(&self, code: &str) -> Result<String, GatewayError>;
}

/// HTTP transport to an agent-core endpoint, per `AGENT_CORE_ADDR` / `PYTHON_WASI_WASM_PATH`.
pub struct HttpPythonExecutor {
    client: reqwest::Client,
    addr: String,
    wasm_path: String,
}

impl HttpPythonExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            addr: std::env::var("AGENT_CORE_ADDR").unwrap_or_else(|_| "http://127.0.0.1:9090".to_string()),
            wasm_path: std::env::var("PYTHON_WASI_WASM_PATH").unwrap_or_else(|_| "/opt/wasi/python3.wasm".to_string()),
        }
    }
}

impl Default for HttpPythonExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PythonExecutor for HttpPythonExecutor {
    async fn run(&self, code: &str) -> Result<String, GatewayError> {
        let body: Value = self
            .client
            .post(format!("{}/v1/python/execute", self.addr))
            .json(&serde_json::json!({ "wasm_path": self.wasm_path, "stdin": code }))
            .send()
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("agent-core request failed: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("invalid agent-core response: {e}")))?;

        body["stdout"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::ToolExecution("agent-core response missing 'stdout'".to_string()))
    }
}

struct StoredState {
    value: Value,
    expires_at: Instant,
}

/// Extract a sentinel-delimited session-state blob from executed output, if present, returning
/// the remaining output with the sentinel stripped and the parsed state (literals only — this is
/// not a general Python evaluator, just JSON).
fn extract_session_state(output: &str) -> (String, Option<Value>) {
    let Some(start) = output.find(STATE_PREFIX) else {
        return (output.to_string(), None);
    };
    let body_start = start + STATE_PREFIX.len();
    let Some(end_rel) = output[body_start..].find(STATE_SUFFIX) else {
        return (output.to_string(), None);
    };
    let blob = &output[body_start..body_start + end_rel];
    let remainder = format!("{}{}", &output[..start], &output[body_start + end_rel + STATE_SUFFIX.len()..]);
    let parsed = serde_json::from_str::<Value>(blob.trim()).ok();
    (remainder, parsed)
}

pub struct PythonExecutorTool {
    metadata: ToolMetadata,
    executor: Box<dyn PythonExecutor>,
    sessions: Mutex<HashMap<String, StoredState>>,
}

impl PythonExecutorTool {
    pub fn new(settings: &crate::config::Settings) -> Self {
        Self::with_executor(settings, Box::new(HttpPythonExecutor::new()))
    }

    pub fn with_executor(settings: &crate::config::Settings, executor: Box<dyn PythonExecutor>) -> Self {
        Self {
            executor,
            sessions: Mutex::new(HashMap::new()),
            metadata: ToolMetadata {
                name: "python_executor".to_string(),
                description: "Execute Python code in a sandboxed interpreter, with optional persistent session state.".to_string(),
                parameters: vec![
                    ToolParameter::new("code", ParamType::String, "Python source to execute").required(),
                    ToolParameter::new("session_id", ParamType::String, "persist/restore state across calls under this key"),
                ],
                category: "code".to_string(),
                dangerous: true,
                rate_limit: Some(settings.python_executor_rate_limit),
                session_aware: false,
            },
        }
    }

    fn prune_expired(&self, sessions: &mut HashMap<String, StoredState>) {
        let now = Instant::now();
        sessions.retain(|_, s| s.expires_at > now);
    }

    fn evict_oldest_if_full(&self, sessions: &mut HashMap<String, StoredState>) {
        if sessions.len() < MAX_SESSIONS {
            return;
        }
        if let Some(oldest_key) = sessions.iter().min_by_key(|(_, s)| s.expires_at).map(|(k, _)| k.clone()) {
            sessions.remove(&oldest_key);
        }
    }
}

#[async_trait]
impl Tool for PythonExecutorTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        let code = params["code"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'code'".to_string()))?;
        let session_id = params["session_id"].as_str();

        let mut full_code = String::new();
        if let Some(sid) = session_id {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            self.prune_expired(&mut sessions);
            if let Some(stored) = sessions.get(sid) {
                full_code.push_str(&format!("__session_state__ = {}\n", stored.value));
            }
        }
        full_code.push_str(code);

        let raw_output = self.executor.run(&full_code).await?;
        let (output, new_state) = extract_session_state(&raw_output);

        if let (Some(sid), Some(state)) = (session_id, new_state) {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            self.prune_expired(&mut sessions);
            if !sessions.contains_key(sid) {
                self.evict_oldest_if_full(&mut sessions);
            }
            sessions.insert(sid.to_string(), StoredState { value: state, expires_at: Instant::now() + SESSION_TTL });
        }

        Ok(serde_json::json!({ "output": output }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl PythonExecutor for EchoExecutor {
        async fn run(&self, code: &str) -> Result<String, GatewayError> {
            Ok(format!("ran: {code}"))
        }
    }

    struct StatefulExecutor;

    #[async_trait]
    impl PythonExecutor for StatefulExecutor {
        async fn run(&self, _code: &str) -> Result<String, GatewayError> {
            Ok(format!("hello{}{{\"counter\":1}}{}", STATE_PREFIX, STATE_SUFFIX))
        }
    }

    #[test]
    fn extracts_and_strips_sentinel_state() {
        let (remainder, state) = extract_session_state("before__SESSION_STATE__:{\"a\":1}__END_SESSION__after");
        assert_eq!(remainder, "beforeafter");
        assert_eq!(state, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn no_sentinel_leaves_output_untouched() {
        let (remainder, state) = extract_session_state("plain output");
        assert_eq!(remainder, "plain output");
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn executes_code_via_injected_executor() {
        let tool = PythonExecutorTool::with_executor(&crate::config::Settings::default(), Box::new(EchoExecutor));
        let result = tool.call(serde_json::json!({ "code": "print(1)" }), &SessionContext::default()).await.unwrap();
        assert_eq!(result["output"], "ran: print(1)");
    }

    #[tokio::test]
    async fn persists_session_state_across_calls() {
        let tool = PythonExecutorTool::with_executor(&crate::config::Settings::default(), Box::new(StatefulExecutor));
        tool.call(serde_json::json!({ "code": "x = 1", "session_id": "s1" }), &SessionContext::default())
            .await
            .unwrap();
        let sessions = tool.sessions.lock().unwrap();
        assert_eq!(sessions.get("s1").unwrap().value, serde_json::json!({"counter": 1}));
    }
}
