//! Tool HTTP surface: `POST /tools/execute`, `GET /tools/list`,
//! `GET /tools/{name}/schema`, `POST /tools/select`, `POST /tools/mcp/register`.
//!
//! Grounded on `original_source/.../llm_service/api/tools.py` for the wire shapes and on
//! `original_source/.../llm_service/tools/registry.py::select_tools_for_task` for the
//! model-first-with-heuristic-fallback tool selection flow, reusing
//! [`crate::http::ask_model_for_json`] like every other intelligence endpoint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::manager::Manager;
use crate::tools::mcp::{load_mcp_tools_from_config, McpToolDef};
use crate::tools::registry::{TaskType, ToolRegistry};
use crate::tools::{SessionContext, ToolResult};

// -------------------------------------------------------------------------------------------
// POST /tools/execute
// -------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteToolRequest {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `POST /tools/execute` (§4.6, §4.7). A missing tool name is a [`GatewayError::ToolValidation`]
/// (never a 500 or `ToolExecutionError`, since there's no tool instance to dispatch to).
pub async fn execute_tool(registry: &ToolRegistry, request: ExecuteToolRequest) -> Result<ToolResult, GatewayError> {
    if !registry.list().iter().any(|m| m.name == request.tool_name) {
        return Err(GatewayError::ToolValidation(format!("no such tool '{}'", request.tool_name)));
    }
    let params = if request.parameters.is_null() { serde_json::json!({}) } else { request.parameters };
    let ctx = SessionContext { session_id: request.session_id, workspace_dir: None };
    registry.execute(&request.tool_name, params, &ctx).await
}

// -------------------------------------------------------------------------------------------
// GET /tools/list
// -------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ToolListEntry {
    pub name: String,
    pub description: String,
    pub category: String,
    pub dangerous: bool,
    pub session_aware: bool,
}

/// `GET /tools/list`, optionally excluding tools flagged `dangerous` (§4.7 "exclude_dangerous").
pub fn list_tools(registry: &ToolRegistry, exclude_dangerous: bool) -> Vec<ToolListEntry> {
    let mut entries: Vec<ToolListEntry> = registry
        .list()
        .into_iter()
        .filter(|m| !exclude_dangerous || !m.dangerous)
        .map(|m| ToolListEntry {
            name: m.name.clone(),
            description: m.description.clone(),
            category: m.category.clone(),
            dangerous: m.dangerous,
            session_aware: m.session_aware,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

// -------------------------------------------------------------------------------------------
// GET /tools/{name}/schema
// -------------------------------------------------------------------------------------------

/// `GET /tools/{name}/schema` (§4.7 "Schema export"). `None` when no such tool is registered.
pub fn tool_schema(registry: &ToolRegistry, name: &str) -> Option<Value> {
    registry.schema(name)
}

// -------------------------------------------------------------------------------------------
// POST /tools/select
// -------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SelectToolsRequest {
    pub task: String,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_dangerous: bool,
    #[serde(default = "default_max_tools")]
    pub max_tools: usize,
}

fn default_max_tools() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannedToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectToolsResponse {
    pub selected_tools: Vec<String>,
    pub calls: Vec<PlannedToolCall>,
}

/// 5-minute cache keyed by `(task, exclude_dangerous, max_tools)` (§4.7 "Tool selection").
/// A dedicated small TTL map rather than [`crate::cache::Cache`]: that cache's value type is
/// bound to `CompletionResponse`, which this endpoint doesn't produce.
struct SelectionCache {
    entries: Mutex<HashMap<String, (SelectToolsResponse, Instant)>>,
}

impl SelectionCache {
    fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    fn get(&self, key: &str) -> Option<SelectToolsResponse> {
        let mut guard = self.entries.lock().expect("tool selection cache mutex poisoned");
        match guard.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Some(value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: String, value: SelectToolsResponse) {
        let mut guard = self.entries.lock().expect("tool selection cache mutex poisoned");
        guard.insert(key, (value, Instant::now() + Duration::from_secs(300)));
    }
}

lazy_static! {
    static ref SELECTION_CACHE: SelectionCache = SelectionCache::new();
}

const SELECT_SYSTEM_PROMPT: &str = "Given a task and a list of available tools (each with a name, \
description, and top-level parameter names), decide which tools are needed and what to call them \
with. Respond with JSON only: {\"selected_tools\": [string], \"calls\": [{\"tool_name\": string, \
\"parameters\": object}]}. Only use tool names from the provided list.";

/// `POST /tools/select` (§4.7). On any failure — no providers, unparseable response, model error
/// — returns an empty selection rather than fabricating calls, per spec.
pub async fn select_tools(manager: &Manager, registry: &ToolRegistry, request: SelectToolsRequest) -> SelectToolsResponse {
    let max_tools = request.max_tools.max(1);
    let cache_key = format!("{}\u{1}{}\u{1}{}", request.task, request.exclude_dangerous, max_tools);
    if let Some(cached) = SELECTION_CACHE.get(&cache_key) {
        return cached;
    }

    let candidates = list_tools(registry, request.exclude_dangerous);
    let allowed: Vec<ToolListEntry> = match &request.allowed_tools {
        Some(names) => candidates.into_iter().filter(|t| names.contains(&t.name)).collect(),
        None => candidates,
    };
    if allowed.is_empty() {
        return SelectToolsResponse::default();
    }

    let summaries: Vec<Value> = allowed
        .iter()
        .filter_map(|t| {
            registry.schema(&t.name).map(|schema| {
                let params = schema["parameters"]["properties"]
                    .as_object()
                    .map(|props| props.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default();
                serde_json::json!({ "name": t.name, "description": t.description, "parameters": params })
            })
        })
        .collect();
    let prompt = format!(
        "Task: {}\n\nAvailable tools:\n{}",
        request.task,
        serde_json::to_string_pretty(&summaries).unwrap_or_default()
    );

    let result = match crate::http::ask_model_for_json(manager, SELECT_SYSTEM_PROMPT, &prompt).await {
        Some((value, _provider)) => parse_selection(&value, &allowed, max_tools).unwrap_or_default(),
        None => SelectToolsResponse::default(),
    };

    SELECTION_CACHE.set(cache_key, result.clone());
    result
}

/// Clamp the model's selection to the allowed list and to `max_tools` (§4.7 "clamp selections").
fn parse_selection(value: &Value, allowed: &[ToolListEntry], max_tools: usize) -> Option<SelectToolsResponse> {
    let allowed_names: std::collections::HashSet<&str> = allowed.iter().map(|t| t.name.as_str()).collect();

    let selected_tools: Vec<String> = value
        .get("selected_tools")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|name| allowed_names.contains(name))
        .take(max_tools)
        .map(str::to_string)
        .collect();

    let calls: Vec<PlannedToolCall> = value
        .get("calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|c| {
                    let tool_name = c.get("tool_name")?.as_str()?.to_string();
                    if !allowed_names.contains(tool_name.as_str()) {
                        return None;
                    }
                    Some(PlannedToolCall { tool_name, parameters: c.get("parameters").cloned().unwrap_or(serde_json::json!({})) })
                })
                .take(max_tools)
                .collect()
        })
        .unwrap_or_default();

    Some(SelectToolsResponse { selected_tools, calls })
}

// -------------------------------------------------------------------------------------------
// POST /tools/mcp/register
// -------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct McpRegisterRequest {
    pub tools: Vec<McpToolDef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct McpRegisterResponse {
    pub registered: Vec<String>,
    pub errors: Vec<String>,
}

/// `POST /tools/mcp/register` (§4.7 "MCP tool factory"). Best-effort per-entry, mirroring
/// [`load_mcp_tools_from_config`]: one bad definition doesn't prevent the rest from registering.
pub fn register_mcp_tools(registry: &mut ToolRegistry, request: McpRegisterRequest) -> McpRegisterResponse {
    let names: Vec<String> = request.tools.iter().map(|d| d.name.clone()).collect();
    let errors = load_mcp_tools_from_config(registry, &request.tools);
    let registered = names.into_iter().filter(|n| registry.get(n).is_some()).collect();
    McpRegisterResponse {
        registered,
        errors: errors.into_iter().map(|e| e.to_string()).collect(),
    }
}

/// Parses a task-type hint string into the coarse [`TaskType`] bucket `filter_by_task_type`
/// routes on; exposed for handlers that want to pre-trim the catalog before `/tools/select`
/// rather than pass the whole registry (§4.7 supplement).
pub fn task_type_from_hint(hint: &str) -> TaskType {
    TaskType::from_str(hint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ParamType, Tool, ToolMetadata, ToolParameter};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubTool(ToolMetadata);

    #[async_trait]
    impl Tool for StubTool {
        fn metadata(&self) -> &ToolMetadata {
            &self.0
        }
        async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
            Ok(params)
        }
    }

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                Arc::new(StubTool(ToolMetadata {
                    name: "echo".to_string(),
                    description: "echoes input".to_string(),
                    parameters: vec![ToolParameter::new("text", ParamType::String, "text")],
                    category: "general".to_string(),
                    dangerous: false,
                    rate_limit: None,
                    session_aware: false,
                })),
                false,
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn execute_rejects_unknown_tool_name_before_dispatch() {
        let registry = registry_with_echo();
        let request = ExecuteToolRequest { tool_name: "bogus".to_string(), parameters: Value::Null, session_id: None };
        let err = execute_tool(&registry, request).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn execute_runs_known_tool() {
        let registry = registry_with_echo();
        let request = ExecuteToolRequest {
            tool_name: "echo".to_string(),
            parameters: serde_json::json!({ "text": "hi" }),
            session_id: None,
        };
        let result = execute_tool(&registry, request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["text"], "hi");
    }

    #[test]
    fn list_tools_excludes_dangerous_when_requested() {
        let mut registry = registry_with_echo();
        registry
            .register(
                Arc::new(StubTool(ToolMetadata {
                    name: "bash".to_string(),
                    description: "runs shell commands".to_string(),
                    parameters: vec![],
                    category: "shell".to_string(),
                    dangerous: true,
                    rate_limit: None,
                    session_aware: false,
                })),
                false,
            )
            .unwrap();
        assert_eq!(list_tools(&registry, false).len(), 2);
        assert_eq!(list_tools(&registry, true).len(), 1);
    }

    #[test]
    fn schema_none_for_unknown_tool() {
        let registry = registry_with_echo();
        assert!(tool_schema(&registry, "bogus").is_none());
    }

    #[tokio::test]
    async fn select_tools_returns_empty_selection_with_no_providers_configured() {
        let manager = Manager::new(crate::config::Settings::default());
        let registry = registry_with_echo();
        let request = SelectToolsRequest {
            task: format!("unique task {}", "select-empty-case"),
            allowed_tools: None,
            exclude_dangerous: false,
            max_tools: 5,
        };
        let response = select_tools(&manager, &registry, request).await;
        assert!(response.selected_tools.is_empty());
        assert!(response.calls.is_empty());
    }

    #[test]
    fn mcp_register_reports_success_and_failure_entries_independently() {
        let mut registry = ToolRegistry::new();
        let request = McpRegisterRequest {
            tools: vec![
                McpToolDef {
                    name: "ok_tool".to_string(),
                    func_name: "do_thing".to_string(),
                    url: "http://localhost:9000/rpc".to_string(),
                    headers: HashMap::new(),
                    description: "ok".to_string(),
                    category: "mcp".to_string(),
                    parameters: vec![],
                },
                McpToolDef {
                    name: "blocked_tool".to_string(),
                    func_name: "do_thing".to_string(),
                    url: "https://not-allowed.example.net/rpc".to_string(),
                    headers: HashMap::new(),
                    description: "blocked".to_string(),
                    category: "mcp".to_string(),
                    parameters: vec![],
                },
            ],
        };
        let response = register_mcp_tools(&mut registry, request);
        assert_eq!(response.registered, vec!["ok_tool".to_string()]);
        assert_eq!(response.errors.len(), 1);
    }
}
