//! Optional `axum` wiring for the handlers in [`crate::http`], gated behind
//! the `http-server` feature.
//!
//! §1 scopes "the HTTP server framework and route wiring" out of the specification — only the
//! operations and payloads matter. This module exists anyway since the manifest already carries
//! `axum`/`tower` as optional dependencies; reusing that optional-feature shape for this crate's
//! REST surface keeps one idiom instead of two. Every route is a thin `extract::State` + `Json`
//! wrapper around the framework-neutral functions in the sibling modules — no business logic
//! lives here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::http::completions::handle_completions;
use crate::http::intelligence::{analyze_complexity, analyze_task, compress_context, evaluate_agents, ComplexityRequest, CompressRequest, EvaluationRequest, TaskAnalysisRequest};
use crate::http::providers::list_models;
use crate::http::tools::{execute_tool, list_tools, register_mcp_tools, select_tools, tool_schema, ExecuteToolRequest, McpRegisterRequest, SelectToolsRequest};
use crate::http::RequestHeaders;
use crate::manager::Manager;
use crate::provider::CompletionRequest;
use crate::tools::registry::ToolRegistry;

/// Shared state every route closure borrows. The tool registry is behind a [`tokio::sync::Mutex`]
/// because `/tools/mcp/register` needs `&mut ToolRegistry`; every other tool route only reads it.
pub struct AppState {
    pub manager: Manager,
    pub tools: Mutex<ToolRegistry>,
}

/// Build the full route table. Callers own binding a listener and calling `axum::serve`; this
/// function only describes paths and handlers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/completions", post(completions_handler))
        .route("/analyze", post(analyze_handler))
        .route("/analyze_task", post(analyze_task_handler))
        .route("/context/compress", post(compress_handler))
        .route("/agent/evaluate", post(evaluate_handler))
        .route("/providers/models", get(providers_models_handler))
        .route("/tools/execute", post(tools_execute_handler))
        .route("/tools/list", get(tools_list_handler))
        .route("/tools/{name}/schema", get(tools_schema_handler))
        .route("/tools/select", post(tools_select_handler))
        .route("/tools/mcp/register", post(tools_mcp_register_handler))
        .with_state(state)
}

fn request_headers(headers: &HeaderMap) -> RequestHeaders {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    RequestHeaders {
        parent_workflow_id: get("x-parent-workflow-id"),
        workflow_id: get("x-workflow-id"),
        agent_id: get("x-agent-id"),
    }
}

/// Every handler funnels its [`GatewayError`] through this, matching §7's propagation policy:
/// the caller learns the error kind but never a vendor's raw body.
fn error_response(err: GatewayError) -> axum::response::Response {
    let status = match &err {
        GatewayError::ToolValidation(_) => StatusCode::BAD_REQUEST,
        GatewayError::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::ContextOverflow { .. } => StatusCode::BAD_REQUEST,
        GatewayError::SsrfBlocked { .. } | GatewayError::DomainBlocked { .. } => StatusCode::FORBIDDEN,
        GatewayError::ProviderAuth { .. } => StatusCode::UNAUTHORIZED,
        GatewayError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

async fn completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> axum::response::Response {
    match handle_completions(&state.manager, request, &request_headers(&headers)).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

async fn analyze_handler(State(state): State<Arc<AppState>>, Json(request): Json<ComplexityRequest>) -> axum::response::Response {
    Json(analyze_complexity(&state.manager, request).await).into_response()
}

async fn analyze_task_handler(State(state): State<Arc<AppState>>, Json(request): Json<TaskAnalysisRequest>) -> axum::response::Response {
    Json(analyze_task(&state.manager, request).await).into_response()
}

async fn compress_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CompressRequest>,
) -> axum::response::Response {
    match compress_context(&state.manager, request, &request_headers(&headers)).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

async fn evaluate_handler(State(state): State<Arc<AppState>>, Json(request): Json<EvaluationRequest>) -> axum::response::Response {
    Json(evaluate_agents(&state.manager, request).await).into_response()
}

#[derive(serde::Deserialize)]
struct TierQuery {
    tier: Option<String>,
}

async fn providers_models_handler(State(state): State<Arc<AppState>>, Query(query): Query<TierQuery>) -> axum::response::Response {
    Json(list_models(&state.manager, query.tier.as_deref())).into_response()
}

async fn tools_execute_handler(State(state): State<Arc<AppState>>, Json(request): Json<ExecuteToolRequest>) -> axum::response::Response {
    let registry = state.tools.lock().await;
    match execute_tool(&registry, request).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(serde::Deserialize)]
struct ExcludeDangerousQuery {
    #[serde(default)]
    exclude_dangerous: bool,
}

async fn tools_list_handler(State(state): State<Arc<AppState>>, Query(query): Query<ExcludeDangerousQuery>) -> axum::response::Response {
    let registry = state.tools.lock().await;
    Json(list_tools(&registry, query.exclude_dangerous)).into_response()
}

async fn tools_schema_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> axum::response::Response {
    let registry = state.tools.lock().await;
    match tool_schema(&registry, &name) {
        Some(schema) => Json(schema).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": format!("no such tool '{name}'") }))).into_response(),
    }
}

async fn tools_select_handler(State(state): State<Arc<AppState>>, Json(request): Json<SelectToolsRequest>) -> axum::response::Response {
    let registry = state.tools.lock().await;
    Json(select_tools(&state.manager, &registry, request).await).into_response()
}

async fn tools_mcp_register_handler(State(state): State<Arc<AppState>>, Json(request): Json<McpRegisterRequest>) -> axum::response::Response {
    let mut registry = state.tools.lock().await;
    Json(register_mcp_tools(&mut registry, request)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            manager: Manager::new(Settings::default()),
            tools: Mutex::new(ToolRegistry::new()),
        })
    }

    #[test]
    fn router_builds_without_panicking() {
        let _ = router(test_state());
    }
}
