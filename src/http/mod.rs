//! Framework-neutral HTTP surface.
//!
//! The wire framework and route wiring are explicitly out of scope (§1): every submodule here
//! exposes plain request/response structs and async functions over [`crate::manager::Manager`] /
//! [`crate::tools::registry::ToolRegistry`], grounded one-for-one on the original's FastAPI routers
//! under `original_source/.../llm_service/api/`. An optional `http-server` feature wires these
//! onto real `axum` routes in [`server`], but the handlers themselves never depend on it.

pub mod completions;
pub mod intelligence;
pub mod providers;
pub mod tools;

#[cfg(feature = "http-server")]
pub mod server;

/// The `X-Parent-Workflow-ID` / `X-Workflow-ID` / `X-Agent-ID` headers every handler that emits
/// lifecycle events consults when the request body itself is silent on them (§4.6). Framework
/// adapters populate this from whatever header map their transport hands them; the field names
/// match the original's case-insensitive header lookups.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub parent_workflow_id: Option<String>,
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
}

impl RequestHeaders {
    /// `X-Parent-Workflow-ID` takes precedence over `X-Workflow-ID` when both are present,
    /// matching the original's `parent_workflow_id or workflow_id` fallback.
    pub fn effective_workflow_id(&self) -> Option<&str> {
        self.parent_workflow_id.as_deref().or(self.workflow_id.as_deref())
    }
}

/// Three-level JSON extraction used by every model-first-with-heuristic-fallback endpoint
/// (§4.6): a direct parse, then a fenced ` ```json ... ``` ` block, then the first balanced
/// `{...}` span. Returns `None` rather than erroring so callers degrade to their heuristic.
pub(crate) fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        return Some(v);
    }

    let fenced = regex::Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok()?;
    if let Some(caps) = fenced.captures(text) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&caps[1]) {
            return Some(v);
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&text[start..=end]).ok()
}

/// Ask a small-tier model for JSON-only output, extract it with [`extract_json_object`], and
/// return `None` on any provider error or unparseable response so the caller can fall back to
/// its heuristic (§4.6 "model-first-heuristic-fallback shape").
pub(crate) async fn ask_model_for_json(
    manager: &crate::manager::Manager,
    system_prompt: &str,
    user_prompt: &str,
) -> Option<(serde_json::Value, String)> {
    use crate::provider::{ChatMessage, CompletionRequest, MessageContent, MessageRole, ModelTier};

    let request = CompletionRequest {
        messages: vec![
            ChatMessage { role: MessageRole::System, content: MessageContent::Text(system_prompt.to_string()) },
            ChatMessage { role: MessageRole::User, content: MessageContent::Text(user_prompt.to_string()) },
        ],
        model_tier: ModelTier::Small,
        temperature: Some(0.1),
        ..Default::default()
    };

    let response = manager.complete(request).await.ok()?;
    if response.provider == "mock" {
        return None;
    }
    let value = extract_json_object(&response.content)?;
    Some((value, response.provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_direct_fenced_and_bare_json() {
        assert_eq!(extract_json_object(r#"{"a":1}"#).unwrap()["a"], 1);
        assert_eq!(extract_json_object("here:\n```json\n{\"a\": 2}\n```\nthanks").unwrap()["a"], 2);
        assert_eq!(extract_json_object("sure, the answer is {\"a\": 3} hope that helps").unwrap()["a"], 3);
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn effective_workflow_id_prefers_parent() {
        let headers = RequestHeaders {
            parent_workflow_id: Some("parent".to_string()),
            workflow_id: Some("child".to_string()),
            agent_id: None,
        };
        assert_eq!(headers.effective_workflow_id(), Some("parent"));
        let headers2 = RequestHeaders { workflow_id: Some("child".to_string()), ..Default::default() };
        assert_eq!(headers2.effective_workflow_id(), Some("child"));
    }
}
