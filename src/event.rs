//! Outbound lifecycle event emitter to the orchestrator.
//!
//! The Manager fires `LLM_PROMPT`/`LLM_PARTIAL`/`LLM_OUTPUT` events for every completion that
//! carries a `workflow_id`. Emission is a POST to `events_ingest_url`; failures are logged and
//! dropped rather than surfaced, since a lost lifecycle event must never fail the completion it
//! describes (§4.8: "Emission failures must never propagate into the completion result").

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::Settings;

/// One of the three lifecycle event kinds the gateway emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    LlmPrompt,
    LlmPartial,
    LlmOutput,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::LlmPrompt => "LLM_PROMPT",
            EventType::LlmPartial => "LLM_PARTIAL",
            EventType::LlmOutput => "LLM_OUTPUT",
        }
    }
}

#[derive(Debug, Serialize)]
struct EventEnvelope<'a> {
    workflow_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<&'a str>,
    message: String,
    payload: Value,
}

/// Emits `LLM_PROMPT`/`LLM_PARTIAL`/`LLM_OUTPUT` events over HTTP to `events_ingest_url`.
///
/// Constructed once at startup and shared (`Arc`) across the Manager and its clones, following
/// the same lazy-shared-client idiom `clients::support::shared_http_client` uses.
pub struct EventEmitter {
    client: reqwest::Client,
    ingest_url: String,
    auth_token: Option<String>,
    enable_events: bool,
    enable_partials: bool,
    partial_chunk_chars: usize,
}

impl EventEmitter {
    pub fn new(settings: &Settings) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            ingest_url: settings.events_ingest_url.clone(),
            auth_token: settings.events_auth_token.clone(),
            enable_events: settings.enable_llm_events,
            enable_partials: settings.enable_llm_partials,
            partial_chunk_chars: settings.partial_chunk_chars,
        })
    }

    /// Emit `LLM_PROMPT` for the sanitized last user message of a request, truncated to 500
    /// chars. No-op if `workflow_id` is absent or events are disabled.
    pub async fn emit_prompt(&self, workflow_id: Option<&str>, agent_id: Option<&str>, last_user_message: &str) {
        let Some(workflow_id) = workflow_id else { return };
        if !self.enable_events {
            return;
        }
        let sanitized = sanitize_prompt(last_user_message);
        let message = truncate_chars(&sanitized, 500);
        self.send(
            workflow_id,
            EventType::LlmPrompt,
            agent_id,
            message.clone(),
            serde_json::json!({}),
        )
        .await;
    }

    /// Emit `LLM_PARTIAL` chunks of `full_text`, each ≤ `partial_chunk_chars`. No-op unless both
    /// events and partials are enabled.
    pub async fn emit_partials(&self, workflow_id: Option<&str>, agent_id: Option<&str>, full_text: &str) {
        let Some(workflow_id) = workflow_id else { return };
        if !self.enable_events || !self.enable_partials || full_text.is_empty() {
            return;
        }
        let chars: Vec<char> = full_text.chars().collect();
        let chunk_size = self.partial_chunk_chars.max(1);
        let total_chunks = chars.len().div_ceil(chunk_size);
        for (chunk_index, chunk) in chars.chunks(chunk_size).enumerate() {
            let text: String = chunk.iter().collect();
            self.send(
                workflow_id,
                EventType::LlmPartial,
                agent_id,
                text,
                serde_json::json!({ "chunk_index": chunk_index, "total_chunks": total_chunks }),
            )
            .await;
        }
    }

    /// Emit `LLM_OUTPUT` with the full (≤4000 char) output text plus provider/model/usage.
    pub async fn emit_output(
        &self,
        workflow_id: Option<&str>,
        agent_id: Option<&str>,
        full_text: &str,
        provider: &str,
        model: &str,
        usage: Value,
    ) {
        let Some(workflow_id) = workflow_id else { return };
        if !self.enable_events {
            return;
        }
        let message = truncate_chars(full_text, 4000);
        self.send(
            workflow_id,
            EventType::LlmOutput,
            agent_id,
            message,
            serde_json::json!({ "provider": provider, "model": model, "usage": usage }),
        )
        .await;
    }

    async fn send(&self, workflow_id: &str, event_type: EventType, agent_id: Option<&str>, message: String, payload: Value) {
        let envelope = EventEnvelope {
            workflow_id,
            event_type: event_type.as_str(),
            agent_id,
            message,
            payload,
        };
        let mut req = self.client.post(&self.ingest_url).json(&envelope);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        if let Err(err) = req.send().await {
            log::warn!("event emission to {} failed: {err}", self.ingest_url);
        }
    }
}

/// Strip JSON-encoded agent-execution envelopes and `tools` fields from a prompt before it's
/// sent onward as `LLM_PROMPT`. If the message parses as a JSON object, drop a top-level `tools`
/// key and re-serialize the rest; otherwise pass the raw text through unchanged.
fn sanitize_prompt(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(mut map)) => {
            map.remove("tools");
            serde_json::to_string(&map).unwrap_or_else(|_| raw.to_string())
        }
        _ => raw.to_string(),
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_prompt_strips_tools_field() {
        let raw = r#"{"query": "what is the weather", "tools": [{"name": "weather_lookup"}]}"#;
        let cleaned = sanitize_prompt(raw);
        assert!(!cleaned.contains("weather_lookup"));
        assert!(cleaned.contains("what is the weather"));
    }

    #[test]
    fn sanitize_prompt_passes_through_plain_text() {
        assert_eq!(sanitize_prompt("hello there"), "hello there");
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        let long = "a".repeat(600);
        assert_eq!(truncate_chars(&long, 500).chars().count(), 500);
    }
}
