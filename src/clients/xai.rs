//! xAI (Grok) adapter (§4.1 "xAI (Grok)").
//!
//! Sanitizes messages before transmission (drops `tool_calls`/`function_call`/`name`, maps
//! `system -> user` with a `"System:"` prefix, drops empty assistant turns); applies the
//! `$0.025 x num_sources_used` Live-Search surcharge when the vendor reports it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::clients::support::{apply_pricing_overrides, model_map_from_config, provider_error, shared_http_client};
use crate::config::{PricingSection, RawProviderConfig};
use crate::error::GatewayError;
use crate::provider::{
    clamp_headroom, heuristic_token_count, resolve_model_config, retry_with_backoff, CompletionRequest,
    CompletionResponse, MessageRole, ModelConfig, Provider, TokenUsage,
};

const LIVE_SEARCH_PRICE_PER_SOURCE: f64 = 0.025;

pub struct XaiProvider {
    name: String,
    api_key: String,
    base_url: String,
    models: BTreeMap<String, ModelConfig>,
    /// Forces the Responses path regardless of model capability (`XAI_PREFER_RESPONSES`
    /// env var in the original; §4.1/§9 "the precedence ... is not obviously consistent",
    /// resolved here as an OR against `supports_reasoning`, matching `xai_provider.py`).
    prefer_responses: bool,
}

impl XaiProvider {
    pub fn new(name: &str, raw: &RawProviderConfig, pricing: Option<&PricingSection>) -> Result<Self, GatewayError> {
        let api_key = raw
            .api_key
            .clone()
            .ok_or_else(|| GatewayError::Config(format!("provider '{name}': missing api_key")))?;
        if raw.models.is_empty() {
            return Err(GatewayError::Config(format!("provider '{name}': no models configured")));
        }
        let mut models = model_map_from_config(name, &raw.models)?;
        apply_pricing_overrides(name, &mut models, pricing);
        let prefer_responses = std::env::var("XAI_PREFER_RESPONSES")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Self {
            name: name.to_string(),
            api_key,
            base_url: raw.base_url.clone().unwrap_or_else(|| "https://api.x.ai/v1".to_string()),
            models,
            prefer_responses,
        })
    }

    /// Drop `tool_calls`/`function_call`/`name`, map `system -> user` with a `"System:"` prefix,
    /// drop empty assistant turns (§4.1).
    fn sanitize_messages(messages: &[crate::provider::ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .filter_map(|m| {
                let text = m.content.as_text().unwrap_or_default();
                match m.role {
                    MessageRole::Assistant if text.trim().is_empty() => None,
                    MessageRole::System => Some(json!({"role": "user", "content": format!("System: {text}")})),
                    MessageRole::Function | MessageRole::Tool => Some(json!({"role": "user", "content": text})),
                    MessageRole::User => Some(json!({"role": "user", "content": text})),
                    MessageRole::Assistant => Some(json!({"role": "assistant", "content": text})),
                }
            })
            .collect()
    }

    /// Responses path iff the model supports reasoning OR `prefer_responses` forces it
    /// (`supports_reasoning or self.prefer_responses` in `xai_provider.py`).
    fn use_responses_path(&self, model: &ModelConfig) -> bool {
        model.supports_reasoning || self.prefer_responses
    }

    async fn call(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let messages = Self::sanitize_messages(&request.messages);
        let path = if self.use_responses_path(model) { "responses" } else { "chat/completions" };

        let mut body = json!({ "model": model.model_id, "messages": messages, "max_tokens": adjusted_max });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let resp = shared_http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error(&self.name, None, &e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        // Permissive fallback from Responses to Chat on any non-success (§4.1 "permissive
        // fallback to Chat"), attempted exactly once.
        if path == "responses" && !status.is_success() {
            let fallback_url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
            let resp = shared_http_client()
                .post(&fallback_url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| provider_error(&self.name, None, &e.to_string()))?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return self.finish(model, status, &text, adjusted_max);
        }

        self.finish(model, status, &text, adjusted_max)
    }

    fn finish(&self, model: &ModelConfig, status: reqwest::StatusCode, text: &str, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::ProviderAuth {
                provider: self.name.clone(),
                message: crate::error::sanitize_message(text),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::ProviderRateLimit {
                provider: self.name.clone(),
                message: crate::error::sanitize_message(text),
            });
        }
        if !status.is_success() {
            return Err(provider_error(&self.name, Some(status.as_u16()), text));
        }
        let parsed: Value = serde_json::from_str(text).map_err(|e| GatewayError::Parse {
            provider: self.name.clone(),
            message: e.to_string(),
        })?;
        self.normalize(model, &parsed, adjusted_max)
    }

    fn normalize(&self, model: &ModelConfig, parsed: &Value, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let content = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let finish_reason = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let input_tokens = parsed.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let output_tokens = parsed.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let num_sources_used = parsed.get("usage").and_then(|u| u.get("num_sources_used")).and_then(|v| v.as_u64()).unwrap_or(0);

        let usage_for_cost = TokenUsage::new(input_tokens, output_tokens, 0.0);
        let mut cost = model.estimate_cost(&usage_for_cost);
        cost += num_sources_used as f64 * LIVE_SEARCH_PRICE_PER_SOURCE;
        let usage = TokenUsage::new(input_tokens, output_tokens, cost);

        Ok(CompletionResponse {
            content,
            model: model.alias.clone(),
            provider: self.name.clone(),
            usage,
            finish_reason,
            function_call: None,
            request_id: parsed.get("id").and_then(|v| v.as_str()).map(str::to_string),
            latency_ms: None,
            cached: false,
            effective_max_completion: Some(adjusted_max),
        })
    }
}

#[async_trait]
impl Provider for XaiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> &BTreeMap<String, ModelConfig> {
        &self.models
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let model = resolve_model_config(&self.models, request, &self.name)?;
        let prompt_tokens = heuristic_token_count(request);
        let adjusted_max = clamp_headroom(model, prompt_tokens, request.max_tokens)?;
        retry_with_backoff(3, || self.call(model, request, adjusted_max)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, MessageContent};

    #[test]
    fn sanitize_drops_empty_assistant_turns_and_prefixes_system() {
        let messages = vec![
            ChatMessage { role: MessageRole::System, content: MessageContent::Text("be terse".into()) },
            ChatMessage { role: MessageRole::Assistant, content: MessageContent::Text("".into()) },
            ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi".into()) },
        ];
        let sanitized = XaiProvider::sanitize_messages(&messages);
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized[0]["content"], "System: be terse");
        assert_eq!(sanitized[1]["role"], "user");
    }
}
