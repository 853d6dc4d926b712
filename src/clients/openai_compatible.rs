//! Groq / OpenAI-compatible adapter (§4.1 "Groq / OpenAI-compatible (DeepSeek, Qwen, Ollama)").
//!
//! Shares the plain Chat Completions contract with [`crate::clients::openai`] but without any of
//! the GPT-5/Responses-path vendor quirks — only `base_url` and the model catalog differ between
//! Groq, DeepSeek, Qwen, and Ollama.

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

pub struct OpenAiCompatibleProvider {
    name: String,
    api_key: String,
    base_url: String,
    models: BTreeMap<String, ModelConfig>,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, raw: &RawProviderConfig, pricing: Option<&PricingSection>, default_base_url: &str) -> Result<Self, GatewayError> {
        let api_key = raw
            .api_key
            .clone()
            .ok_or_else(|| GatewayError::Config(format!("provider '{name}': missing api_key")))?;
        if raw.models.is_empty() {
            return Err(GatewayError::Config(format!("provider '{name}': no models configured")));
        }
        let mut models = model_map_from_config(name, &raw.models)?;
        apply_pricing_overrides(name, &mut models, pricing);
        Ok(Self {
            name: name.to_string(),
            api_key,
            base_url: raw.base_url.clone().unwrap_or_else(|| default_base_url.to_string()),
            models,
        })
    }

    async fn call(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": role_str(m.role), "content": m.content.as_text().unwrap_or_default()}))
            .collect();

        let mut body = json!({ "model": model.model_id, "messages": messages, "max_tokens": adjusted_max });
        let obj = body.as_object_mut().expect("body is an object");
        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".to_string(), json!(p));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop".to_string(), json!(stop));
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = shared_http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error(&self.name, None, &e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::ProviderAuth {
                provider: self.name.clone(),
                message: crate::error::sanitize_message(&text),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::ProviderRateLimit {
                provider: self.name.clone(),
                message: crate::error::sanitize_message(&text),
            });
        }
        if !status.is_success() {
            return Err(provider_error(&self.name, Some(status.as_u16()), &text));
        }
        let parsed: Value = serde_json::from_str(&text).map_err(|e| GatewayError::Parse {
            provider: self.name.clone(),
            message: e.to_string(),
        })?;
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
        let usage = TokenUsage::new(input_tokens, output_tokens, 0.0);
        let cost = model.estimate_cost(&usage);
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

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
        MessageRole::Function => "function",
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
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
