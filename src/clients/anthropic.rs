//! Anthropic-family adapter (§4.1 "Anthropic-family").
//!
//! System messages are lifted out of the message list into Anthropic's dedicated `system` field;
//! `function`-role messages become user messages prefixed with "Function result:"; `top_p` is
//! dropped whenever `temperature` is also present (Anthropic, unlike OpenAI, rejects both at
//! once).

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

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    name: String,
    api_key: String,
    base_url: String,
    models: BTreeMap<String, ModelConfig>,
}

impl AnthropicProvider {
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
        Ok(Self {
            name: name.to_string(),
            api_key,
            base_url: raw.base_url.clone().unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            models,
        })
    }

    fn build_payload(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Value {
        let mut system_text: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for m in &request.messages {
            let text = m.content.as_text().unwrap_or_default();
            match m.role {
                MessageRole::System => system_text.push(text),
                MessageRole::Function => {
                    messages.push(json!({"role": "user", "content": format!("Function result: {text}")}));
                }
                MessageRole::Tool => {
                    messages.push(json!({"role": "user", "content": text}));
                }
                MessageRole::User => messages.push(json!({"role": "user", "content": text})),
                MessageRole::Assistant => messages.push(json!({"role": "assistant", "content": text})),
            }
        }

        let mut body = json!({
            "model": model.model_id,
            "messages": messages,
            "max_tokens": adjusted_max,
        });
        let obj = body.as_object_mut().expect("body is an object");
        if !system_text.is_empty() {
            obj.insert("system".to_string(), json!(system_text.join("\n\n")));
        }
        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        } else if let Some(p) = request.top_p {
            // top_p only survives when temperature was not also supplied (§4.1).
            obj.insert("top_p".to_string(), json!(p));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop_sequences".to_string(), json!(stop));
        }
        if let Some(functions) = &request.functions {
            if !functions.is_empty() {
                let tools: Vec<Value> = functions
                    .iter()
                    .map(|f| json!({"name": f.name, "description": f.description, "input_schema": f.parameters}))
                    .collect();
                obj.insert("tools".to_string(), json!(tools));
            }
        }
        body
    }

    async fn call(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let payload = self.build_payload(model, request, adjusted_max);
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        let resp = shared_http_client()
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
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
        self.normalize(model, &parsed, adjusted_max)
    }

    fn normalize(&self, model: &ModelConfig, parsed: &Value, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let blocks = parsed.get("content").and_then(|c| c.as_array()).cloned().unwrap_or_default();
        let mut content = String::new();
        let mut function_call = None;
        for block in &blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                        content.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let arguments = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    function_call = Some(json!({"name": name, "arguments": arguments}));
                }
                _ => {}
            }
        }
        let input_tokens = parsed.get("usage").and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let output_tokens = parsed.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let usage = TokenUsage::new(input_tokens, output_tokens, 0.0);
        let cost = model.estimate_cost(&usage);
        let usage = TokenUsage::new(input_tokens, output_tokens, cost);

        Ok(CompletionResponse {
            content,
            model: model.alias.clone(),
            provider: self.name.clone(),
            usage,
            finish_reason: parsed.get("stop_reason").and_then(|v| v.as_str()).map(str::to_string),
            function_call,
            request_id: parsed.get("id").and_then(|v| v.as_str()).map(str::to_string),
            latency_ms: None,
            cached: false,
            effective_max_completion: Some(adjusted_max),
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
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

    fn model() -> ModelConfig {
        ModelConfig::new("anthropic", "claude-3-haiku", "beta", crate::provider::ModelTier::Small, 100_000, 4096, 0.00025, 0.00125).unwrap()
    }

    fn provider() -> AnthropicProvider {
        AnthropicProvider {
            name: "anthropic".to_string(),
            api_key: "key".to_string(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            models: BTreeMap::new(),
        }
    }

    #[test]
    fn system_message_is_lifted_out_of_the_message_list() {
        let request = CompletionRequest {
            messages: vec![
                ChatMessage { role: MessageRole::System, content: MessageContent::Text("be terse".into()) },
                ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi".into()) },
            ],
            ..Default::default()
        };
        let payload = provider().build_payload(&model(), &request, 100);
        assert_eq!(payload["system"], "be terse");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn top_p_dropped_when_temperature_present() {
        let request = CompletionRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi".into()) }],
            temperature: Some(0.5),
            top_p: Some(0.9),
            ..Default::default()
        };
        let payload = provider().build_payload(&model(), &request, 100);
        assert_eq!(payload["temperature"], 0.5);
        assert!(payload.get("top_p").is_none());
    }

    #[test]
    fn function_role_becomes_prefixed_user_message() {
        let request = CompletionRequest {
            messages: vec![ChatMessage { role: MessageRole::Function, content: MessageContent::Text("42".into()) }],
            ..Default::default()
        };
        let payload = provider().build_payload(&model(), &request, 100);
        assert_eq!(payload["messages"][0]["content"], "Function result: 42");
    }
}
