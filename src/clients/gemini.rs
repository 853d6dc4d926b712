//! Google Gemini adapter (§4.1 "Google Gemini").
//!
//! Roles convert `assistant -> model`; `system` is dropped from the message list and its text
//! prepended to the first user message; multi-part content is flattened to plain text.

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

pub struct GeminiProvider {
    name: String,
    api_key: String,
    base_url: String,
    models: BTreeMap<String, ModelConfig>,
}

impl GeminiProvider {
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
            base_url: raw.base_url.clone().unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            models,
        })
    }

    /// `assistant -> model`, drop `system` and prepend its text to the first user turn, flatten
    /// multi-part content (§4.1).
    fn to_contents(messages: &[crate::provider::ChatMessage]) -> Vec<Value> {
        let system_text: String = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .filter_map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut contents = Vec::new();
        let mut prepended = false;
        for m in messages {
            if m.role == MessageRole::System {
                continue;
            }
            let role = match m.role {
                MessageRole::Assistant => "model",
                _ => "user",
            };
            let mut text = m.content.as_text().unwrap_or_default();
            if !system_text.is_empty() && !prepended && role == "user" {
                text = format!("{system_text}\n\n{text}");
                prepended = true;
            }
            contents.push(json!({"role": role, "parts": [{"text": text}]}));
        }
        if !system_text.is_empty() && !prepended {
            contents.insert(0, json!({"role": "user", "parts": [{"text": system_text}]}));
        }
        contents
    }

    async fn call(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let contents = Self::to_contents(&request.messages);
        let mut generation_config = json!({ "maxOutputTokens": adjusted_max });
        if let Some(t) = request.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            generation_config["topP"] = json!(p);
        }
        let payload = json!({ "contents": contents, "generationConfig": generation_config });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            model.model_id,
            self.api_key
        );
        let resp = shared_http_client()
            .post(&url)
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
        let candidate = parsed.get("candidates").and_then(|c| c.get(0));
        let content = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let finish_reason = candidate.and_then(|c| c.get("finishReason")).and_then(|v| v.as_str()).map(str::to_string);

        let input_tokens = parsed
            .get("usageMetadata")
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let output_tokens = parsed
            .get("usageMetadata")
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
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
            request_id: None,
            latency_ms: None,
            cached: false,
            effective_max_completion: Some(adjusted_max),
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
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

    /// Vendor-native counter via Gemini's `:countTokens` endpoint
    /// (`model_instance.count_tokens(...)` in `google_provider.py`), falling back to the shared
    /// heuristic on resolution failure, transport error, or an unparseable response (§4.1
    /// "Google Gemini: use vendor-native token counter when available").
    async fn count_tokens(&self, request: &CompletionRequest) -> usize {
        let Ok(model) = resolve_model_config(&self.models, request, &self.name) else {
            return heuristic_token_count(request);
        };
        let contents = Self::to_contents(&request.messages);
        let url = format!(
            "{}/models/{}:countTokens?key={}",
            self.base_url.trim_end_matches('/'),
            model.model_id,
            self.api_key
        );
        let native = async {
            let resp = shared_http_client().post(&url).json(&json!({ "contents": contents })).send().await.ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let parsed: Value = resp.json().await.ok()?;
            parsed.get("totalTokens").and_then(|v| v.as_u64())
        }
        .await;
        match native {
            Some(total) => total as usize,
            None => heuristic_token_count(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, MessageContent};

    #[test]
    fn system_is_dropped_and_prepended_to_first_user_turn() {
        let messages = vec![
            ChatMessage { role: MessageRole::System, content: MessageContent::Text("be terse".into()) },
            ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi".into()) },
        ];
        let contents = GeminiProvider::to_contents(&messages);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert!(contents[0]["parts"][0]["text"].as_str().unwrap().starts_with("be terse"));
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let messages = vec![ChatMessage { role: MessageRole::Assistant, content: MessageContent::Text("hi".into()) }];
        let contents = GeminiProvider::to_contents(&messages);
        assert_eq!(contents[0]["role"], "model");
    }

    #[tokio::test]
    async fn count_tokens_falls_back_to_heuristic_when_model_unresolvable() {
        let provider = GeminiProvider {
            name: "google".to_string(),
            api_key: "test-key".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            models: BTreeMap::new(),
        };
        let request = CompletionRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi there".into()) }],
            ..Default::default()
        };
        let count = provider.count_tokens(&request).await;
        assert_eq!(count, heuristic_token_count(&request));
    }
}
