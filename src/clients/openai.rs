//! OpenAI-family adapter (§4.1 "OpenAI-family").
//!
//! Handles both the Chat Completions and Responses API surfaces behind one [`Provider`] impl,
//! talking the native OpenAI JSON wire format directly over reqwest/bearer-auth so the GPT-5
//! parameter-dropping and Responses-path rules can be expressed exactly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::clients::support::{apply_pricing_overrides, model_map_from_config, provider_error, shared_http_client};
use crate::config::{PricingSection, RawProviderConfig};
use crate::error::GatewayError;
use crate::provider::{
    clamp_headroom, heuristic_token_count, resolve_model_config, retry_with_backoff, ChatMessage, CompletionRequest,
    CompletionResponse, MessageRole, ModelConfig, Provider, TokenUsage,
};

pub struct OpenAiProvider {
    name: String,
    api_key: String,
    base_url: String,
    models: BTreeMap<String, ModelConfig>,
}

impl OpenAiProvider {
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
            base_url: raw.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            models,
        })
    }

    fn is_gpt5_chat(model_id: &str) -> bool {
        model_id.starts_with("gpt-5") && !model_id.starts_with("gpt-5-pro")
    }

    /// Responses path iff the model supports reasoning AND the request is high-complexity AND no
    /// JSON response_format AND no tool calls (§4.1).
    fn use_responses_path(model: &ModelConfig, request: &CompletionRequest) -> bool {
        let high_complexity = heuristic_token_count(request) > 2000;
        let json_mode = matches!(
            request.response_format.as_ref().and_then(|v| v.get("type")).and_then(|v| v.as_str()),
            Some("json_object")
        );
        let has_tools = request.functions.as_ref().is_some_and(|f| !f.is_empty());
        model.supports_reasoning && high_complexity && !json_mode && !has_tools
    }

    fn build_chat_payload(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": role_str(m.role),
                    "content": m.content.as_text().unwrap_or_default(),
                })
            })
            .collect();

        let mut body = json!({
            "model": model.model_id,
            "messages": messages,
        });
        let obj = body.as_object_mut().expect("body is an object");

        let gpt5_chat = Self::is_gpt5_chat(&model.model_id);
        if gpt5_chat {
            obj.insert("max_completion_tokens".to_string(), json!(adjusted_max));
        } else {
            obj.insert("max_tokens".to_string(), json!(adjusted_max));
            if let Some(t) = request.temperature {
                obj.insert("temperature".to_string(), json!(t));
            }
            if let Some(p) = request.top_p {
                obj.insert("top_p".to_string(), json!(p));
            }
            if let Some(fp) = request.frequency_penalty {
                obj.insert("frequency_penalty".to_string(), json!(fp));
            }
            if let Some(pp) = request.presence_penalty {
                obj.insert("presence_penalty".to_string(), json!(pp));
            }
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop".to_string(), json!(stop));
        }
        if let Some(seed) = request.seed {
            obj.insert("seed".to_string(), json!(seed));
        }
        if let Some(rf) = &request.response_format {
            obj.insert("response_format".to_string(), rf.clone());
        }
        if let Some(functions) = &request.functions {
            if !functions.is_empty() {
                let tools: Vec<Value> = functions
                    .iter()
                    .map(|f| {
                        json!({
                            "type": "function",
                            "function": {"name": f.name, "description": f.description, "parameters": f.parameters}
                        })
                    })
                    .collect();
                obj.insert("tools".to_string(), json!(tools));
            }
        }
        body
    }

    /// Converts legacy chat-completion style messages into Responses API `input` items
    /// (`prepare_responses_input` in `openai_responses.py`): `tool`/`function` role messages
    /// become `function_call_output` items, everything else becomes a plain role/content item.
    fn prepare_responses_input(messages: &[ChatMessage]) -> Vec<Value> {
        let mut inputs = Vec::new();
        for (idx, m) in messages.iter().enumerate() {
            let text = m.content.as_text().unwrap_or_default();
            match m.role {
                MessageRole::Tool | MessageRole::Function => {
                    inputs.push(json!({
                        "type": "function_call_output",
                        "call_id": format!("tool_call_{idx}"),
                        "output": text,
                    }));
                }
                _ => {
                    inputs.push(json!({
                        "role": role_str(m.role),
                        "content": text,
                    }));
                }
            }
        }
        inputs
    }

    /// Responses API payload (`build_extra_body` in `openai_responses.py`): `max_output_tokens`
    /// instead of `max_tokens`/`max_completion_tokens`, `input` instead of `messages`, and no
    /// `temperature`/`top_p` (reasoning models reject them).
    fn build_responses_payload(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Value {
        let mut body = json!({
            "model": model.model_id,
            "input": Self::prepare_responses_input(&request.messages),
            "max_output_tokens": adjusted_max,
        });
        let obj = body.as_object_mut().expect("body is an object");
        if let Some(stop) = &request.stop {
            obj.insert("stop".to_string(), json!(stop));
        }
        if let Some(fp) = request.frequency_penalty {
            if fp != 0.0 {
                obj.insert("frequency_penalty".to_string(), json!(fp));
            }
        }
        if let Some(pp) = request.presence_penalty {
            if pp != 0.0 {
                obj.insert("presence_penalty".to_string(), json!(pp));
            }
        }
        if let Some(seed) = request.seed {
            obj.insert("seed".to_string(), json!(seed));
        }
        body
    }

    async fn call_responses(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let payload = self.build_responses_payload(model, request, adjusted_max);
        let url = format!("{}/responses", self.base_url.trim_end_matches('/'));
        let resp = shared_http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
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
        self.normalize_responses_response(model, &parsed, adjusted_max)
    }

    /// `extract_output_text`/`determine_finish_reason`/`select_primary_function_call` in
    /// `openai_responses.py`, ported to the wire shapes the HTTP JSON body actually carries.
    fn normalize_responses_response(&self, model: &ModelConfig, parsed: &Value, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let mut content = parsed.get("output_text").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_default();
        let mut function_call = None;
        if let Some(output) = parsed.get("output").and_then(|v| v.as_array()) {
            if content.is_empty() {
                let mut collected = String::new();
                for item in output {
                    if item.get("type").and_then(|t| t.as_str()) == Some("message") {
                        if let Some(blocks) = item.get("content").and_then(|c| c.as_array()) {
                            for block in blocks {
                                if block.get("type").and_then(|t| t.as_str()) == Some("output_text") {
                                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                        collected.push_str(text);
                                    }
                                }
                            }
                        }
                    }
                }
                content = collected;
            }
            for item in output {
                if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                    let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let arguments_raw = item.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
                    let arguments: Value = serde_json::from_str(arguments_raw).unwrap_or_else(|_| json!({}));
                    function_call = Some(json!({ "name": name, "arguments": arguments }));
                    break;
                }
            }
        }

        let status = parsed.get("status").and_then(|v| v.as_str());
        let finish_reason = match status {
            None | Some("completed") => parsed
                .get("incomplete_details")
                .and_then(|d| d.get("reason"))
                .and_then(|v| v.as_str())
                .unwrap_or("stop")
                .to_string(),
            Some("incomplete") => parsed
                .get("incomplete_details")
                .and_then(|d| d.get("reason"))
                .and_then(|v| v.as_str())
                .unwrap_or("incomplete")
                .to_string(),
            Some("failed") => "error".to_string(),
            Some(other) => other.to_string(),
        };

        if content.trim().is_empty() && finish_reason == "incomplete" {
            content = "[model hit token limit]".to_string();
        }

        let (input_tokens, output_tokens) = parsed
            .get("usage")
            .map(|u| {
                (
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                    u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                )
            })
            .unwrap_or((0, 0));
        let usage = TokenUsage::new(input_tokens, output_tokens, 0.0);
        let cost = model.estimate_cost(&usage);
        let usage = TokenUsage::new(input_tokens, output_tokens, cost);

        Ok(CompletionResponse {
            content,
            model: model.alias.clone(),
            provider: CompletionResponse::provider_or_unknown(parsed.get("model").and_then(|v| v.as_str()).map(str::to_string)),
            usage,
            finish_reason: Some(finish_reason),
            function_call,
            request_id: parsed.get("id").and_then(|v| v.as_str()).map(str::to_string),
            latency_ms: None,
            cached: false,
            effective_max_completion: Some(adjusted_max),
        })
    }

    async fn call_chat_completions(&self, model: &ModelConfig, request: &CompletionRequest, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let payload = self.build_chat_payload(model, request, adjusted_max);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = shared_http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
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
        self.normalize_chat_response(model, &parsed, adjusted_max)
    }

    fn normalize_chat_response(&self, model: &ModelConfig, parsed: &Value, adjusted_max: u32) -> Result<CompletionResponse, GatewayError> {
        let choice = parsed.get("choices").and_then(|c| c.get(0));
        let message = choice.and_then(|c| c.get("message"));
        let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(|v| v.as_str()).map(str::to_string);

        let mut content = extract_content(message);
        let function_call = message.and_then(extract_tool_call);

        if content.trim().is_empty() && finish_reason.as_deref() == Some("length") {
            content = "[model hit token limit]".to_string();
        }

        let (input_tokens, output_tokens) = parsed
            .get("usage")
            .map(|u| {
                (
                    u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                    u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                )
            })
            .unwrap_or((0, 0));
        let usage = TokenUsage::new(input_tokens, output_tokens, 0.0);
        let cost = model.estimate_cost(&usage);
        let usage = TokenUsage::new(input_tokens, output_tokens, cost);

        Ok(CompletionResponse {
            content,
            model: model.alias.clone(),
            provider: CompletionResponse::provider_or_unknown(parsed.get("model").and_then(|v| v.as_str()).map(str::to_string)),
            usage,
            finish_reason,
            function_call,
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

/// Three-level content fallback (§4.1, §9): plain string -> list of typed parts
/// (`text`/`output_text`) -> last-resort reflection over the raw message object.
fn extract_content(message: Option<&Value>) -> String {
    let Some(message) = message else { return String::new() };
    match message.get("content") {
        Some(Value::String(s)) => return s.clone(),
        Some(Value::Array(parts)) => {
            let joined: String = parts
                .iter()
                .filter_map(|p| {
                    if matches!(p.get("type").and_then(|t| t.as_str()), Some("text") | Some("output_text")) {
                        p.get("text").and_then(|t| t.as_str()).map(str::to_string)
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("");
            if !joined.is_empty() {
                return joined;
            }
        }
        _ => {}
    }
    if let Some(reasoning) = message.get("reasoning_content").and_then(|v| v.as_str()) {
        if !reasoning.is_empty() {
            return reasoning.to_string();
        }
    }
    // Last resort: reflect over the whole message object for any string-valued field.
    message.to_string()
}

fn extract_tool_call(message: &Value) -> Option<Value> {
    let calls = message.get("tool_calls")?.as_array()?;
    let first = calls.first()?;
    let func = first.get("function")?;
    let name = func.get("name")?.as_str()?.to_string();
    let args_str = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
    let arguments: Value = serde_json::from_str(args_str).unwrap_or_else(|_| json!({}));
    Some(json!({ "name": name, "arguments": arguments }))
}

#[async_trait]
impl Provider for OpenAiProvider {
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
        if Self::use_responses_path(model, request) {
            retry_with_backoff(3, || self.call_responses(model, request, adjusted_max)).await
        } else {
            retry_with_backoff(3, || self.call_chat_completions(model, request, adjusted_max)).await
        }
    }

    async fn generate_embedding(&self, text: &str, model: Option<&str>) -> Result<Option<Vec<f32>>, GatewayError> {
        let model_id = model.unwrap_or("text-embedding-3-small");
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let resp = shared_http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": model_id, "input": text }))
            .send()
            .await
            .map_err(|e| provider_error(&self.name, None, &e.to_string()))?;
        let status = resp.status();
        let text_body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(provider_error(&self.name, Some(status.as_u16()), &text_body));
        }
        let parsed: Value = serde_json::from_str(&text_body).map_err(|e| GatewayError::Parse {
            provider: self.name.clone(),
            message: e.to_string(),
        })?;
        let embedding = parsed
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("embedding"))
            .and_then(|e| e.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect());
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpt5_chat_excludes_gpt5_pro() {
        assert!(OpenAiProvider::is_gpt5_chat("gpt-5"));
        assert!(OpenAiProvider::is_gpt5_chat("gpt-5-mini"));
        assert!(!OpenAiProvider::is_gpt5_chat("gpt-5-pro"));
        assert!(!OpenAiProvider::is_gpt5_chat("gpt-4o"));
    }

    #[test]
    fn extract_content_falls_back_through_three_shapes() {
        let plain = json!({"content": "hello"});
        assert_eq!(extract_content(Some(&plain)), "hello");

        let parts = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(extract_content(Some(&parts)), "ab");

        let reasoning = json!({"content": null, "reasoning_content": "thinking..."});
        assert_eq!(extract_content(Some(&reasoning)), "thinking...");
    }

    #[test]
    fn extract_tool_call_normalises_name_and_arguments() {
        let message = json!({
            "tool_calls": [{"function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}}]
        });
        let call = extract_tool_call(&message).unwrap();
        assert_eq!(call["name"], "search");
        assert_eq!(call["arguments"]["q"], "rust");
    }

    #[test]
    fn prepare_responses_input_turns_tool_messages_into_function_call_output() {
        let messages = vec![
            ChatMessage { role: MessageRole::User, content: crate::provider::MessageContent::Text("hi".into()) },
            ChatMessage { role: MessageRole::Tool, content: crate::provider::MessageContent::Text("42".into()) },
        ];
        let input = OpenAiProvider::prepare_responses_input(&messages);
        assert_eq!(input[0]["role"], "user");
        assert_eq!(input[1]["type"], "function_call_output");
        assert_eq!(input[1]["output"], "42");
    }

    #[test]
    fn normalize_responses_response_extracts_output_text_and_usage() {
        let provider = OpenAiProvider {
            name: "openai".to_string(),
            api_key: "sk-test".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            models: BTreeMap::new(),
        };
        let model = ModelConfig::new("openai", "o4-mini", "alpha", crate::provider::ModelTier::Large, 200_000, 4096, 0.003, 0.012).unwrap();
        let parsed = json!({
            "status": "completed",
            "output_text": "the answer is 42",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let response = provider.normalize_responses_response(&model, &parsed, 4096).unwrap();
        assert_eq!(response.content, "the answer is 42");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.output_tokens, 5);
    }
}
