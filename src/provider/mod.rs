//! Provider abstraction: the uniform async interface over every LLM vendor.
//!
//! Every vendor adapter in [`crate::clients`] implements [`Provider`]. The types here — model
//! metadata, the normalised request/response pair, token accounting — are vendor-neutral; the
//! quirks of any one vendor's wire format stay inside that vendor's module. Shared mixins that
//! *every* adapter must apply identically (the headroom clamp, the token-count heuristic, the
//! cache fingerprint, model resolution) live here too, per the REDESIGN FLAGS note that these
//! belong in one place rather than duplicated per-implementation.

pub mod registry;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// Coarse cost/quality bucket used for routing when no explicit model is named (§3 GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::Large => "large",
        }
    }
}

impl Default for ModelTier {
    fn default() -> Self {
        ModelTier::Small
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ModelTier {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(ModelTier::Small),
            "medium" => Ok(ModelTier::Medium),
            "large" => Ok(ModelTier::Large),
            other => Err(GatewayError::Config(format!("unknown model tier '{other}'"))),
        }
    }
}

/// Per-model record (§3). Invariant `max_tokens <= context_window` is enforced in
/// [`ModelConfig::new`]; construction fails rather than silently clamping because a
/// misconfigured model is a config-time bug, not a runtime one.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
    pub alias: String,
    pub tier: ModelTier,
    pub context_window: u32,
    pub max_tokens: u32,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub supports_functions: bool,
    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub supports_reasoning: bool,
    pub default_timeout_secs: u64,
}

impl ModelConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        alias: impl Into<String>,
        tier: ModelTier,
        context_window: u32,
        max_tokens: u32,
        input_price_per_1k: f64,
        output_price_per_1k: f64,
    ) -> Result<Self, GatewayError> {
        if max_tokens > context_window {
            return Err(GatewayError::Config(format!(
                "model '{}': max_tokens ({}) exceeds context_window ({})",
                alias.into(),
                max_tokens,
                context_window
            )));
        }
        Ok(Self {
            provider: provider.into(),
            model_id: model_id.into(),
            alias: alias.into(),
            tier,
            context_window,
            max_tokens,
            input_price_per_1k,
            output_price_per_1k,
            supports_functions: false,
            supports_streaming: true,
            supports_vision: false,
            supports_reasoning: false,
            default_timeout_secs: 60,
        })
    }

    pub fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1000.0) * self.input_price_per_1k
            + (usage.output_tokens as f64 / 1000.0) * self.output_price_per_1k
    }
}

/// `(input_tokens, output_tokens, total_tokens, estimated_cost)`, commutatively additive (§3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
    pub estimated_cost: f64,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize, estimated_cost: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost,
        }
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
            estimated_cost: self.estimated_cost + rhs.estimated_cost,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// A chat role, matching the wire vocabulary in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
    Function,
}

/// One typed content part, matching the `Reflected(JSON)` REDESIGN note: content is a sum type,
/// extracted via a total function rather than a chain of `try`/`except`-style guesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
    ToolCallOutput { tool_call_id: String, output: serde_json::Value },
}

/// Message content: plain text, a list of typed parts, or an opaque JSON value the extractor
/// falls back to reflecting over (§4.1 "three-level fallback" design requirement).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Reflected(serde_json::Value),
}

impl MessageContent {
    /// Total function: string -> parts -> reflected, in that order. Never panics.
    pub fn as_text(&self) -> Option<String> {
        match self {
            MessageContent::Text(s) => Some(s.clone()),
            MessageContent::Parts(parts) => {
                let joined: String = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");
                if joined.is_empty() {
                    None
                } else {
                    Some(joined)
                }
            }
            MessageContent::Reflected(v) => v.as_str().map(|s| s.to_string()).or_else(|| {
                if v.is_null() {
                    None
                } else {
                    Some(v.to_string())
                }
            }),
        }
    }

    pub fn char_len(&self) -> usize {
        self.as_text().map(|s| s.chars().count()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

/// `auto | none | {name}` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionCallMode {
    Auto(String),
    Named { name: String },
}

impl Default for FunctionCallMode {
    fn default() -> Self {
        FunctionCallMode::Auto("auto".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Normalised request (§3). Constructed by HTTP handlers, consumed by [`crate::manager::Manager`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model_tier: ModelTierOrDefault,
    pub model: Option<String>,

    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub seed: Option<i64>,
    pub response_format: Option<serde_json::Value>,

    pub functions: Option<Vec<FunctionSchema>>,
    pub function_call: Option<FunctionCallMode>,

    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub workflow_id: Option<String>,
    pub provider_override: Option<String>,
    pub cache_key: Option<String>,
    pub cache_ttl: Option<u64>,
    pub max_tokens_budget: Option<usize>,

    #[serde(default)]
    pub stream: bool,
}

/// Wrapper so `ModelTier` can implement `Default` for `#[serde(default)]` while the field stays
/// a plain `ModelTier` to callers.
pub type ModelTierOrDefault = ModelTier;

impl CompletionRequest {
    /// Deterministic cache fingerprint over `(messages, model_tier, model, temperature,
    /// max_tokens, functions, seed)`. `session_id`/`task_id`/`agent_id` are excluded by
    /// construction — they simply aren't fed into the hash (§3).
    pub fn fingerprint(&self) -> String {
        if let Some(key) = &self.cache_key {
            return key.clone();
        }
        let mut hasher = Sha256::new();
        for m in &self.messages {
            hasher.update(role_tag(m.role));
            hasher.update(m.content.as_text().unwrap_or_default());
            hasher.update([0u8]);
        }
        hasher.update(self.model_tier.as_str());
        hasher.update(self.model.as_deref().unwrap_or(""));
        if let Some(t) = self.temperature {
            hasher.update(t.to_bits().to_le_bytes());
        }
        if let Some(m) = self.max_tokens {
            hasher.update(m.to_le_bytes());
        }
        if let Some(s) = self.seed {
            hasher.update(s.to_le_bytes());
        }
        if let Some(funcs) = &self.functions {
            if let Ok(json) = serde_json::to_string(funcs) {
                hasher.update(json);
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Last user message content, used by the event emitter for `LLM_PROMPT` (§4.8).
    pub fn last_user_message(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .and_then(|m| m.content.as_text())
    }
}

fn role_tag(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
        MessageRole::Function => "function",
    }
}

/// Normalised output (§3). `provider` is never null (`"unknown"` if the vendor omitted one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub function_call: Option<serde_json::Value>,
    pub request_id: Option<String>,
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub cached: bool,
    pub effective_max_completion: Option<u32>,
}

impl CompletionResponse {
    pub fn provider_or_unknown(provider: Option<String>) -> String {
        provider.unwrap_or_else(|| "unknown".to_string())
    }
}

/// A lazy text-delta stream, optionally ending with one usage value (§4.1, §5 ordering rules).
pub type StreamItem = Result<StreamDelta, GatewayError>;

#[derive(Debug, Clone)]
pub enum StreamDelta {
    Text(String),
    Usage(TokenUsage),
}

pub type CompletionStream = std::pin::Pin<Box<dyn futures_util::Stream<Item = StreamItem> + Send>>;

/// The capability set every vendor exposes (§4.1).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Models registered under this provider, keyed by alias.
    fn models(&self) -> &BTreeMap<String, ModelConfig>;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GatewayError>;

    /// Default: providers that don't support streaming simply don't override this.
    async fn stream_complete(&self, _request: &CompletionRequest) -> Result<CompletionStream, GatewayError> {
        Err(GatewayError::Provider {
            provider: self.name().to_string(),
            status: None,
            message: "streaming not supported by this provider".to_string(),
        })
    }

    /// Vendor-native counter when a provider has one cheaply available; otherwise the shared
    /// heuristic (§4.1 "Token counting"). Async because a native counter may itself be a network
    /// call (e.g. Gemini's `countTokens` endpoint).
    async fn count_tokens(&self, request: &CompletionRequest) -> usize {
        heuristic_token_count(request)
    }

    fn list_models(&self) -> Vec<&ModelConfig> {
        self.models().values().collect()
    }

    fn estimate_cost(&self, model: &ModelConfig, usage: &TokenUsage) -> f64 {
        model.estimate_cost(usage)
    }

    /// Providers without embedding support return `Ok(None)` so callers can probe cheaply.
    async fn generate_embedding(&self, _text: &str, _model: Option<&str>) -> Result<Option<Vec<f32>>, GatewayError> {
        Ok(None)
    }

    /// [`resolve_model_config`] against this provider's model map; shared so every adapter
    /// applies the exact same resolution order (§4.1 "Model resolution").
    fn resolve_model_config(&self, request: &CompletionRequest) -> Result<&ModelConfig, GatewayError> {
        resolve_model_config(self.models(), request, self.name())
    }
}

/// Rule order from §4.1 "Model resolution (`resolve_model_config`)":
/// 1. Strip a `vendor:` prefix from `request.model` if present.
/// 2. Direct alias lookup; else linear `model_id` match; else error.
/// 3. If `request.model` is absent, pick the first model in the requested tier; empty tier errors.
pub fn resolve_model_config<'a>(
    models: &'a BTreeMap<String, ModelConfig>,
    request: &CompletionRequest,
    provider_name: &str,
) -> Result<&'a ModelConfig, GatewayError> {
    if let Some(requested) = &request.model {
        let stripped = requested.split_once(':').map(|(_, rest)| rest).unwrap_or(requested);
        if let Some(cfg) = models.get(stripped) {
            return Ok(cfg);
        }
        if let Some(cfg) = models.values().find(|m| m.model_id == stripped) {
            return Ok(cfg);
        }
        return Err(GatewayError::Provider {
            provider: provider_name.to_string(),
            status: None,
            message: format!("model '{stripped}' not available for provider"),
        });
    }
    models
        .values()
        .find(|m| m.tier == request.model_tier)
        .ok_or_else(|| GatewayError::Provider {
            provider: provider_name.to_string(),
            status: None,
            message: format!("no model registered for tier '{}'", request.model_tier),
        })
}

/// Vendor-agnostic fallback token counter (§4.1 "Token counting"):
/// `⌈sum(len(content_chars))/3.5⌉ + 4·len(messages)`, plus
/// `⌈len(json(functions))/3.5⌉` when functions are present.
pub fn heuristic_token_count(request: &CompletionRequest) -> usize {
    let char_total: usize = request.messages.iter().map(|m| m.content.char_len()).sum();
    let mut total = (char_total as f64 / 3.5).ceil() as usize + 4 * request.messages.len();
    if let Some(functions) = &request.functions {
        if let Ok(json) = serde_json::to_string(functions) {
            total += (json.chars().count() as f64 / 3.5).ceil() as usize;
        }
    }
    total
}

/// The 256-token safety margin subtracted from headroom (§4.1, GLOSSARY).
pub const HEADROOM_SAFETY_MARGIN: usize = 256;

/// `adjusted_max = max(1, min(requested_max, model.max_tokens, context_window -
/// prompt_tokens_estimate - 256))`. Returns [`GatewayError::ContextOverflow`] when headroom <= 0
/// rather than silently truncating (§4.1 "Headroom clamp").
pub fn clamp_headroom(model: &ModelConfig, prompt_tokens_estimate: usize, requested_max: Option<u32>) -> Result<u32, GatewayError> {
    let context_window = model.context_window as usize;
    let headroom = context_window as i64 - prompt_tokens_estimate as i64 - HEADROOM_SAFETY_MARGIN as i64;
    if headroom <= 0 {
        return Err(GatewayError::ContextOverflow {
            prompt_tokens: prompt_tokens_estimate,
            context_window: model.context_window as usize,
            margin: HEADROOM_SAFETY_MARGIN,
        });
    }
    let requested = requested_max.unwrap_or(model.max_tokens) as i64;
    let adjusted = requested.min(model.max_tokens as i64).min(headroom).max(1);
    Ok(adjusted as u32)
}

/// A single retry combinator wrapping provider calls (REDESIGN FLAGS: "typed error enum with a
/// `retryable: bool` discriminator" instead of exception-driven retry). Retries up to
/// `max_attempts` times with exponential backoff (0.5-8s, factor 2) for errors whose
/// [`GatewayError::retryable`] is true; non-retryable errors return immediately.
pub async fn retry_with_backoff<F, Fut, T>(max_attempts: u32, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    use rand::Rng;

    let mut attempt = 0;
    let mut delay_secs = 0.5f64;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.retryable() && attempt + 1 < max_attempts => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0.0..0.25);
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay_secs + jitter)).await;
                delay_secs = (delay_secs * 2.0).min(8.0);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_msg(role: MessageRole, text: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn fingerprint_ignores_session_task_agent() {
        let mut r1 = CompletionRequest {
            messages: vec![text_msg(MessageRole::User, "1+1?")],
            ..Default::default()
        };
        let mut r2 = r1.clone();
        r1.session_id = Some("s1".into());
        r2.session_id = Some("s2".into());
        r2.task_id = Some("t9".into());
        assert_eq!(r1.fingerprint(), r2.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_message_order() {
        let r1 = CompletionRequest {
            messages: vec![text_msg(MessageRole::User, "a"), text_msg(MessageRole::User, "b")],
            ..Default::default()
        };
        let r2 = CompletionRequest {
            messages: vec![text_msg(MessageRole::User, "b"), text_msg(MessageRole::User, "a")],
            ..Default::default()
        };
        assert_ne!(r1.fingerprint(), r2.fingerprint());
    }

    #[test]
    fn fingerprint_returns_explicit_cache_key_without_hashing() {
        let r1 = CompletionRequest {
            messages: vec![text_msg(MessageRole::User, "1+1?")],
            cache_key: Some("pinned-key".to_string()),
            ..Default::default()
        };
        let r2 = CompletionRequest {
            messages: vec![text_msg(MessageRole::User, "totally different prompt")],
            cache_key: Some("pinned-key".to_string()),
            ..Default::default()
        };
        assert_eq!(r1.fingerprint(), "pinned-key");
        assert_eq!(r1.fingerprint(), r2.fingerprint());
    }

    #[test]
    fn headroom_clamp_fails_when_non_positive() {
        let model = ModelConfig::new("openai", "gpt-x", "alpha", ModelTier::Small, 4096, 4096, 0.001, 0.002).unwrap();
        let err = clamp_headroom(&model, 3900, Some(500)).unwrap_err();
        assert!(matches!(err, GatewayError::ContextOverflow { .. }));
    }

    #[test]
    fn headroom_clamp_respects_all_three_bounds() {
        let model = ModelConfig::new("openai", "gpt-x", "alpha", ModelTier::Small, 8192, 1000, 0.001, 0.002).unwrap();
        let adjusted = clamp_headroom(&model, 100, Some(5000)).unwrap();
        assert_eq!(adjusted, 1000);
    }

    #[test]
    fn token_usage_additive() {
        let a = TokenUsage::new(10, 5, 0.01);
        let b = TokenUsage::new(3, 2, 0.002);
        let sum = a + b;
        assert_eq!(sum.total_tokens, 20);
        assert!((sum.estimated_cost - 0.012).abs() < 1e-9);
    }

    #[test]
    fn model_config_rejects_max_tokens_over_context_window() {
        let err = ModelConfig::new("openai", "gpt-x", "alpha", ModelTier::Small, 100, 200, 0.0, 0.0).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
