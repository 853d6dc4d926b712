//! Composition root / router (§4.5).
//!
//! Grounded on `llm_provider/manager.py::LLMManager` almost wholesale: cache -> select ->
//! rate-limit -> budget -> complete -> fallback -> ledger -> cache -> events -> metrics.
//! `Manager` exclusively owns the registry, cache, rate limiter, budget tracker, and event
//! emitter (§3 "Ownership"); HTTP handlers only ever reach them through `Manager`'s methods.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::budget::BudgetTracker;
use crate::cache::Cache;
use crate::clients::build_provider;
use crate::config::{discover_models_config, default_config_from_env, NormalizedConfig, Settings};
use crate::error::GatewayError;
use crate::event::EventEmitter;
use crate::metrics::MetricsCollector;
use crate::provider::registry::ProviderRegistry;
use crate::provider::{CompletionRequest, CompletionResponse, ModelTier, Provider, TokenUsage};
use crate::rate_limiter::RateLimiter;

/// Snapshot returned by [`Manager::get_usage_report`] (§4.5).
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageReport {
    pub session_usage: Option<TokenUsage>,
    pub task_usage: Option<TokenUsage>,
    pub cache_hit_rate: f64,
}

/// The gateway's composition root. Cheap to clone (everything inside is `Arc`); handlers hold a
/// `Manager` by value.
#[derive(Clone)]
pub struct Manager {
    settings: Arc<Settings>,
    registry: Arc<RwLock<Arc<ProviderRegistry>>>,
    cache: Arc<Cache>,
    rate_limiter: Arc<RateLimiter>,
    budget: Arc<BudgetTracker>,
    events: Arc<EventEmitter>,
    metrics: MetricsCollector,
}

impl Manager {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let registry = build_registry_from_discovery(&settings);
        Self {
            cache: Arc::new(Cache::new(settings.cache_max_size)),
            rate_limiter: Arc::new(RateLimiter::new()),
            budget: Arc::new(BudgetTracker::new(settings.max_tokens_per_session)),
            events: EventEmitter::new(&settings),
            registry: Arc::new(RwLock::new(Arc::new(registry))),
            metrics: MetricsCollector::new(),
            settings,
        }
    }

    fn current_registry(&self) -> Arc<ProviderRegistry> {
        self.registry.read().expect("registry lock poisoned").clone()
    }

    /// Re-parse configuration, build a fresh registry, and atomically swap it in. In-flight
    /// requests continue against the old registry because they already hold an `Arc` clone
    /// (§4.5 "reload").
    pub fn reload(&self) -> Result<(), GatewayError> {
        let fresh = build_registry_from_discovery(&self.settings);
        *self.registry.write().expect("registry lock poisoned") = Arc::new(fresh);
        Ok(())
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let start = Instant::now();
        let mut timer = crate::metrics::TimedOperation::start("manager");

        if !request.stream && self.settings.enable_cache {
            let key = request.fingerprint();
            if let Some(cached) = self.cache.get(&key) {
                self.metrics.record_llm_request(
                    &cached.provider,
                    &cached.model,
                    request.model_tier.as_str(),
                    true,
                    start.elapsed().as_secs_f64(),
                    0,
                    0,
                    0.0,
                );
                self.emit_events(&request, &cached).await;
                return Ok(cached);
            }
        }

        let registry = self.current_registry();
        if registry.is_empty() {
            timer.fail("no_provider");
            return Ok(mock_response(&request));
        }

        let candidates = self.candidate_providers(&registry, &request);
        if candidates.is_empty() {
            timer.fail("no_provider");
            return Err(crate::provider::registry::no_provider_available(request.model_tier.as_str()));
        }

        let mut last_err: Option<GatewayError> = None;
        // At most one fallback (§4.5 step 6): try the first candidate, then one more on failure.
        for provider in candidates.into_iter().take(2) {
            self.rate_limiter.acquire(provider.name()).await;

            if let Some(session_id) = &request.session_id {
                if let Err(err) = self.budget.check(session_id, request.max_tokens_budget) {
                    timer.fail("budget_exceeded");
                    return Err(err);
                }
            }

            match provider.complete(&request).await {
                Ok(mut response) => {
                    response.latency_ms = Some(start.elapsed().as_millis() as u64);
                    if let Some(session_id) = &request.session_id {
                        self.budget.record(session_id, request.task_id.as_deref(), response.usage);
                    }
                    if !request.stream && self.settings.enable_cache {
                        let ttl = Duration::from_secs(request.cache_ttl.unwrap_or(self.settings.default_cache_ttl_seconds));
                        self.cache.set(request.fingerprint(), response.clone(), ttl);
                    }
                    self.metrics.record_llm_request(
                        &response.provider,
                        &response.model,
                        request.model_tier.as_str(),
                        false,
                        start.elapsed().as_secs_f64(),
                        response.usage.input_tokens as u64,
                        response.usage.output_tokens as u64,
                        response.usage.estimated_cost,
                    );
                    self.emit_events(&request, &response).await;
                    return Ok(response);
                }
                Err(err) => {
                    last_err = Some(err);
                }
            }
        }
        timer.fail("provider_failure");
        Err(last_err.unwrap_or_else(|| crate::provider::registry::no_provider_available(request.model_tier.as_str())))
    }

    /// Preferred-provider walk (§4.5 step 3): honour `provider_override` exclusively if set;
    /// otherwise walk the tier's `"provider:alias"` preference list, then the default provider,
    /// then any provider claiming the tier.
    fn candidate_providers(&self, registry: &ProviderRegistry, request: &CompletionRequest) -> Vec<Arc<dyn Provider>> {
        if let Some(name) = &request.provider_override {
            return registry.get(name).into_iter().collect();
        }
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for entry in registry.tier_preference_list(request.model_tier.as_str()) {
            if let Some(provider) = registry.resolve_preference(entry) {
                if seen.insert(provider.name().to_string()) {
                    out.push(provider);
                }
            }
        }
        if out.is_empty() {
            if let Some(default) = registry.default_provider() {
                if default.models().values().any(|m| m.tier == request.model_tier) {
                    out.push(default);
                }
            }
        }
        if out.is_empty() {
            out.extend(registry.providers_for_tier(request.model_tier));
        }
        out
    }

    async fn emit_events(&self, request: &CompletionRequest, response: &CompletionResponse) {
        if request.workflow_id.is_none() {
            return;
        }
        let workflow_id = request.workflow_id.as_deref();
        let agent_id = request.agent_id.as_deref();
        if let Some(prompt) = request.last_user_message() {
            self.events.emit_prompt(workflow_id, agent_id, &prompt).await;
        }
        self.events
            .emit_output(
                workflow_id,
                agent_id,
                &response.content,
                &response.provider,
                &response.model,
                serde_json::to_value(response.usage).unwrap_or(serde_json::json!({})),
            )
            .await;
    }

    pub async fn generate_embedding(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>, GatewayError> {
        let registry = self.current_registry();
        if let Some(openai) = registry.get("openai") {
            if let Some(embedding) = openai.generate_embedding(text, model).await? {
                return Ok(embedding);
            }
        }
        for provider in registry.all_providers() {
            if let Some(embedding) = provider.generate_embedding(text, model).await? {
                return Ok(embedding);
            }
        }
        Err(GatewayError::Config("no provider supports embeddings".to_string()))
    }

    pub fn get_usage_report(&self, session_id: Option<&str>, task_id: Option<&str>) -> UsageReport {
        UsageReport {
            session_usage: session_id.map(|s| self.budget.session_usage(s)),
            task_usage: task_id.map(|t| self.budget.task_usage(t)),
            cache_hit_rate: self.cache.hit_rate(),
        }
    }

    pub fn registry_snapshot(&self) -> Arc<ProviderRegistry> {
        self.current_registry()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

fn build_registry_from_discovery(settings: &Settings) -> ProviderRegistry {
    let config = discover_models_config().unwrap_or_else(default_config_from_env);
    build_registry(settings, &config)
}

fn build_registry(_settings: &Settings, config: &NormalizedConfig) -> ProviderRegistry {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for (name, raw) in &config.providers {
        match build_provider(name, raw, config.pricing.as_ref()) {
            Ok(provider) => {
                providers.insert(name.clone(), provider);
            }
            Err(err) => {
                log::warn!("skipping provider '{name}': {err}");
            }
        }
    }
    ProviderRegistry::new(providers, config.tier_preferences.clone(), config.default_provider.clone())
}

/// Deterministic offline mock used when no providers are configured (§4.6, §8 "boundary
/// behaviours"). Word-count-derived usage keeps downstream budget math exercised even offline.
fn mock_response(request: &CompletionRequest) -> CompletionResponse {
    let word_count: usize = request
        .messages
        .iter()
        .filter_map(|m| m.content.as_text())
        .map(|t| t.split_whitespace().count())
        .sum();
    let input_tokens = word_count.max(1);
    let output_tokens = 8usize;
    CompletionResponse {
        content: "This is a mock response. No LLM providers are currently configured.".to_string(),
        model: "mock".to_string(),
        provider: "mock".to_string(),
        usage: TokenUsage::new(input_tokens, output_tokens, 0.0),
        finish_reason: Some("stop".to_string()),
        function_call: None,
        request_id: None,
        latency_ms: Some(0),
        cached: false,
        effective_max_completion: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, MessageContent, MessageRole};

    #[tokio::test]
    async fn zero_providers_returns_deterministic_mock() {
        let manager = Manager {
            settings: Arc::new(Settings::default()),
            registry: Arc::new(RwLock::new(Arc::new(ProviderRegistry::empty()))),
            cache: Arc::new(Cache::new(10)),
            rate_limiter: Arc::new(RateLimiter::new()),
            budget: Arc::new(BudgetTracker::new(100_000)),
            events: EventEmitter::new(&Settings::default()),
            metrics: MetricsCollector::new(),
        };
        let request = CompletionRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi there".into()) }],
            ..Default::default()
        };
        let response = manager.complete(request).await.unwrap();
        assert_eq!(response.provider, "mock");
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn budget_exceeded_short_circuits_before_any_provider_call() {
        let manager = Manager {
            settings: Arc::new(Settings::default()),
            registry: Arc::new(RwLock::new(Arc::new(ProviderRegistry::empty()))),
            cache: Arc::new(Cache::new(10)),
            rate_limiter: Arc::new(RateLimiter::new()),
            budget: Arc::new(BudgetTracker::new(10)),
            events: EventEmitter::new(&Settings::default()),
            metrics: MetricsCollector::new(),
        };
        manager.budget.record("s1", None, TokenUsage::new(20, 0, 0.0));
        let request = CompletionRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi".into()) }],
            session_id: Some("s1".to_string()),
            ..Default::default()
        };
        // Budget is exceeded but the registry is also empty; budget check must still fire first.
        let err = manager.budget.check("s1", request.max_tokens_budget).unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
    }
}
