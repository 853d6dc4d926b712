//! `ProviderRegistry`: `name -> Provider` plus tier routing preferences (§3).
//!
//! Grounded on `llm_provider/base.py::LLMProviderRegistry` and `manager.py`'s provider
//! construction loop: built once at startup, then fully rebuilt (never mutated in place) on
//! [`crate::manager::Manager::reload`] so in-flight requests keep a consistent view (§5 "read-mostly;
//! replaced atomically on reload").

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::provider::Provider;

/// Immutable snapshot of the provider catalog. `Manager` holds an `arc-swap`-style
/// `ArcSwap<ProviderRegistry>` so readers never observe a half-built registry.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    /// `tier -> ordered ["provider:alias", ...]` preference list (§3).
    tier_preferences: HashMap<String, Vec<String>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        tier_preferences: HashMap<String, Vec<String>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers,
            tier_preferences,
            default_provider,
        }
    }

    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
            tier_preferences: HashMap::new(),
            default_provider: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.default_provider.as_ref().and_then(|name| self.get(name))
    }

    pub fn tier_preference_list(&self, tier: &str) -> &[String] {
        self.tier_preferences.get(tier).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Every provider that has at least one model in `tier`, in registration order, used as the
    /// last-resort fallback after the preference list and default provider are exhausted
    /// (§4.5 step 3).
    pub fn providers_for_tier(&self, tier: crate::provider::ModelTier) -> Vec<Arc<dyn Provider>> {
        self.providers
            .values()
            .filter(|p| p.models().values().any(|m| m.tier == tier))
            .cloned()
            .collect()
    }

    /// Resolve a `"provider:alias"` preference entry to a concrete provider, verifying the alias
    /// actually exists on that provider (§4.5 step 3: "verify the alias exists").
    pub fn resolve_preference(&self, entry: &str) -> Option<Arc<dyn Provider>> {
        let (provider_name, alias) = entry.split_once(':')?;
        let provider = self.get(provider_name)?;
        if provider.models().contains_key(alias) {
            Some(provider)
        } else {
            None
        }
    }

    pub fn all_providers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.values()
    }
}

/// Error raised when the registry cannot satisfy a routing request at all (no preference hit,
/// no default, no tier fallback).
pub fn no_provider_available(tier: &str) -> GatewayError {
    GatewayError::Config(format!("no provider available for tier '{tier}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionRequest, CompletionResponse, ModelConfig, ModelTier};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct StubProvider {
        name: String,
        models: BTreeMap<String, ModelConfig>,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn models(&self) -> &BTreeMap<String, ModelConfig> {
            &self.models
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, GatewayError> {
            unimplemented!()
        }
    }

    fn stub(name: &str, alias: &str, tier: ModelTier) -> Arc<dyn Provider> {
        let mut models = BTreeMap::new();
        models.insert(
            alias.to_string(),
            ModelConfig::new(name, format!("{alias}-id"), alias, tier, 4096, 1024, 0.001, 0.002).unwrap(),
        );
        Arc::new(StubProvider {
            name: name.to_string(),
            models,
        })
    }

    #[test]
    fn resolve_preference_checks_alias_exists() {
        let mut providers = HashMap::new();
        providers.insert("openai".to_string(), stub("openai", "alpha", ModelTier::Small));
        let registry = ProviderRegistry::new(providers, HashMap::new(), None);
        assert!(registry.resolve_preference("openai:alpha").is_some());
        assert!(registry.resolve_preference("openai:missing").is_none());
        assert!(registry.resolve_preference("unknown:alpha").is_none());
    }

    #[test]
    fn providers_for_tier_filters_by_model_tier() {
        let mut providers = HashMap::new();
        providers.insert("openai".to_string(), stub("openai", "alpha", ModelTier::Small));
        providers.insert("anthropic".to_string(), stub("anthropic", "beta", ModelTier::Large));
        let registry = ProviderRegistry::new(providers, HashMap::new(), None);
        let small = registry.providers_for_tier(ModelTier::Small);
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].name(), "openai");
    }
}
