//! `GET /providers/models`.
//!
//! Grounded on `original_source/.../llm_service/api/providers.py::list_models` /
//! `_model_info_to_dict`. Unlike the Python original, [`crate::provider::Provider::list_models`]
//! is a pure in-memory read with nothing to fail, so there's no per-provider try/except-to-error
//! shim here: every provider in the registry contributes its models unconditionally.

use std::str::FromStr;

use serde::Serialize;

use crate::manager::Manager;
use crate::provider::{ModelConfig, ModelTier};

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub tier: String,
    pub context_window: u32,
    pub cost_per_1k_prompt_tokens: f64,
    pub cost_per_1k_completion_tokens: f64,
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub available: bool,
}

impl From<&ModelConfig> for ModelInfo {
    fn from(m: &ModelConfig) -> Self {
        Self {
            id: m.model_id.clone(),
            name: m.alias.clone(),
            tier: m.tier.as_str().to_string(),
            context_window: m.context_window,
            cost_per_1k_prompt_tokens: m.input_price_per_1k,
            cost_per_1k_completion_tokens: m.output_price_per_1k,
            supports_tools: m.supports_functions,
            supports_streaming: m.supports_streaming,
            available: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderModels {
    pub provider: String,
    pub models: Vec<ModelInfo>,
}

/// List every provider's models, optionally keeping only those of `tier`.
pub fn list_models(manager: &Manager, tier: Option<&str>) -> Vec<ProviderModels> {
    let registry = manager.registry_snapshot();
    let tier = tier.and_then(|t| ModelTier::from_str(t).ok());

    let mut out: Vec<ProviderModels> = registry
        .all_providers()
        .map(|provider| {
            let models = provider
                .models()
                .values()
                .filter(|m| tier.map(|t| m.tier == t).unwrap_or(true))
                .map(ModelInfo::from)
                .collect();
            ProviderModels { provider: provider.name().to_string(), models }
        })
        .collect();
    out.sort_by(|a, b| a.provider.cmp(&b.provider));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn empty_registry_lists_no_providers() {
        let manager = Manager::new(Settings::default());
        assert!(list_models(&manager, None).is_empty());
    }
}
