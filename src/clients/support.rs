//! Shared plumbing for vendor adapters: the pooled HTTP client and `ModelConfig` construction
//! from a raw config entry.
//!
//! The pooled client is a lazy, keepalive-enabled `reqwest::Client` built once behind
//! `lazy_static` and shared by every vendor adapter in this module, rather than one per adapter.

use std::collections::BTreeMap;
use std::time::Duration;

use lazy_static::lazy_static;

use crate::config::RawModelMeta;
use crate::error::GatewayError;
use crate::provider::{ModelConfig, ModelTier};

lazy_static! {
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");
}

pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Build one [`ModelConfig`] from a [`RawModelMeta`] entry, applying the construction defaults
/// implied by §3 when a field is absent from config.
pub fn model_config_from_meta(
    provider: &str,
    alias: &str,
    meta: &RawModelMeta,
) -> Result<ModelConfig, GatewayError> {
    let tier = meta
        .tier
        .as_deref()
        .unwrap_or("small")
        .parse::<ModelTier>()
        .unwrap_or(ModelTier::Small);
    let context_window = meta.context_window.or(meta.max_context).unwrap_or(8192);
    let max_tokens = meta.max_tokens.or(meta.max_output_tokens).unwrap_or(context_window.min(4096));
    let mut cfg = ModelConfig::new(
        provider,
        meta.model_id.clone().unwrap_or_else(|| alias.to_string()),
        alias,
        tier,
        context_window,
        max_tokens,
        meta.input_price_per_1k.unwrap_or(0.0),
        meta.output_price_per_1k.unwrap_or(0.0),
    )?;
    cfg.supports_functions = meta.supports_functions.unwrap_or(true);
    cfg.supports_streaming = meta.supports_streaming.unwrap_or(true);
    cfg.supports_vision = meta.supports_vision.unwrap_or(false);
    cfg.supports_reasoning = meta.supports_reasoning.unwrap_or(false);
    cfg.default_timeout_secs = meta.timeout.unwrap_or(60);
    Ok(cfg)
}

pub fn model_map_from_config(
    provider: &str,
    models: &std::collections::HashMap<String, RawModelMeta>,
) -> Result<BTreeMap<String, ModelConfig>, GatewayError> {
    let mut out = BTreeMap::new();
    for (alias, meta) in models {
        out.insert(alias.clone(), model_config_from_meta(provider, alias, meta)?);
    }
    Ok(out)
}

/// Apply `pricing.models[provider][alias_or_model_id]` overrides on top of an existing model
/// map, in place (§4.5 "Pricing overrides").
pub fn apply_pricing_overrides(
    provider: &str,
    models: &mut BTreeMap<String, ModelConfig>,
    pricing: Option<&crate::config::PricingSection>,
) {
    let Some(pricing) = pricing else { return };
    let Some(overrides) = pricing.models.get(provider) else { return };
    for model in models.values_mut() {
        let entry = overrides.get(&model.alias).or_else(|| overrides.get(&model.model_id));
        if let Some(entry) = entry {
            if let Some(input) = entry.input_per_1k {
                model.input_price_per_1k = input;
            }
            if let Some(output) = entry.output_per_1k {
                model.output_price_per_1k = output;
            }
        }
    }
}

/// Sanitise a vendor HTTP error body and wrap it as `GatewayError::Provider`.
pub fn provider_error(provider: &str, status: Option<u16>, body: &str) -> GatewayError {
    GatewayError::provider(provider, status, body)
}
