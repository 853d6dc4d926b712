//! Vendor adapters, one module per wire dialect (§4.1).
//!
//! [`build_provider`] is the factory the registry loader calls for every entry in a
//! [`crate::config::NormalizedConfig`]; it dispatches on `RawProviderConfig::provider_type`
//! (§6 "Mandatory fields per provider").

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod openai_compatible;
pub mod support;
pub mod xai;

use std::sync::Arc;

use crate::config::{PricingSection, RawProviderConfig};
use crate::error::GatewayError;
use crate::provider::Provider;

pub fn build_provider(name: &str, raw: &RawProviderConfig, pricing: Option<&PricingSection>) -> Result<Arc<dyn Provider>, GatewayError> {
    match raw.provider_type.as_str() {
        "openai" => Ok(Arc::new(openai::OpenAiProvider::new(name, raw, pricing)?)),
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(name, raw, pricing)?)),
        "google" => Ok(Arc::new(gemini::GeminiProvider::new(name, raw, pricing)?)),
        "groq" => Ok(Arc::new(openai_compatible::OpenAiCompatibleProvider::new(
            name,
            raw,
            pricing,
            "https://api.groq.com/openai/v1",
        )?)),
        "openai_compatible" => Ok(Arc::new(openai_compatible::OpenAiCompatibleProvider::new(
            name,
            raw,
            pricing,
            "https://api.openai.com/v1",
        )?)),
        "xai" => Ok(Arc::new(xai::XaiProvider::new(name, raw, pricing)?)),
        other => Err(GatewayError::Config(format!("provider '{name}': unknown provider type '{other}'"))),
    }
}
