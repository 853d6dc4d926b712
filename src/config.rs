//! Process-wide settings plus the YAML provider/model catalog loader.
//!
//! Two concerns live here, kept as a small settings value type separate from the rest of the
//! crate: a [`Settings`] record read once from the environment at startup, and a
//! [`ModelsDocument`] parsed from YAML describing providers, models, tiers, and routing
//! preferences. Both accepted YAML shapes from §4.5 — legacy (`providers`/`routing`/
//! `caching`) and unified (`model_catalog`/`model_tiers`/`provider_settings`/
//! `selection_strategy`/`prompt_cache`) — are modelled here and normalised into one
//! [`NormalizedConfig`] the rest of the crate consumes.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::Deserialize;

/// Process-wide settings, analogous to the original's `.env`-driven `Settings` object.
///
/// Read once at startup via [`Settings::from_env`] and handed to the composition root
/// ([`crate::manager::Manager`]).
#[derive(Debug, Clone)]
pub struct Settings {
    pub service_name: String,
    pub debug: bool,

    pub enable_cache: bool,
    pub cache_max_size: usize,
    pub default_cache_ttl_seconds: u64,

    pub max_tokens_per_session: usize,
    pub max_cost_per_request: f64,

    pub web_search_rate_limit: u32,
    pub calculator_rate_limit: u32,
    pub python_executor_rate_limit: u32,

    pub enable_llm_events: bool,
    pub enable_llm_partials: bool,
    pub partial_chunk_chars: usize,
    pub events_ingest_url: String,
    pub events_auth_token: Option<String>,

    pub session_workspaces_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "shannon-llm-gateway".to_string(),
            debug: false,
            enable_cache: true,
            cache_max_size: 1000,
            default_cache_ttl_seconds: 3600,
            max_tokens_per_session: 100_000,
            max_cost_per_request: 0.10,
            web_search_rate_limit: 60,
            calculator_rate_limit: 1000,
            python_executor_rate_limit: 30,
            enable_llm_events: true,
            enable_llm_partials: true,
            partial_chunk_chars: 512,
            events_ingest_url: "http://orchestrator:8081/events".to_string(),
            events_auth_token: None,
            session_workspaces_dir: "./workspaces".to_string(),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

impl Settings {
    /// Build settings from environment variables, falling back to the defaults above.
    /// Mirrors `original_source/.../llm_service/config.py::Settings`' env/default table,
    /// trimmed to the fields that still have a referent in this crate (no Redis/Postgres:
    /// there is no chat-history store or vector DB here, per spec.md's Non-goals).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: env::var("SERVICE_NAME").unwrap_or(defaults.service_name),
            debug: env_bool("DEBUG", defaults.debug),
            enable_cache: env_bool("ENABLE_CACHE", defaults.enable_cache),
            cache_max_size: env_num("CACHE_MAX_SIZE", defaults.cache_max_size),
            default_cache_ttl_seconds: env_num("DEFAULT_CACHE_TTL_SECONDS", defaults.default_cache_ttl_seconds),
            max_tokens_per_session: env_num("MAX_TOKENS_PER_SESSION", defaults.max_tokens_per_session),
            max_cost_per_request: env_num("MAX_COST_PER_REQUEST", defaults.max_cost_per_request),
            web_search_rate_limit: env_num("WEB_SEARCH_RATE_LIMIT", defaults.web_search_rate_limit),
            calculator_rate_limit: env_num("CALCULATOR_RATE_LIMIT", defaults.calculator_rate_limit),
            python_executor_rate_limit: env_num("PYTHON_EXECUTOR_RATE_LIMIT", defaults.python_executor_rate_limit),
            enable_llm_events: env_bool("ENABLE_LLM_EVENTS", defaults.enable_llm_events),
            enable_llm_partials: env_bool("ENABLE_LLM_PARTIALS", defaults.enable_llm_partials),
            partial_chunk_chars: env_num("PARTIAL_CHUNK_CHARS", defaults.partial_chunk_chars),
            events_ingest_url: env::var("EVENTS_INGEST_URL").unwrap_or(defaults.events_ingest_url),
            events_auth_token: env::var("EVENTS_AUTH_TOKEN").ok(),
            session_workspaces_dir: env::var("SHANNON_SESSION_WORKSPACES_DIR").unwrap_or(defaults.session_workspaces_dir),
        }
    }
}

/// Raw per-model metadata as it appears in either YAML shape, before defaulting (§3's
/// "construction defaults" paragraph).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawModelMeta {
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub tier: Option<String>,
    pub context_window: Option<u32>,
    pub max_context: Option<u32>,
    pub max_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub input_price_per_1k: Option<f64>,
    pub output_price_per_1k: Option<f64>,
    pub supports_functions: Option<bool>,
    pub supports_streaming: Option<bool>,
    pub supports_vision: Option<bool>,
    pub supports_reasoning: Option<bool>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, RawModelMeta>,
    pub default: Option<bool>,
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct LegacyRoutingConfig {
    #[serde(default)]
    default_provider: Option<String>,
    #[serde(default)]
    tier_preferences: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct LegacyCachingConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_cache_size")]
    max_size: usize,
    #[serde(default = "default_ttl")]
    default_ttl: u64,
}

fn default_true() -> bool {
    true
}
fn default_cache_size() -> usize {
    1000
}
fn default_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize, Default)]
struct LegacyDocument {
    #[serde(default)]
    providers: HashMap<String, RawProviderConfig>,
    #[serde(default)]
    routing: LegacyRoutingConfig,
    #[serde(default)]
    caching: LegacyCachingConfig,
    #[serde(default)]
    pricing: Option<PricingSection>,
}

#[derive(Debug, Clone, Deserialize)]
struct UnifiedTierProvider {
    provider: String,
    model: String,
    #[serde(default = "default_priority")]
    priority: i64,
}

fn default_priority() -> i64 {
    9999
}

#[derive(Debug, Clone, Deserialize, Default)]
struct UnifiedTierConfig {
    #[serde(default)]
    providers: Vec<UnifiedTierProvider>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct UnifiedProviderSettings {
    #[serde(default)]
    base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct UnifiedSelectionStrategy {
    #[serde(default)]
    default_provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct UnifiedPromptCache {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_ttl")]
    ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct UnifiedDocument {
    #[serde(default)]
    model_catalog: HashMap<String, HashMap<String, RawModelMeta>>,
    #[serde(default)]
    model_tiers: HashMap<String, UnifiedTierConfig>,
    #[serde(default)]
    provider_settings: HashMap<String, UnifiedProviderSettings>,
    #[serde(default)]
    selection_strategy: UnifiedSelectionStrategy,
    #[serde(default)]
    prompt_cache: UnifiedPromptCache,
    #[serde(default)]
    pricing: Option<PricingSection>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PricingSection {
    #[serde(default)]
    pub models: HashMap<String, HashMap<String, PricingOverride>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingOverride {
    pub input_per_1k: Option<f64>,
    pub output_per_1k: Option<f64>,
}

/// Normalised view of either YAML shape, ready for [`crate::provider::registry::ProviderRegistry`]
/// construction. This is the output of [`load_models_config`] / [`default_config_from_env`].
#[derive(Debug, Clone, Default)]
pub struct NormalizedConfig {
    pub providers: HashMap<String, RawProviderConfig>,
    pub default_provider: Option<String>,
    pub tier_preferences: HashMap<String, Vec<String>>,
    pub cache_enabled: bool,
    pub cache_max_size: usize,
    pub default_cache_ttl_seconds: u64,
    pub pricing: Option<PricingSection>,
}

type YamlParseResult<T> = Result<T, serde_yaml::Error>;

fn translate_unified(doc: UnifiedDocument) -> NormalizedConfig {
    // Provider type + env-var mapping, matching manager.py::_translate_unified_config's type_map.
    let type_map: HashMap<&str, (&str, &str)> = HashMap::from([
        ("openai", ("openai", "OPENAI_API_KEY")),
        ("anthropic", ("anthropic", "ANTHROPIC_API_KEY")),
        ("google", ("google", "GOOGLE_API_KEY")),
        ("groq", ("groq", "GROQ_API_KEY")),
        ("xai", ("xai", "XAI_API_KEY")),
        ("deepseek", ("openai_compatible", "DEEPSEEK_API_KEY")),
        ("qwen", ("openai_compatible", "QWEN_API_KEY")),
    ]);

    let mut providers = HashMap::new();
    for (prov_name, models) in doc.model_catalog {
        let Some((ptype, env_key)) = type_map.get(prov_name.as_str()) else {
            continue;
        };
        let api_key = env::var(env_key).ok();
        let base_url = if *ptype == "openai_compatible" {
            doc.provider_settings.get(&prov_name).and_then(|s| s.base_url.clone())
        } else {
            None
        };
        providers.insert(
            prov_name,
            RawProviderConfig {
                provider_type: ptype.to_string(),
                api_key,
                base_url,
                models,
                default: None,
                requests_per_minute: None,
            },
        );
    }

    let mut tier_preferences = HashMap::new();
    for (tier_name, tier_cfg) in doc.model_tiers {
        let mut items = tier_cfg.providers;
        items.sort_by_key(|p| p.priority);
        let prefs = items
            .into_iter()
            .map(|p| format!("{}:{}", p.provider, p.model))
            .collect();
        tier_preferences.insert(tier_name, prefs);
    }

    NormalizedConfig {
        providers,
        default_provider: doc.selection_strategy.default_provider,
        tier_preferences,
        cache_enabled: doc.prompt_cache.enabled,
        cache_max_size: 1000,
        default_cache_ttl_seconds: doc.prompt_cache.ttl_seconds,
        pricing: doc.pricing,
    }
}

fn translate_legacy(doc: LegacyDocument) -> NormalizedConfig {
    NormalizedConfig {
        providers: doc.providers,
        default_provider: doc.routing.default_provider,
        tier_preferences: doc.routing.tier_preferences,
        cache_enabled: doc.caching.enabled,
        cache_max_size: doc.caching.max_size,
        default_cache_ttl_seconds: doc.caching.default_ttl,
        pricing: doc.pricing,
    }
}

/// Parse a YAML document into a [`NormalizedConfig`], accepting either accepted shape
/// (§4.5): presence of `model_catalog` or `model_tiers` keys selects the unified parser.
pub fn parse_models_yaml(yaml: &str) -> YamlParseResult<NormalizedConfig> {
    let raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let is_unified = raw.get("model_catalog").is_some() || raw.get("model_tiers").is_some();
    if is_unified {
        let doc: UnifiedDocument = serde_yaml::from_value(raw)?;
        Ok(translate_unified(doc))
    } else {
        let doc: LegacyDocument = serde_yaml::from_value(raw)?;
        Ok(translate_legacy(doc))
    }
}

/// Load the models config from `MODELS_CONFIG_PATH`, then `/app/config/models.yaml`, then
/// `./config/models.yaml`, in that order (manager.py's `auto_paths`). Returns `None` when no
/// file is present at any of those locations, in which case the caller should fall back to
/// [`default_config_from_env`].
pub fn discover_models_config() -> Option<NormalizedConfig> {
    let candidates = [
        env::var("MODELS_CONFIG_PATH").unwrap_or_default(),
        "/app/config/models.yaml".to_string(),
        "./config/models.yaml".to_string(),
    ];
    for path in candidates {
        if path.is_empty() {
            continue;
        }
        if Path::new(&path).exists() {
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(cfg) = parse_models_yaml(&text) {
                    return Some(cfg);
                }
            }
        }
    }
    None
}

/// Synthesise a provider catalog purely from `*_API_KEY` environment variables, used when no
/// config file is discoverable (manager.py::`load_default_config`).
pub fn default_config_from_env() -> NormalizedConfig {
    let mut providers = HashMap::new();

    if let Ok(key) = env::var("OPENAI_API_KEY") {
        providers.insert(
            "openai".to_string(),
            RawProviderConfig {
                provider_type: "openai".to_string(),
                api_key: Some(key),
                base_url: None,
                models: HashMap::new(),
                default: Some(true),
                requests_per_minute: None,
            },
        );
    }
    if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
        providers.insert(
            "anthropic".to_string(),
            RawProviderConfig {
                provider_type: "anthropic".to_string(),
                api_key: Some(key),
                base_url: None,
                models: HashMap::new(),
                default: None,
                requests_per_minute: None,
            },
        );
    }
    if let Ok(key) = env::var("DEEPSEEK_API_KEY") {
        let mut models = HashMap::new();
        models.insert(
            "deepseek-chat".to_string(),
            RawModelMeta {
                tier: Some("small".to_string()),
                context_window: Some(32768),
                input_price_per_1k: Some(0.0001),
                output_price_per_1k: Some(0.0002),
                ..Default::default()
            },
        );
        providers.insert(
            "deepseek".to_string(),
            RawProviderConfig {
                provider_type: "openai_compatible".to_string(),
                api_key: Some(key),
                base_url: Some("https://api.deepseek.com".to_string()),
                models,
                default: None,
                requests_per_minute: None,
            },
        );
    }
    if let Ok(key) = env::var("QWEN_API_KEY") {
        let mut models = HashMap::new();
        models.insert(
            "qwen-turbo".to_string(),
            RawModelMeta {
                tier: Some("small".to_string()),
                context_window: Some(8192),
                input_price_per_1k: Some(0.0003),
                output_price_per_1k: Some(0.0006),
                ..Default::default()
            },
        );
        providers.insert(
            "qwen".to_string(),
            RawProviderConfig {
                provider_type: "openai_compatible".to_string(),
                api_key: Some(key),
                base_url: Some("https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()),
                models,
                default: None,
                requests_per_minute: None,
            },
        );
    }
    if let Ok(key) = env::var("GOOGLE_API_KEY") {
        providers.insert(
            "google".to_string(),
            RawProviderConfig {
                provider_type: "google".to_string(),
                api_key: Some(key),
                base_url: None,
                models: HashMap::new(),
                default: None,
                requests_per_minute: None,
            },
        );
    }
    if let Ok(key) = env::var("GROQ_API_KEY") {
        providers.insert(
            "groq".to_string(),
            RawProviderConfig {
                provider_type: "groq".to_string(),
                api_key: Some(key),
                base_url: None,
                models: HashMap::new(),
                default: None,
                requests_per_minute: None,
            },
        );
    }
    if let Ok(key) = env::var("XAI_API_KEY") {
        providers.insert(
            "xai".to_string(),
            RawProviderConfig {
                provider_type: "xai".to_string(),
                api_key: Some(key),
                base_url: None,
                models: HashMap::new(),
                default: None,
                requests_per_minute: None,
            },
        );
    }

    NormalizedConfig {
        providers,
        default_provider: Some("openai".to_string()),
        tier_preferences: HashMap::from([
            (
                "small".to_string(),
                vec!["openai:gpt-3.5-turbo".to_string(), "anthropic:claude-3-haiku".to_string()],
            ),
            (
                "medium".to_string(),
                vec!["openai:gpt-4".to_string(), "anthropic:claude-3-sonnet".to_string()],
            ),
            (
                "large".to_string(),
                vec!["openai:gpt-4-turbo".to_string(), "anthropic:claude-3-opus".to_string()],
            ),
        ]),
        cache_enabled: true,
        cache_max_size: 1000,
        default_cache_ttl_seconds: 3600,
        pricing: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_shape() {
        let yaml = r#"
providers:
  openai:
    type: openai
    api_key: "sk-test"
    models:
      gpt-4o-mini:
        tier: small
        context_window: 128000
routing:
  default_provider: openai
  tier_preferences:
    small: ["openai:gpt-4o-mini"]
caching:
  enabled: true
  max_size: 500
  default_ttl: 1800
"#;
        let cfg = parse_models_yaml(yaml).unwrap();
        assert_eq!(cfg.cache_max_size, 500);
        assert_eq!(cfg.default_cache_ttl_seconds, 1800);
        assert!(cfg.providers.contains_key("openai"));
        assert_eq!(cfg.tier_preferences["small"], vec!["openai:gpt-4o-mini".to_string()]);
    }

    #[test]
    fn legacy_shape_carries_top_level_pricing_overrides() {
        let yaml = r#"
providers:
  openai:
    type: openai
    api_key: "sk-test"
    models:
      gpt-4o-mini:
        tier: small
pricing:
  models:
    openai:
      gpt-4o-mini:
        input_per_1k: 0.001
        output_per_1k: 0.002
"#;
        let cfg = parse_models_yaml(yaml).unwrap();
        let pricing = cfg.pricing.expect("legacy shape should carry pricing overrides");
        let override_ = &pricing.models["openai"]["gpt-4o-mini"];
        assert_eq!(override_.input_per_1k, Some(0.001));
        assert_eq!(override_.output_per_1k, Some(0.002));
    }

    #[test]
    fn parses_unified_shape_and_sorts_by_priority() {
        let yaml = r#"
model_catalog:
  openai:
    gpt-4o-mini:
      tier: small
  anthropic:
    claude-3-haiku:
      tier: small
model_tiers:
  small:
    providers:
      - provider: anthropic
        model: claude-3-haiku
        priority: 1
      - provider: openai
        model: gpt-4o-mini
        priority: 2
selection_strategy:
  default_provider: anthropic
prompt_cache:
  enabled: true
  ttl_seconds: 900
"#;
        let cfg = parse_models_yaml(yaml).unwrap();
        assert_eq!(
            cfg.tier_preferences["small"],
            vec!["anthropic:claude-3-haiku".to_string(), "openai:gpt-4o-mini".to_string()]
        );
        assert_eq!(cfg.default_cache_ttl_seconds, 900);
    }
}
