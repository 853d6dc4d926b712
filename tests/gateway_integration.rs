use std::sync::Arc;

use serde_json::json;
use shannon_llm_gateway::config::{discover_models_config, parse_models_yaml, Settings};
use shannon_llm_gateway::error::{sanitize_message, GatewayError};
use shannon_llm_gateway::tools::builtin::calculator::CalculatorTool;
use shannon_llm_gateway::tools::builtin::register_all;
use shannon_llm_gateway::tools::net::check_ssrf_blocked;
use shannon_llm_gateway::tools::registry::{TaskType, ToolRegistry};
use shannon_llm_gateway::tools::SessionContext;

#[test]
fn tool_registry_drives_calculator_tool_end_to_end() {
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(CalculatorTool::new(&Settings::default())), false)
        .expect("calculator registers cleanly");

    let ctx = SessionContext::default();
    let result = tokio_test_block_on(registry.execute("calculator", json!({ "expression": "2 + 2 * 3" }), &ctx));

    let result = result.expect("no such-tool error");
    assert!(result.success, "expected success, got {result:?}");
    assert_eq!(result.output["result"], 8.0);
}

#[test]
fn tool_registry_rejects_unknown_tool_name() {
    let registry = ToolRegistry::new();
    let ctx = SessionContext::default();
    let err = tokio_test_block_on(registry.execute("does_not_exist", json!({}), &ctx)).unwrap_err();
    assert!(matches!(err, GatewayError::ToolExecution(_)));
}

#[test]
fn register_all_wires_every_builtin_tool_and_analysis_filter_leads_with_calculator() {
    let mut registry = ToolRegistry::new();
    register_all(&mut registry, &Settings::default());

    for name in ["calculator", "file_read", "file_write", "file_list", "bash", "web_search", "web_fetch", "web_subpage_fetch", "web_crawl", "python_executor"] {
        assert!(registry.get(name).is_some(), "expected '{name}' to be registered");
    }

    let filtered = registry.filter_by_task_type(TaskType::Analysis, 3);
    assert_eq!(filtered[0].name, "calculator");
}

#[test]
fn discover_models_config_reads_from_models_config_path_env_var() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("models.yaml");
    std::fs::write(
        &path,
        r#"
providers:
  openai:
    type: openai
    api_key: "sk-test"
    models:
      gpt-4o-mini:
        tier: small
routing:
  default_provider: openai
  tier_preferences:
    small: ["openai:gpt-4o-mini"]
caching:
  enabled: true
  max_size: 250
  default_ttl: 900
"#,
    )
    .expect("write models.yaml");

    std::env::set_var("MODELS_CONFIG_PATH", &path);
    let found = discover_models_config();
    std::env::remove_var("MODELS_CONFIG_PATH");

    let cfg = found.expect("models.yaml should have been discovered");
    assert_eq!(cfg.cache_max_size, 250);
    assert!(cfg.providers.contains_key("openai"));
}

#[test]
fn parse_models_yaml_rejects_malformed_yaml() {
    let result = parse_models_yaml("providers: [this, is, not, a, map]");
    assert!(result.is_err());
}

#[tokio::test]
async fn ssrf_guard_blocks_loopback_host() {
    let err = check_ssrf_blocked("localhost").await.unwrap_err();
    assert!(matches!(err, GatewayError::SsrfBlocked { .. }));
}

#[test]
fn error_messages_never_leak_tokens_or_query_strings() {
    let raw = "upstream said: https://api.anthropic.com/v1/messages?key=shh failed with token sk-ant-REDACTED";
    let clean = sanitize_message(raw);
    assert!(!clean.contains("key=shh"));
    assert!(!clean.contains("0123456789abcdef0123456789abcdef"));

    let err = GatewayError::provider("anthropic", Some(401), raw);
    let rendered = err.to_string();
    assert!(!rendered.contains("key=shh"));
}

/// Small helper so the registry's `async fn execute` can be driven from a plain `#[test]`
/// without pulling `#[tokio::test]` onto tests that don't otherwise need a runtime.
fn tokio_test_block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread().enable_all().build().expect("build current-thread runtime").block_on(fut)
}
