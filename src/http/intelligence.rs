//! The four "intelligence" endpoints that aren't tool-selection:
//! `/analyze`, `/analyze_task`, `/context/compress`, `/agent/evaluate`.
//!
//! Grounded on `original_source/.../llm_service/api/{complexity,context,evaluate}.py`. All four
//! share the model-first-heuristic-fallback shape via [`crate::http::ask_model_for_json`], with
//! one deliberate exception: `/context/compress`'s model path raises rather than falling back
//! (§4.6, see [`compress_context`]'s doc comment).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::http::RequestHeaders;
use crate::manager::Manager;

// ---------------------------------------------------------------------------------------------
// /analyze
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ComplexityRequest {
    pub query: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub available_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityResponse {
    pub recommended_mode: String,
    pub complexity_score: f64,
    pub required_capabilities: Vec<String>,
    pub estimated_agents: u32,
    pub estimated_tokens: u32,
    pub estimated_cost_usd: f64,
    pub reasoning: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

const CALCULATION_KEYWORDS: &[&str] = &["calculate", "compute", "sum", "add up", "subtract", "multiply", "divide", "average", "percentage"];
const ANALYZE_COMPARE_KEYWORDS: &[&str] = &["analyze", "analyse", "compare", "evaluate", "contrast", "assess"];
const IMPLEMENT_DESIGN_KEYWORDS: &[&str] = &["implement", "design", "build", "develop", "architect", "refactor"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_ascii_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Heuristic table from §4.6: calculation-keyword queries never classify as `simple` (checked
/// first), then short queries, then analyze/compare, then implement/design/long, else a plain
/// `standard` default.
fn heuristic_complexity(query: &str, available_tools: &[String]) -> ComplexityResponse {
    let word_count = query.split_whitespace().count();

    let (mode, mut score, mut agents, tokens, cost, reasoning) = if contains_any(query, CALCULATION_KEYWORDS) {
        ("standard", 0.4, 1u32, 200u32, 0.002, "query involves a calculation")
    } else if word_count <= 10 {
        ("simple", 0.2, 0u32, 100u32, 0.001, "short, simple query")
    } else if contains_any(query, ANALYZE_COMPARE_KEYWORDS) {
        ("standard", 0.5, 1u32, 500u32, 0.005, "query asks for analysis or comparison")
    } else if contains_any(query, IMPLEMENT_DESIGN_KEYWORDS) || word_count > 60 {
        ("complex", 0.8, 3u32, 2000u32, 0.02, "query asks for implementation/design, or is long")
    } else {
        ("standard", 0.4, 1u32, 300u32, 0.003, "no strong signal either way, default to standard")
    };

    let mut required_capabilities: Vec<String> = match mode {
        "simple" => vec![],
        "complex" => vec!["reasoning".to_string(), "planning".to_string()],
        _ => vec!["reasoning".to_string()],
    };

    if available_tools.len() > 5 {
        score = (score + 0.2).min(1.0);
        agents = agents.max(2);
        required_capabilities.push("tool_use".to_string());
    }

    ComplexityResponse {
        recommended_mode: mode.to_string(),
        complexity_score: score,
        required_capabilities,
        estimated_agents: agents,
        estimated_tokens: tokens,
        estimated_cost_usd: cost,
        reasoning: reasoning.to_string(),
        source: "heuristic".to_string(),
        provider: None,
        raw_output: None,
    }
}

const COMPLEXITY_SYSTEM_PROMPT: &str = "Classify the task's complexity. Respond with JSON only: \
{\"recommended_mode\": \"simple\"|\"standard\"|\"complex\", \"complexity_score\": 0.0-1.0, \
\"required_capabilities\": [string], \"estimated_agents\": int, \"estimated_tokens\": int, \
\"estimated_cost_usd\": float, \"reasoning\": string}. No prose outside the JSON object.";

pub async fn analyze_complexity(manager: &Manager, request: ComplexityRequest) -> ComplexityResponse {
    if let Some((value, provider)) = crate::http::ask_model_for_json(manager, COMPLEXITY_SYSTEM_PROMPT, &request.query).await {
        if let Some(parsed) = parse_complexity_response(&value) {
            return ComplexityResponse {
                source: "model".to_string(),
                provider: Some(provider),
                ..parsed
            };
        }
    }
    heuristic_complexity(&request.query, &request.available_tools)
}

fn parse_complexity_response(value: &Value) -> Option<ComplexityResponse> {
    Some(ComplexityResponse {
        recommended_mode: value.get("recommended_mode")?.as_str()?.to_string(),
        complexity_score: value.get("complexity_score")?.as_f64()?,
        required_capabilities: value
            .get("required_capabilities")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        estimated_agents: value.get("estimated_agents").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
        estimated_tokens: value.get("estimated_tokens").and_then(|v| v.as_u64()).unwrap_or(300) as u32,
        estimated_cost_usd: value.get("estimated_cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.003),
        reasoning: value.get("reasoning").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        source: "model".to_string(),
        provider: None,
        raw_output: None,
    })
}

// ---------------------------------------------------------------------------------------------
// /analyze_task
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TaskAnalysisRequest {
    pub task: String,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskAnalysisResponse {
    pub task_type: String,
    pub complexity_score: f64,
    pub key_entities: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub constraints: Vec<String>,
    pub success_criteria: Vec<String>,
    pub reasoning: String,
    pub source: String,
}

const QUERY_KEYWORDS: &[&str] = &["what", "who", "when", "where", "which", "how many", "is there"];
const ANALYSIS_KEYWORDS: &[&str] = &["analyze", "analyse", "compare", "evaluate", "assess"];
const GENERATION_KEYWORDS: &[&str] = &["create", "generate", "write", "build", "design", "compose"];
const TRANSFORMATION_KEYWORDS: &[&str] = &["convert", "transform", "translate", "refactor", "rewrite"];
const EXECUTION_KEYWORDS: &[&str] = &["run", "execute", "deploy", "install", "launch"];

fn classify_task_type(task: &str) -> &'static str {
    if contains_any(task, EXECUTION_KEYWORDS) {
        "Execution"
    } else if contains_any(task, TRANSFORMATION_KEYWORDS) {
        "Transformation"
    } else if contains_any(task, GENERATION_KEYWORDS) {
        "Generation"
    } else if contains_any(task, ANALYSIS_KEYWORDS) {
        "Analysis"
    } else if contains_any(task, QUERY_KEYWORDS) || task.trim_end().ends_with('?') {
        "Query"
    } else {
        "Unknown"
    }
}

/// `min(len/500, 0.3) + min(words/50, 0.2) + min(special_chars/20, 0.2) + min(question_marks/3, 0.3)`,
/// capped at 1.0 (§4.6 exact formula).
fn heuristic_task_complexity(task: &str) -> f64 {
    let len_term = (task.chars().count() as f64 / 500.0).min(0.3);
    let word_term = (task.split_whitespace().count() as f64 / 50.0).min(0.2);
    let special_count = task.chars().filter(|c| !c.is_alphanumeric() && !c.is_whitespace()).count();
    let special_term = (special_count as f64 / 20.0).min(0.2);
    let question_marks = task.chars().filter(|c| *c == '?').count();
    let question_term = (question_marks as f64 / 3.0).min(0.3);
    (len_term + word_term + special_term + question_term).min(1.0)
}

/// Quoted substrings plus a capitalised-word heuristic (§4.6 "key_entities").
fn extract_key_entities(task: &str) -> Vec<String> {
    let mut entities = Vec::new();
    let quoted = regex::Regex::new(r#"["']([^"']+)["']"#).unwrap();
    for caps in quoted.captures_iter(task) {
        entities.push(caps[1].to_string());
    }
    for word in task.split_whitespace() {
        let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric());
        if trimmed.chars().count() > 1 && trimmed.chars().next().is_some_and(|c| c.is_uppercase()) && !entities.iter().any(|e| e == trimmed) {
            entities.push(trimmed.to_string());
        }
    }
    entities
}

fn heuristic_task_analysis(task: &str) -> TaskAnalysisResponse {
    let task_type = classify_task_type(task).to_string();
    TaskAnalysisResponse {
        complexity_score: heuristic_task_complexity(task),
        key_entities: extract_key_entities(task),
        required_capabilities: vec![],
        constraints: vec![],
        success_criteria: vec![],
        reasoning: format!("heuristic classification: {task_type}"),
        task_type,
        source: "heuristic".to_string(),
    }
}

const TASK_ANALYSIS_SYSTEM_PROMPT: &str = "Analyze this task. Respond with JSON only: \
{\"task_type\": \"Query\"|\"Analysis\"|\"Generation\"|\"Transformation\"|\"Execution\"|\"Unknown\", \
\"complexity_score\": 0.0-1.0, \"key_entities\": [string], \"required_capabilities\": [string], \
\"constraints\": [string], \"success_criteria\": [string], \"reasoning\": string}.";

pub async fn analyze_task(manager: &Manager, request: TaskAnalysisRequest) -> TaskAnalysisResponse {
    if let Some((value, _provider)) = crate::http::ask_model_for_json(manager, TASK_ANALYSIS_SYSTEM_PROMPT, &request.task).await {
        if let Some(parsed) = parse_task_analysis_response(&value) {
            return parsed;
        }
    }
    heuristic_task_analysis(&request.task)
}

fn parse_task_analysis_response(value: &Value) -> Option<TaskAnalysisResponse> {
    let strings = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };
    Some(TaskAnalysisResponse {
        task_type: value.get("task_type")?.as_str()?.to_string(),
        complexity_score: value.get("complexity_score")?.as_f64()?,
        key_entities: strings("key_entities"),
        required_capabilities: strings("required_capabilities"),
        constraints: strings("constraints"),
        success_criteria: strings("success_criteria"),
        reasoning: value.get("reasoning").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        source: "model".to_string(),
    })
}

// ---------------------------------------------------------------------------------------------
// /context/compress
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CompressMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressRequest {
    pub messages: Vec<CompressMessage>,
    #[serde(default = "default_target_tokens")]
    pub target_tokens: u32,
}

fn default_target_tokens() -> u32 {
    400
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressResponse {
    pub summary: String,
    pub tokens_saved: u64,
    pub model_used: String,
    pub usage: Value,
}

/// Summarise `messages` to roughly `target_tokens` (clamped to 64-2000). Grounded on
/// `original_source/.../llm_service/api/context.py::compress`.
///
/// Asymmetric with every other intelligence endpoint: when providers *are* configured, a
/// model-path failure propagates as an error rather than degrading to the heuristic — only the
/// "no providers configured" branch below uses the heuristic join-and-truncate path.
pub async fn compress_context(manager: &Manager, request: CompressRequest, headers: &RequestHeaders) -> Result<CompressResponse, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::ToolValidation("messages must not be empty".to_string()));
    }
    let target_tokens = request.target_tokens.clamp(64, 2000);

    if manager.registry_snapshot().is_empty() {
        return Ok(heuristic_compress(&request.messages));
    }

    let recent: Vec<&CompressMessage> = request.messages.iter().rev().take(20).collect();
    let joined: String = recent.iter().rev().map(|m| format!("{}: {}", m.role, m.content)).collect::<Vec<_>>().join("\n");

    use crate::provider::{ChatMessage, CompletionRequest, MessageContent, MessageRole, ModelTier};
    let completion_request = CompletionRequest {
        messages: vec![
            ChatMessage {
                role: MessageRole::System,
                content: MessageContent::Text("Compress the following conversation into a concise, factual summary.".to_string()),
            },
            ChatMessage { role: MessageRole::User, content: MessageContent::Text(joined) },
        ],
        model_tier: ModelTier::Small,
        max_tokens: Some(target_tokens),
        temperature: Some(0.2),
        workflow_id: headers.effective_workflow_id().map(str::to_string),
        agent_id: headers.agent_id.clone(),
        ..Default::default()
    };

    let response = manager.complete(completion_request).await?;
    let total_tokens = response.usage.total_tokens as u64;
    let tokens_saved = (total_tokens * 2).max(1000).saturating_sub(total_tokens);

    Ok(CompressResponse {
        summary: response.content,
        tokens_saved,
        model_used: response.model,
        usage: serde_json::to_value(response.usage).unwrap_or(serde_json::json!({})),
    })
}

fn heuristic_compress(messages: &[CompressMessage]) -> CompressResponse {
    let joined: String = messages.iter().rev().take(10).rev().map(|m| m.content.as_str()).collect::<Vec<_>>().join(" ");
    let summary = if joined.chars().count() > 1000 {
        let truncated: String = joined.chars().take(1000).collect();
        format!("{truncated}...")
    } else {
        joined.clone()
    };
    let tokens_saved = joined.chars().count().saturating_sub(summary.chars().count()) as u64;
    CompressResponse {
        summary,
        tokens_saved,
        model_used: "unknown".to_string(),
        usage: serde_json::json!({}),
    }
}

// ---------------------------------------------------------------------------------------------
// /agent/evaluate
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EvalAgentResult {
    pub agent_id: String,
    #[serde(default)]
    pub response: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationRequest {
    pub original_query: String,
    pub results: Vec<EvalAgentResult>,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EvaluationResponse {
    pub should_replan: bool,
    pub reason: String,
    pub issues: Vec<String>,
    pub hint: String,
}

const EVALUATE_SYSTEM_PROMPT: &str = "Decide whether the orchestrator should replan given these agent results. \
Respond with JSON only: {\"should_replan\": bool, \"reason\": string, \"issues\": [string], \"hint\": string}.";

/// The three hard short-circuits below run unconditionally, regardless of whether providers are
/// configured; only the final "otherwise" branch differs by provider availability (model
/// evaluation vs. no-replan default) (§4.6).
pub async fn evaluate_agents(manager: &Manager, request: EvaluationRequest) -> EvaluationResponse {
    if request.results.is_empty() {
        return EvaluationResponse {
            should_replan: true,
            reason: "empty_results".to_string(),
            ..Default::default()
        };
    }

    let any_failure = request.results.iter().any(|r| !r.success || r.response.trim().is_empty() || r.error.is_some());
    if any_failure {
        return EvaluationResponse {
            should_replan: true,
            reason: "task_failure".to_string(),
            ..Default::default()
        };
    }

    let total_chars: usize = request.results.iter().map(|r| r.response.chars().count()).sum();
    if total_chars < 200 {
        return EvaluationResponse {
            should_replan: true,
            reason: "low_content".to_string(),
            ..Default::default()
        };
    }

    let summary: String = request
        .results
        .iter()
        .map(|r| format!("agent {}: {}", r.agent_id, r.response))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!("Original query: {}\n\nAgent results:\n{}", request.original_query, summary);

    if let Some((value, _provider)) = crate::http::ask_model_for_json(manager, EVALUATE_SYSTEM_PROMPT, &prompt).await {
        if let Some(parsed) = parse_evaluation_response(&value) {
            return parsed;
        }
    }

    EvaluationResponse::default()
}

fn parse_evaluation_response(value: &Value) -> Option<EvaluationResponse> {
    Some(EvaluationResponse {
        should_replan: value.get("should_replan")?.as_bool()?,
        reason: value.get("reason").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        issues: value
            .get("issues")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        hint: value.get("hint").and_then(|v| v.as_str()).unwrap_or("").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculation_keywords_never_classify_simple() {
        let response = heuristic_complexity("calculate the sum", &[]);
        assert_eq!(response.recommended_mode, "standard");
    }

    #[test]
    fn many_available_tools_boost_score_and_add_tool_use() {
        let tools: Vec<String> = (0..10).map(|i| format!("tool{i}")).collect();
        let response = heuristic_complexity("please help me today", &tools);
        assert!(response.required_capabilities.contains(&"tool_use".to_string()));
        assert!(response.estimated_agents >= 2);
    }

    #[test]
    fn task_type_classifier_prefers_execution_over_query_phrasing() {
        assert_eq!(classify_task_type("please run the deployment script"), "Execution");
        assert_eq!(classify_task_type("what is the capital of France?"), "Query");
        assert_eq!(classify_task_type("refactor this module"), "Transformation");
    }

    #[test]
    fn task_complexity_formula_matches_spec() {
        let score = heuristic_task_complexity("short task?");
        assert!(score > 0.0 && score <= 1.0);
    }

    #[test]
    fn heuristic_compress_truncates_past_1000_chars() {
        let messages = vec![CompressMessage { role: "user".to_string(), content: "x".repeat(2000) }];
        let response = heuristic_compress(&messages);
        assert!(response.summary.ends_with("..."));
        assert!(response.summary.chars().count() <= 1003);
    }

    #[tokio::test]
    async fn evaluate_flags_empty_results() {
        let manager = Manager::new(crate::config::Settings::default());
        let request = EvaluationRequest { original_query: "q".to_string(), results: vec![], context: None };
        let response = evaluate_agents(&manager, request).await;
        assert!(response.should_replan);
        assert_eq!(response.reason, "empty_results");
    }

    #[tokio::test]
    async fn evaluate_flags_low_content() {
        let manager = Manager::new(crate::config::Settings::default());
        let request = EvaluationRequest {
            original_query: "q".to_string(),
            results: vec![EvalAgentResult { agent_id: "a1".to_string(), response: "short".to_string(), success: true, error: None }],
            context: None,
        };
        let response = evaluate_agents(&manager, request).await;
        assert!(response.should_replan);
        assert_eq!(response.reason, "low_content");
    }

    #[tokio::test]
    async fn compress_rejects_empty_messages() {
        let manager = Manager::new(crate::config::Settings::default());
        let request = CompressRequest { messages: vec![], target_tokens: 400 };
        let err = compress_context(&manager, request, &RequestHeaders::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn compress_uses_heuristic_when_no_providers_configured() {
        let manager = Manager::new(crate::config::Settings::default());
        let request = CompressRequest {
            messages: vec![CompressMessage { role: "user".to_string(), content: "hello there".to_string() }],
            target_tokens: 400,
        };
        let response = compress_context(&manager, request, &RequestHeaders::default()).await.unwrap();
        assert_eq!(response.model_used, "unknown");
    }
}
