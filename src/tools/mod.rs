//! `Tool` trait, parameter/result types, and the execution pipeline every tool runs through
//!.
//!
//! Grounded on `original_source/.../llm_service/tools/base.py::Tool`: coercion, validation, the
//! two-threshold rate-limit gate, and the execution-timestamp tracker.

pub mod builtin;
pub mod mcp;
pub mod net;
pub mod openapi;
pub mod registry;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Per-session execution context handed to tools marked `session_aware` (§4.7 step 4).
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub workspace_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

/// One declared tool parameter, including the coercion/validation knobs the pipeline enforces
/// (§4.7 step 1-2): `min_value`/`max_value` clamping, `enum_values` membership, `pattern` regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    pub default: Option<Value>,
    pub enum_values: Option<Vec<Value>>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub pattern: Option<String>,
    /// Element type for `Array` parameters; defaults to `String` when unset (§4.7 "Schema export").
    pub items: Option<Box<ParamType>>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: false,
            default: None,
            enum_values: None,
            min_value: None,
            max_value: None,
            pattern: None,
            items: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub dangerous: bool,
    /// `Some(n)` enables the rate-limit gate at step 3; see [`Tool::rate_limit`] doc.
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub session_aware: bool,
}

/// OpenAI-function-style JSON schema export (§4.7 "Schema export").
pub fn schema_for(metadata: &ToolMetadata) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in &metadata.parameters {
        let mut prop = serde_json::json!({
            "type": param_type_str(&p.param_type),
            "description": p.description,
        });
        if p.param_type == ParamType::Array {
            let item_type = p.items.as_deref().map(param_type_str).unwrap_or("string");
            prop["items"] = serde_json::json!({ "type": item_type });
        }
        if let Some(values) = &p.enum_values {
            prop["enum"] = serde_json::json!(values);
        }
        properties.insert(p.name.clone(), prop);
        if p.required {
            required.push(p.name.clone());
        }
    }
    serde_json::json!({
        "name": metadata.name,
        "description": metadata.description,
        "parameters": {
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        }
    })
}

fn param_type_str(t: &ParamType) -> &'static str {
    match t {
        ParamType::String => "string",
        ParamType::Integer => "integer",
        ParamType::Number => "number",
        ParamType::Boolean => "boolean",
        ParamType::Array => "array",
        ParamType::Object => "object",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self { success: true, output, error: None, execution_time_ms: 0 }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, output: Value::Null, error: Some(error.into()), execution_time_ms: 0 }
    }
}

/// A registered tool (§4.7 "Registration"). Implementors provide metadata and the concrete
/// dispatch body; [`execute`] below drives the shared pipeline around it.
#[async_trait]
pub trait Tool: Send + Sync {
    fn metadata(&self) -> &ToolMetadata;

    async fn call(&self, params: Value, ctx: &SessionContext) -> Result<Value, GatewayError>;
}

/// Tracks the last-call timestamp per session (or thread, when no session id is present) for
/// the rate-limit gate, capped at 100 tracked keys with oldest-first eviction (§4.7 step 3).
pub struct RateGate {
    last_call: Mutex<HashMap<String, std::time::Instant>>,
}

impl RateGate {
    pub fn new() -> Self {
        Self { last_call: Mutex::new(HashMap::new()) }
    }

    /// `rate_limit >= 60` is treated as unlimited (tracking skipped). The throttling band is
    /// `1 <= rate_limit < 60`; minimum interval is `60 / rate_limit` seconds (§4.7 step 3).
    fn check(&self, rate_limit: u32, key: &str) -> Result<(), GatewayError> {
        if !(1..60).contains(&rate_limit) {
            return Ok(());
        }
        let min_interval = std::time::Duration::from_secs_f64(60.0 / rate_limit as f64);
        let mut guard = self.last_call.lock().expect("rate gate mutex poisoned");
        let now = std::time::Instant::now();
        if let Some(last) = guard.get(key) {
            if now.duration_since(*last) < min_interval {
                return Err(GatewayError::ToolValidation(format!(
                    "rate limit exceeded for '{key}': minimum interval is {min_interval:?}"
                )));
            }
        }
        if !guard.contains_key(key) && guard.len() >= 100 {
            if let Some(oldest_key) = guard.iter().min_by_key(|(_, t)| *t).map(|(k, _)| k.clone()) {
                guard.remove(&oldest_key);
            }
        }
        guard.insert(key.to_string(), now);
        Ok(())
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the full execution pipeline (§4.7): coercion, validation, rate-limit, dispatch, finalise.
pub async fn execute(tool: &dyn Tool, mut params: Value, ctx: &SessionContext, gate: &RateGate) -> ToolResult {
    let start = std::time::Instant::now();
    let metadata = tool.metadata();

    if let Err(err) = coerce_and_validate(metadata, &mut params) {
        return fail(err, start);
    }

    if let Some(rate_limit) = metadata.rate_limit {
        let key = ctx.session_id.clone().unwrap_or_else(|| "__thread__".to_string());
        if let Err(err) = gate.check(rate_limit, &format!("{}:{key}", metadata.name)) {
            return fail(err, start);
        }
    }

    match tool.call(params, ctx).await {
        Ok(output) => ToolResult {
            success: true,
            output,
            error: None,
            execution_time_ms: start.elapsed().as_millis() as u64,
        },
        Err(err) => fail(err, start),
    }
}

fn fail(err: GatewayError, start: std::time::Instant) -> ToolResult {
    ToolResult {
        success: false,
        output: Value::Null,
        error: Some(err.to_string()),
        execution_time_ms: start.elapsed().as_millis() as u64,
    }
}

/// Coercion (step 1) then validation (step 2). Mutates `params` in place; rejects unknown keys.
fn coerce_and_validate(metadata: &ToolMetadata, params: &mut Value) -> Result<(), GatewayError> {
    let obj = params
        .as_object_mut()
        .ok_or_else(|| GatewayError::ToolValidation("parameters must be a JSON object".to_string()))?;

    let known: std::collections::HashSet<&str> = metadata.parameters.iter().map(|p| p.name.as_str()).collect();
    for key in obj.keys() {
        if !known.contains(key.as_str()) {
            return Err(GatewayError::ToolValidation(format!("unknown parameter '{key}'")));
        }
    }

    for param in &metadata.parameters {
        let present = obj.get(&param.name).cloned();
        let value = match present {
            Some(v) if !v.is_null() => v,
            _ => {
                if let Some(default) = &param.default {
                    obj.insert(param.name.clone(), default.clone());
                    continue;
                }
                if param.required {
                    return Err(GatewayError::ToolValidation(format!("missing required parameter '{}'", param.name)));
                }
                continue;
            }
        };
        let coerced = coerce(&param.param_type, value)?;
        validate(param, &coerced)?;
        obj.insert(param.name.clone(), coerced);
    }
    Ok(())
}

/// Best-effort coercion table from §4.7 step 1.
fn coerce(expected: &ParamType, value: Value) -> Result<Value, GatewayError> {
    match (expected, &value) {
        (ParamType::Integer, Value::Number(n)) if n.is_f64() => {
            let f = n.as_f64().unwrap();
            if f.fract() == 0.0 {
                Ok(serde_json::json!(f as i64))
            } else {
                Ok(value)
            }
        }
        (ParamType::Integer, Value::String(s)) if s.chars().all(|c| c.is_ascii_digit() || c == '-') && !s.is_empty() => {
            s.parse::<i64>().map(|n| serde_json::json!(n)).map_err(|_| type_err("integer", &value))
        }
        (ParamType::Number, Value::Number(n)) => Ok(serde_json::json!(n.as_f64().unwrap_or(0.0))),
        (ParamType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|n| serde_json::json!(n))
            .map_err(|_| type_err("number", &value)),
        (ParamType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "n" => Ok(Value::Bool(false)),
            _ => Err(type_err("boolean", &value)),
        },
        _ => Ok(value),
    }
}

fn type_err(expected: &str, value: &Value) -> GatewayError {
    GatewayError::ToolValidation(format!("cannot coerce {value} to {expected}"))
}

fn validate(param: &ToolParameter, value: &Value) -> Result<(), GatewayError> {
    let type_ok = match param.param_type {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Number => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    };
    if !type_ok {
        return Err(GatewayError::ToolValidation(format!("parameter '{}' has wrong type", param.name)));
    }
    if let Some(values) = &param.enum_values {
        if !values.contains(value) {
            return Err(GatewayError::ToolValidation(format!("parameter '{}' is not one of the allowed values", param.name)));
        }
    }
    if let Some(n) = value.as_f64() {
        if let Some(min) = param.min_value {
            if n < min {
                return Err(GatewayError::ToolValidation(format!("parameter '{}' below minimum {}", param.name, min)));
            }
        }
        if let Some(max) = param.max_value {
            if n > max {
                return Err(GatewayError::ToolValidation(format!("parameter '{}' above maximum {}", param.name, max)));
            }
        }
    }
    if let (Some(pattern), Value::String(s)) = (&param.pattern, value) {
        let re = regex::Regex::new(pattern).map_err(|e| GatewayError::ToolValidation(e.to_string()))?;
        if !re.is_match(s) {
            return Err(GatewayError::ToolValidation(format!("parameter '{}' does not match pattern", param.name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        metadata: ToolMetadata,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn metadata(&self) -> &ToolMetadata {
            &self.metadata
        }

        async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
            Ok(params)
        }
    }

    fn echo_tool() -> EchoTool {
        EchoTool {
            metadata: ToolMetadata {
                name: "echo".to_string(),
                description: "echoes its input".to_string(),
                parameters: vec![
                    ToolParameter::new("count", ParamType::Integer, "a count").with_range(0.0, 10.0),
                    ToolParameter::new("flag", ParamType::Boolean, "a flag"),
                ],
                category: "general".to_string(),
                dangerous: false,
                rate_limit: None,
                session_aware: false,
            },
        }
    }

    #[tokio::test]
    async fn coerces_digit_string_and_bool_string() {
        let tool = echo_tool();
        let gate = RateGate::new();
        let params = serde_json::json!({ "count": "7", "flag": "yes" });
        let result = execute(&tool, params, &SessionContext::default(), &gate).await;
        assert!(result.success);
        assert_eq!(result.output["count"], 7);
        assert_eq!(result.output["flag"], true);
    }

    #[tokio::test]
    async fn rejects_out_of_range_value() {
        let tool = echo_tool();
        let gate = RateGate::new();
        let params = serde_json::json!({ "count": 99 });
        let result = execute(&tool, params, &SessionContext::default(), &gate).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn rejects_unknown_parameter() {
        let tool = echo_tool();
        let gate = RateGate::new();
        let params = serde_json::json!({ "count": 1, "bogus": true });
        let result = execute(&tool, params, &SessionContext::default(), &gate).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown parameter"));
    }

    #[test]
    fn schema_export_marks_required_and_array_item_type() {
        let metadata = ToolMetadata {
            name: "search".to_string(),
            description: "search".to_string(),
            parameters: vec![
                ToolParameter::new("query", ParamType::String, "q").required(),
                ToolParameter::new("tags", ParamType::Array, "tags"),
            ],
            ..Default::default()
        };
        let schema = schema_for(&metadata);
        assert_eq!(schema["parameters"]["required"], serde_json::json!(["query"]));
        assert_eq!(schema["parameters"]["properties"]["tags"]["items"]["type"], "string");
    }
}
