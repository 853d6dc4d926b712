//! OpenAPI tool loader.
//!
//! Grounded on `original_source/.../llm_service/tools/openapi_parser.py` for spec parsing
//! (`$ref` resolution with cycle detection, base-URL extraction with SSRF protection, operation
//! extraction with the 200-operation cap, parameter/request-body extraction) and on
//! `original_source/.../llm_service/tools/openapi_tool.py::OpenAPILoader` for turning parsed
//! operations into dynamic [`crate::tools::Tool`] instances (auth header construction, per-base-URL
//! circuit breaker, path/query/body composition, retry with capped backoff). The breaker and
//! SSRF/allowlist checks are the same ones [`crate::tools::mcp`] uses, from
//! [`crate::tools::net`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::Value;

use crate::clients::support::shared_http_client;
use crate::error::GatewayError;
use crate::tools::net::{base64_encode, check_ssrf_blocked, env_list, env_num, extract_host, host_allowed, CircuitBreaker};
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

lazy_static! {
    /// Keyed `"openapi:{base_url}"`, shared by every operation on that base URL, mirroring the
    /// originals' module-level `_breakers` dict. Fixed 5-failure/60s-recovery threshold, same as
    /// the Python original's `_SimpleBreaker()` default (no env override there).
    static ref OPENAPI_BREAKER: CircuitBreaker = CircuitBreaker::new(5, Duration::from_secs(60));
}

fn allowed_domains() -> Vec<String> {
    env_list("OPENAPI_ALLOWED_DOMAINS", "localhost,127.0.0.1")
}

fn validate_domain(url: &str) -> Result<(), GatewayError> {
    let host = extract_host(url).unwrap_or_default();
    let allowlist = allowed_domains();
    if allowlist.iter().any(|d| d == "*") {
        return Ok(());
    }
    if host_allowed(&host, &allowlist) {
        Ok(())
    } else {
        Err(GatewayError::DomainBlocked { host })
    }
}

/// One extracted operation, resolved and deduplicated (§4.7 "operation extraction").
#[derive(Debug, Clone)]
pub struct OpenApiOperation {
    pub method: String,
    pub path: String,
    pub operation: Value,
    pub operation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Body,
}

#[derive(Debug, Clone)]
pub struct OpenApiParam {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
    pub location: ParamLocation,
    pub enum_values: Option<Vec<Value>>,
}

/// Resolve a local JSON-pointer-style `$ref` (only `#/...` references are supported, matching
/// the original's MVP scope; §4.7 "Non-goals: external $ref").
pub fn resolve_ref(spec: &Value, ref_path: &str) -> Result<Value, GatewayError> {
    let rest = ref_path
        .strip_prefix("#/")
        .ok_or_else(|| GatewayError::Config(format!("only local references (#/...) are supported, got '{ref_path}'")))?;
    let mut current = spec;
    for part in rest.split('/') {
        let part = part.replace("~1", "/").replace("~0", "~");
        current = current
            .get(&part)
            .ok_or_else(|| GatewayError::Config(format!("failed to resolve $ref '{ref_path}'")))?;
    }
    Ok(current.clone())
}

/// Recursively resolve `$ref` nodes in a schema, detecting cycles via `visited` (§4.7 "$ref
/// resolution with cycle detection").
pub fn resolve_refs_in_schema(schema: &Value, spec: &Value, visited: &mut HashSet<String>) -> Result<Value, GatewayError> {
    let Some(obj) = schema.as_object() else {
        return Ok(schema.clone());
    };

    if let Some(Value::String(ref_path)) = obj.get("$ref") {
        if !visited.insert(ref_path.clone()) {
            return Err(GatewayError::Config(format!("circular reference detected: {ref_path}")));
        }
        let resolved = resolve_ref(spec, ref_path)?;
        let mut resolved = resolve_refs_in_schema(&resolved, spec, visited)?;
        visited.remove(ref_path);

        if let Some(resolved_obj) = resolved.as_object_mut() {
            for (k, v) in obj {
                if k != "$ref" {
                    resolved_obj.insert(k.clone(), v.clone());
                }
            }
        }
        return Ok(resolved);
    }

    let mut result = serde_json::Map::new();
    for (k, v) in obj {
        let resolved = match v {
            Value::Object(_) => resolve_refs_in_schema(v, spec, visited)?,
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| if item.is_object() { resolve_refs_in_schema(item, spec, visited) } else { Ok(item.clone()) })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            other => other.clone(),
        };
        result.insert(k.clone(), resolved);
    }
    Ok(Value::Object(result))
}

/// Minimal required-field validation for an OpenAPI 3.x spec (§4.7 "spec validation").
pub fn validate_spec(spec: &Value) -> Result<(), GatewayError> {
    let obj = spec.as_object().ok_or_else(|| GatewayError::Config("OpenAPI spec must be a JSON object".to_string()))?;

    let version = obj.get("openapi").and_then(|v| v.as_str()).unwrap_or("");
    if !version.starts_with("3.") {
        return Err(GatewayError::Config(format!("unsupported OpenAPI version '{version}'; only 3.x is supported")));
    }
    if !obj.contains_key("info") {
        return Err(GatewayError::Config("OpenAPI spec is missing required field 'info'".to_string()));
    }
    match obj.get("paths") {
        Some(Value::Object(paths)) if !paths.is_empty() => {}
        _ => return Err(GatewayError::Config("OpenAPI spec is missing or has an empty 'paths'".to_string())),
    }
    if let Some(servers) = obj.get("servers") {
        if !servers.is_array() {
            return Err(GatewayError::Config("OpenAPI spec 'servers' must be an array".to_string()));
        }
    }
    Ok(())
}

/// Extract the base URL, applying server-variable defaults, resolving a relative server URL
/// against `spec_url`, and SSRF-checking the result (§4.7 "base URL extraction").
pub async fn extract_base_url(spec: &Value, override_base_url: Option<&str>, spec_url: Option<&str>) -> Result<String, GatewayError> {
    if let Some(over) = override_base_url {
        return Ok(over.trim_end_matches('/').to_string());
    }

    let servers = spec.get("servers").and_then(|v| v.as_array()).filter(|a| !a.is_empty());
    let server = servers
        .and_then(|s| s.first())
        .ok_or_else(|| GatewayError::Config("no servers defined in spec and no base_url override provided".to_string()))?;

    let mut url = server.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string();
    if url.is_empty() {
        return Err(GatewayError::Config("server URL is empty".to_string()));
    }

    if let Some(variables) = server.get("variables").and_then(|v| v.as_object()) {
        for (name, var_spec) in variables {
            let default = var_spec.get("default").and_then(|v| v.as_str()).unwrap_or("");
            url = url.replace(&format!("{{{name}}}"), default);
        }
    }

    if url.starts_with('/') {
        let base = spec_url
            .and_then(|u| {
                let scheme = u.split("://").next()?;
                let host = extract_host(u)?;
                Some(format!("{scheme}://{host}"))
            })
            .ok_or_else(|| GatewayError::Config(format!("server URL '{url}' is relative but no spec_url was provided to resolve it")))?;
        url = format!("{base}{url}");
    }

    if let Some(host) = extract_host(&url) {
        check_ssrf_blocked(&host).await?;
    }

    Ok(url.trim_end_matches('/').to_string())
}

const HTTP_METHODS: &[&str] = &["get", "post", "put", "patch", "delete", "head", "options"];

/// Walk every path/method in the spec into a flat operation list, generating a stable
/// `operation_id` when the spec omits one, applying operationId/tag filters, and enforcing the
/// 200-operation cap (§4.7 "operation extraction").
pub fn extract_operations(spec: &Value, operations_filter: Option<&[String]>, tags_filter: Option<&[String]>) -> Result<Vec<OpenApiOperation>, GatewayError> {
    let mut operations = Vec::new();
    let Some(paths) = spec.get("paths").and_then(|v| v.as_object()) else {
        return Ok(operations);
    };

    let sanitize_re = regex::Regex::new(r"[^a-zA-Z0-9_]").unwrap();

    for (path, path_item) in paths {
        let Some(path_item) = path_item.as_object() else { continue };

        for method in HTTP_METHODS {
            let Some(operation) = path_item.get(*method) else { continue };
            if !operation.is_object() {
                continue;
            }

            let operation_id = operation
                .get("operationId")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .unwrap_or_else(|| {
                    let sanitized = sanitize_re.replace_all(path.trim_matches('/'), "_");
                    format!("{method}_{sanitized}")
                });

            if let Some(filter) = operations_filter {
                if !filter.iter().any(|f| f == &operation_id) {
                    continue;
                }
            }

            if let Some(tags_filter) = tags_filter {
                let op_tags: Vec<String> = operation
                    .get("tags")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                if !op_tags.iter().any(|t| tags_filter.contains(t)) {
                    continue;
                }
            }

            operations.push(OpenApiOperation {
                method: method.to_ascii_uppercase(),
                path: path.clone(),
                operation: operation.clone(),
                operation_id,
            });
        }
    }

    if operations.len() > 200 {
        return Err(GatewayError::Config(format!(
            "spec contains {} operations; use an operations or tags filter to limit scope (max 200)",
            operations.len()
        )));
    }

    Ok(operations)
}

fn map_openapi_type(openapi_type: &str) -> ParamType {
    match openapi_type {
        "integer" => ParamType::Integer,
        "number" => ParamType::Number,
        "boolean" => ParamType::Boolean,
        "array" => ParamType::Array,
        "object" => ParamType::Object,
        _ => ParamType::String,
    }
}

/// Path and query parameters only; header and cookie parameters are skipped for this MVP
/// feature set (§4.7 "parameter extraction").
pub fn extract_parameters(operation: &Value, spec: &Value) -> Vec<OpenApiParam> {
    let mut params = Vec::new();
    let Some(raw_params) = operation.get("parameters").and_then(|v| v.as_array()) else {
        return params;
    };

    for param in raw_params {
        let mut param = param.clone();
        if param.get("$ref").is_some() {
            match resolve_refs_in_schema(&param, spec, &mut HashSet::new()) {
                Ok(resolved) => param = resolved,
                Err(_) => continue,
            }
        }

        let location = param.get("in").and_then(|v| v.as_str()).unwrap_or("");
        if location != "path" && location != "query" {
            continue;
        }
        let Some(name) = param.get("name").and_then(|v| v.as_str()) else { continue };

        let required = location == "path" || param.get("required").and_then(|v| v.as_bool()).unwrap_or(false);
        let description = param.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let mut schema = param.get("schema").cloned().unwrap_or(Value::Object(Default::default()));
        if schema.get("$ref").is_some() {
            schema = resolve_refs_in_schema(&schema, spec, &mut HashSet::new()).unwrap_or(serde_json::json!({ "type": "string" }));
        }
        let param_type = schema.get("type").and_then(|v| v.as_str()).unwrap_or("string");
        let enum_values = schema.get("enum").and_then(|v| v.as_array()).cloned();

        params.push(OpenApiParam {
            name: name.to_string(),
            param_type: map_openapi_type(param_type),
            required,
            description,
            location: if location == "path" { ParamLocation::Path } else { ParamLocation::Query },
            enum_values,
        });
    }

    params
}

/// Entire JSON body as a single `body` object parameter; only `application/json` bodies are
/// supported, matching the parser's MVP scope (§4.7 "request body extraction").
pub fn extract_request_body(operation: &Value) -> Option<OpenApiParam> {
    let request_body = operation.get("requestBody")?;
    request_body.get("content")?.get("application/json")?;
    let required = request_body.get("required").and_then(|v| v.as_bool()).unwrap_or(false);
    let description = request_body.get("description").and_then(|v| v.as_str()).unwrap_or("Request body").to_string();
    Some(OpenApiParam {
        name: "body".to_string(),
        param_type: ParamType::Object,
        required,
        description,
        location: ParamLocation::Body,
        enum_values: None,
    })
}

/// Append `_2`, `_3`, ... to any operation_id collisions (§4.7 "operationId deduplication").
pub fn deduplicate_operation_ids(operations: Vec<OpenApiOperation>) -> Vec<OpenApiOperation> {
    let mut seen = HashSet::new();
    operations
        .into_iter()
        .map(|mut op| {
            if seen.contains(&op.operation_id) {
                let original = op.operation_id.clone();
                let mut counter = 2;
                while seen.contains(&format!("{original}_{counter}")) {
                    counter += 1;
                }
                op.operation_id = format!("{original}_{counter}");
            }
            seen.insert(op.operation_id.clone());
            op
        })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenApiAuthConfig {
    pub token: Option<String>,
    pub api_key_location: Option<String>,
    pub api_key_name: Option<String>,
    pub api_key_value: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Resolve a `$ENV_VAR`-style indirection through the process environment, otherwise return the
/// value as-is (§4.7 "auth value indirection").
fn resolve_env_indirection(value: &str) -> String {
    match value.strip_prefix('$') {
        Some(var) => std::env::var(var).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Build the static headers implied by `auth_type`/`auth_config` (§4.7 "auth header
/// construction"): `bearer` and `api_key`-in-header set a header once at load time; `api_key`-in-
/// query and query-string auth are applied per-call instead (see [`OpenApiTool::call`]).
fn build_auth_headers(auth_type: &str, auth_config: &OpenApiAuthConfig) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    match auth_type {
        "bearer" => {
            let token = auth_config.token.as_deref().map(resolve_env_indirection).unwrap_or_default();
            if !token.is_empty() {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
        }
        "api_key" if auth_config.api_key_location.as_deref().unwrap_or("header") == "header" => {
            let key_name = auth_config.api_key_name.clone().unwrap_or_else(|| "X-API-Key".to_string());
            let key_value = auth_config.api_key_value.as_deref().map(resolve_env_indirection).unwrap_or_default();
            if !key_value.is_empty() {
                headers.insert(key_name, key_value);
            }
        }
        "basic" => {
            let username = auth_config.username.as_deref().map(resolve_env_indirection).unwrap_or_default();
            let password = auth_config.password.as_deref().map(resolve_env_indirection).unwrap_or_default();
            if !username.is_empty() && !password.is_empty() {
                let encoded = base64_encode(&format!("{username}:{password}"));
                headers.insert("Authorization".to_string(), format!("Basic {encoded}"));
            }
        }
        _ => {}
    }
    headers
}

/// A tool backed by one OpenAPI operation (§4.7 "per-operation dynamic tool").
pub struct OpenApiTool {
    metadata: ToolMetadata,
    method: String,
    path: String,
    base_url: String,
    params: Vec<OpenApiParam>,
    body_param: Option<OpenApiParam>,
    headers: HashMap<String, String>,
    auth_type: String,
    auth_config: OpenApiAuthConfig,
    timeout_seconds: f64,
    max_response_bytes: usize,
}

#[async_trait]
impl Tool for OpenApiTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        let breaker_key = format!("openapi:{}", self.base_url);
        OPENAPI_BREAKER.check(&breaker_key)?;

        let mut url = format!("{}{}", self.base_url, self.path);
        for param in &self.params {
            if param.location == ParamLocation::Path {
                if let Some(value) = params.get(&param.name) {
                    let raw = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                    url = url.replace(&format!("{{{}}}", param.name), &urlencoding::encode(&raw));
                }
            }
        }

        let mut query_params: Vec<(String, String)> = Vec::new();
        for param in &self.params {
            if param.location == ParamLocation::Query {
                if let Some(value) = params.get(&param.name) {
                    let raw = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                    query_params.push((param.name.clone(), raw));
                }
            }
        }

        let json_body = if self.body_param.is_some() { params.get("body").cloned() } else { None };

        let mut request_headers = self.headers.clone();
        request_headers.insert("Accept".to_string(), "application/json".to_string());

        if self.auth_type == "api_key" && self.auth_config.api_key_location.as_deref() == Some("query") {
            let name = self.auth_config.api_key_name.clone().unwrap_or_else(|| "api_key".to_string());
            let value = self.auth_config.api_key_value.as_deref().map(resolve_env_indirection).unwrap_or_default();
            query_params.push((name, value));
        }

        let retries = env_num::<u32>("OPENAPI_RETRIES", 3).max(1);
        let timeout = Duration::from_secs_f64(self.timeout_seconds);
        let mut last_err = None;

        for attempt in 1..=retries {
            let mut request = shared_http_client()
                .request(
                    self.method.parse().map_err(|_| GatewayError::Config(format!("unsupported HTTP method '{}'", self.method)))?,
                    &url,
                )
                .query(&query_params)
                .timeout(timeout);
            for (k, v) in &request_headers {
                request = request.header(k.as_str(), v.as_str());
            }
            if let Some(body) = &json_body {
                request = request.json(body);
            }

            let result = async {
                let response = request.send().await.map_err(|e| GatewayError::ToolExecution(format!("request failed: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    let truncated: String = body.chars().take(200).collect();
                    return Err(GatewayError::Provider { provider: self.metadata.name.clone(), status: Some(status.as_u16()), message: truncated });
                }
                let content_type = response.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
                let bytes = response.bytes().await.map_err(|e| GatewayError::ToolExecution(format!("failed to read response: {e}")))?;
                if bytes.len() > self.max_response_bytes {
                    return Err(GatewayError::ToolExecution(format!("response too large: {} bytes (max {})", bytes.len(), self.max_response_bytes)));
                }
                if content_type.contains("application/json") {
                    serde_json::from_slice::<Value>(&bytes).map_err(|e| GatewayError::Parse { provider: self.metadata.name.clone(), message: format!("invalid JSON response: {e}") })
                } else {
                    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                }
            }
            .await;

            match result {
                Ok(value) => {
                    OPENAPI_BREAKER.record_success(&breaker_key);
                    return Ok(value);
                }
                Err(err) => {
                    OPENAPI_BREAKER.record_failure(&breaker_key);
                    let retryable = !matches!(err, GatewayError::Provider { status: Some(code), .. } if (400..500).contains(&code));
                    last_err = Some(err);
                    if attempt < retries && retryable {
                        let delay = (2f64.powi(attempt as i32 - 1) * 0.5).min(5.0);
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::ToolExecution("OpenAPI call failed with no recorded error".to_string())))
    }
}

/// Config for one OpenAPI tool collection, mirroring `shannon.yaml`'s `openapi_tools.<name>`
/// section (§4.7 "OpenAPI registration").
#[derive(Debug, Clone, Deserialize)]
pub struct OpenApiToolConfig {
    #[serde(default)]
    pub enabled: bool,
    pub spec_url: Option<String>,
    pub spec_inline: Option<String>,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    #[serde(default)]
    pub auth_config: OpenApiAuthConfig,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_base_cost")]
    pub base_cost_per_use: f64,
    pub operations: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub base_url: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_auth_type() -> String {
    "none".to_string()
}
fn default_category() -> String {
    "api".to_string()
}
fn default_base_cost() -> f64 {
    0.001
}
fn default_rate_limit() -> u32 {
    30
}
fn default_timeout_seconds() -> f64 {
    30.0
}
fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

/// Loads one OpenAPI spec and turns every extracted operation into a [`Tool`] (§4.7
/// "`OpenAPILoader`").
pub struct OpenApiLoader {
    name: String,
    spec: Value,
    config: OpenApiToolConfig,
    base_url: String,
    operations: Vec<OpenApiOperation>,
}

impl OpenApiLoader {
    pub async fn new(name: String, spec: Value, config: OpenApiToolConfig, spec_url: Option<&str>) -> Result<Self, GatewayError> {
        validate_spec(&spec)?;
        let base_url = extract_base_url(&spec, config.base_url.as_deref(), spec_url).await?;
        validate_domain(&base_url)?;

        let operations_filter = config.operations.clone();
        let tags_filter = config.tags.clone();
        let operations = extract_operations(&spec, operations_filter.as_deref(), tags_filter.as_deref())?;
        let operations = deduplicate_operation_ids(operations);

        log::info!("OpenAPI loader '{name}': loaded {} operations from {base_url}", operations.len());

        Ok(Self { name, spec, config, base_url, operations })
    }

    pub fn generate_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.operations.iter().map(|op| self.build_tool(op)).collect()
    }

    fn build_tool(&self, op: &OpenApiOperation) -> Arc<dyn Tool> {
        let mut params = extract_parameters(&op.operation, &self.spec);
        let body_param = extract_request_body(&op.operation);
        if let Some(body) = &body_param {
            params.push(body.clone());
        }

        let summary = op.operation.get("summary").and_then(|v| v.as_str()).unwrap_or("");
        let mut description = op.operation.get("description").and_then(|v| v.as_str()).unwrap_or(summary).to_string();
        if description.is_empty() {
            description = format!("{} {}", op.method, op.path);
        }

        let tool_params: Vec<ToolParameter> = params
            .iter()
            .map(|p| {
                let mut tp = ToolParameter::new(p.name.clone(), p.param_type.clone(), p.description.clone());
                tp.required = p.required;
                tp.enum_values = p.enum_values.clone();
                tp
            })
            .collect();

        Arc::new(OpenApiTool {
            metadata: ToolMetadata {
                name: op.operation_id.clone(),
                description,
                parameters: tool_params,
                category: self.config.category.clone(),
                dangerous: false,
                rate_limit: Some(self.config.rate_limit),
                session_aware: false,
            },
            method: op.method.clone(),
            path: op.path.clone(),
            base_url: self.base_url.clone(),
            params,
            body_param,
            headers: build_auth_headers(&self.config.auth_type, &self.config.auth_config),
            auth_type: self.config.auth_type.clone(),
            auth_config: self.config.auth_config.clone(),
            timeout_seconds: self.config.timeout_seconds,
            max_response_bytes: self.config.max_response_bytes,
        })
    }
}

/// Fetch a spec from a URL (JSON or YAML) behind the same domain allowlist and with a size cap,
/// matching `_fetch_spec_from_url` (§4.7 "spec fetching").
pub async fn fetch_spec_from_url(url: &str) -> Result<Value, GatewayError> {
    validate_domain(url)?;
    if let Some(host) = extract_host(url) {
        check_ssrf_blocked(&host).await?;
    }

    let max_size: usize = env_num("OPENAPI_MAX_SPEC_SIZE", 5 * 1024 * 1024);
    let timeout = Duration::from_secs_f64(env_num("OPENAPI_FETCH_TIMEOUT", 30.0));

    let response = shared_http_client()
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| GatewayError::Config(format!("failed to fetch OpenAPI spec from {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(GatewayError::Config(format!("failed to fetch OpenAPI spec from {url}: HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| GatewayError::Config(format!("failed to read OpenAPI spec body: {e}")))?;
    if bytes.len() > max_size {
        return Err(GatewayError::Config(format!("spec size ({} bytes) exceeds max ({max_size} bytes)", bytes.len())));
    }

    serde_json::from_slice::<Value>(&bytes)
        .or_else(|_| serde_yaml::from_slice::<Value>(&bytes).map_err(|e| GatewayError::Config(format!("OpenAPI spec at {url} is neither valid JSON nor YAML: {e}"))))
}

/// Best-effort load of every enabled collection in `shannon.yaml`'s `openapi_tools` section,
/// continuing past a single collection's failure rather than aborting startup (§4.7 "best-effort
/// OpenAPI registration"). Returns the tools generated and the errors for any collections that
/// failed.
pub async fn load_openapi_tools_from_config(configs: &HashMap<String, OpenApiToolConfig>) -> (Vec<Arc<dyn Tool>>, Vec<GatewayError>) {
    let mut tools = Vec::new();
    let mut errors = Vec::new();

    for (name, config) in configs {
        if !config.enabled {
            log::info!("OpenAPI tool collection '{name}' is disabled, skipping");
            continue;
        }

        let spec_result = if let Some(spec_url) = &config.spec_url {
            fetch_spec_from_url(spec_url).await.map(|spec| (spec, Some(spec_url.clone())))
        } else if let Some(inline) = &config.spec_inline {
            serde_yaml::from_str::<Value>(inline)
                .map_err(|e| GatewayError::Config(format!("OpenAPI tool '{name}': invalid spec_inline: {e}")))
                .map(|spec| (spec, None))
        } else {
            Err(GatewayError::Config(format!("OpenAPI tool '{name}': must provide spec_url or spec_inline")))
        };

        let (spec, spec_url) = match spec_result {
            Ok(v) => v,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        match OpenApiLoader::new(name.clone(), spec, config.clone(), spec_url.as_deref()).await {
            Ok(loader) => {
                let generated = loader.generate_tools();
                log::info!("loaded {} tools from OpenAPI collection '{name}'", generated.len());
                tools.extend(generated);
            }
            Err(e) => errors.push(e),
        }
    }

    (tools, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn petstore_spec() -> Value {
        serde_json::json!({
            "openapi": "3.0.0",
            "info": { "title": "Petstore", "version": "1.0" },
            "servers": [{ "url": "https://api.example.com/v1" }],
            "paths": {
                "/pets/{petId}": {
                    "get": {
                        "operationId": "getPet",
                        "parameters": [
                            { "name": "petId", "in": "path", "schema": { "type": "string" } },
                            { "name": "verbose", "in": "query", "schema": { "type": "boolean" } }
                        ]
                    }
                },
                "/pets": {
                    "post": {
                        "requestBody": {
                            "required": true,
                            "content": { "application/json": { "schema": { "type": "object" } } }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn validate_spec_rejects_unsupported_version_and_missing_paths() {
        assert!(validate_spec(&serde_json::json!({ "openapi": "2.0", "info": {}, "paths": {"/x": {}} })).is_err());
        assert!(validate_spec(&serde_json::json!({ "openapi": "3.0.0", "info": {}, "paths": {} })).is_err());
        assert!(validate_spec(&petstore_spec()).is_ok());
    }

    #[test]
    fn resolves_local_ref_and_detects_cycles() {
        let spec = serde_json::json!({
            "components": { "schemas": { "Pet": { "type": "object" }, "Loop": { "$ref": "#/components/schemas/Loop" } } }
        });
        let resolved = resolve_ref(&spec, "#/components/schemas/Pet").unwrap();
        assert_eq!(resolved["type"], "object");

        let loop_schema = serde_json::json!({ "$ref": "#/components/schemas/Loop" });
        let err = resolve_refs_in_schema(&loop_schema, &spec, &mut HashSet::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn extract_base_url_resolves_relative_server_against_spec_url() {
        let spec = serde_json::json!({ "servers": [{ "url": "/v2" }] });
        let url = extract_base_url(&spec, None, Some("https://api.example.com/openapi.json")).await.unwrap();
        assert_eq!(url, "https://api.example.com/v2");
    }

    #[tokio::test]
    async fn extract_base_url_blocks_ssrf_targets() {
        let spec = serde_json::json!({ "servers": [{ "url": "http://169.254.169.254/" }] });
        let err = extract_base_url(&spec, None, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::SsrfBlocked { .. }));
    }

    #[test]
    fn extract_operations_generates_stable_id_when_missing() {
        let ops = extract_operations(&petstore_spec(), None, None).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().any(|o| o.operation_id == "getPet"));
        assert!(ops.iter().any(|o| o.operation_id == "post_pets"));
    }

    #[test]
    fn extract_operations_caps_at_200() {
        let mut paths = serde_json::Map::new();
        for i in 0..201 {
            paths.insert(format!("/x{i}"), serde_json::json!({ "get": { "operationId": format!("op{i}") } }));
        }
        let spec = serde_json::json!({ "paths": paths });
        assert!(extract_operations(&spec, None, None).is_err());
    }

    #[test]
    fn extract_parameters_skips_header_and_cookie_params() {
        let operation = serde_json::json!({
            "parameters": [
                { "name": "petId", "in": "path", "schema": { "type": "string" } },
                { "name": "X-Trace", "in": "header", "schema": { "type": "string" } }
            ]
        });
        let params = extract_parameters(&operation, &Value::Null);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "petId");
        assert!(params[0].required);
    }

    #[test]
    fn extract_request_body_requires_json_content() {
        let with_json = serde_json::json!({ "requestBody": { "content": { "application/json": {} } } });
        assert!(extract_request_body(&with_json).is_some());

        let xml_only = serde_json::json!({ "requestBody": { "content": { "application/xml": {} } } });
        assert!(extract_request_body(&xml_only).is_none());
    }

    #[test]
    fn deduplicate_appends_numeric_suffix_on_collision() {
        let ops = vec![
            OpenApiOperation { method: "GET".into(), path: "/a".into(), operation: Value::Null, operation_id: "x".into() },
            OpenApiOperation { method: "GET".into(), path: "/b".into(), operation: Value::Null, operation_id: "x".into() },
        ];
        let deduped = deduplicate_operation_ids(ops);
        assert_eq!(deduped[0].operation_id, "x");
        assert_eq!(deduped[1].operation_id, "x_2");
    }

    #[test]
    fn build_auth_headers_resolves_env_indirection_for_bearer() {
        std::env::set_var("TEST_OPENAPI_TOKEN", "secret123");
        let config = OpenApiAuthConfig { token: Some("$TEST_OPENAPI_TOKEN".to_string()), ..Default::default() };
        let headers = build_auth_headers("bearer", &config);
        assert_eq!(headers.get("Authorization"), Some(&"Bearer secret123".to_string()));
        std::env::remove_var("TEST_OPENAPI_TOKEN");
    }

    #[tokio::test]
    async fn loader_rejects_host_outside_allowlist() {
        let spec = serde_json::json!({
            "openapi": "3.0.0",
            "info": {},
            "servers": [{ "url": "https://evil.example.net" }],
            "paths": { "/x": { "get": { "operationId": "x" } } }
        });
        let config = OpenApiToolConfig {
            enabled: true,
            spec_url: None,
            spec_inline: None,
            auth_type: "none".to_string(),
            auth_config: OpenApiAuthConfig::default(),
            category: "api".to_string(),
            base_cost_per_use: 0.001,
            operations: None,
            tags: None,
            base_url: None,
            rate_limit: 30,
            timeout_seconds: 30.0,
            max_response_bytes: 1024,
        };
        let err = OpenApiLoader::new("evil".to_string(), spec, config, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::DomainBlocked { .. }));
    }
}
