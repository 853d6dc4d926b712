//! `web_search` built-in tool.
//!
//! Grounded on `original_source/.../llm_service/tools/web_search.py`'s provider-delegation
//! contract and on [`crate::tools::builtin::web_fetch`] for the outbound-call idiom. Only Exa
//! is wired here (its API is a single JSON POST); Firecrawl search is left as a documented
//! follow-up once a Firecrawl-specific response shape is needed (see DESIGN.md).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

const EXA_SEARCH_URL: &str = "https://api.exa.ai/search";

pub struct WebSearchTool {
    metadata: ToolMetadata,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl WebSearchTool {
    pub fn new(settings: &crate::config::Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: std::env::var("EXA_API_KEY").ok(),
            metadata: ToolMetadata {
                name: "web_search".to_string(),
                description: "Search the web and return a ranked list of results.".to_string(),
                parameters: vec![
                    ToolParameter::new("query", ParamType::String, "search query").required(),
                    ToolParameter::new("num_results", ParamType::Integer, "maximum results to return")
                        .with_default(serde_json::json!(10))
                        .with_range(1.0, 25.0),
                ],
                category: "web".to_string(),
                dangerous: false,
                rate_limit: Some(settings.web_search_rate_limit),
                session_aware: false,
            },
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        let query = params["query"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'query'".to_string()))?;
        let num_results = params["num_results"].as_u64().unwrap_or(10);

        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| GatewayError::ToolExecution("EXA_API_KEY is not configured".to_string()))?;

        let response = self
            .client
            .post(EXA_SEARCH_URL)
            .header("x-api-key", api_key)
            .json(&serde_json::json!({ "query": query, "numResults": num_results, "contents": { "text": true } }))
            .send()
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("search request failed: {e}")))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| GatewayError::ToolExecution(format!("invalid search response: {e}")))?;
        if !status.is_success() {
            return Err(GatewayError::ToolExecution(format!("search provider returned {status}")));
        }

        let results: Vec<Value> = body["results"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|r| {
                serde_json::json!({
                    "title": r.get("title").cloned().unwrap_or(Value::Null),
                    "snippet": r.get("text").cloned().unwrap_or(Value::Null),
                    "url": r.get("url").cloned().unwrap_or(Value::Null),
                    "source": "exa",
                })
            })
            .collect();

        Ok(serde_json::json!({ "results": results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_api_key_is_a_tool_execution_error() {
        let mut tool = WebSearchTool::new(&crate::config::Settings::default());
        tool.api_key = None;
        let err = tool
            .call(serde_json::json!({ "query": "rust async" }), &SessionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolExecution(_)));
    }
}
