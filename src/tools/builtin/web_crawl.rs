//! `web_crawl` built-in tool: Firecrawl async crawl, polling every 2s up to 60 times, merging
//! results with a per-page budget (`max_length`) and a total budget (`max_length * pages`).
//!
//! Grounded on `original_source/.../llm_service/tools/web_crawl.py`'s submit-then-poll contract
//! against the Firecrawl REST API.

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, Duration};

use crate::error::GatewayError;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

const FIRECRAWL_BASE: &str = "https://api.firecrawl.dev/v1";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 60;

pub struct WebCrawlTool {
    metadata: ToolMetadata,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl WebCrawlTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: std::env::var("FIRECRAWL_API_KEY").ok(),
            metadata: ToolMetadata {
                name: "web_crawl".to_string(),
                description: "Crawl a site (via Firecrawl) and return merged, length-budgeted page content.".to_string(),
                parameters: vec![
                    ToolParameter::new("url", ParamType::String, "site URL to crawl").required(),
                    ToolParameter::new("pages", ParamType::Integer, "maximum pages to crawl").with_default(serde_json::json!(5)).with_range(1.0, 50.0),
                    ToolParameter::new("max_length", ParamType::Integer, "per-page character budget").with_default(serde_json::json!(5000)).with_range(100.0, 50000.0),
                ],
                category: "web".to_string(),
                dangerous: false,
                rate_limit: None,
                session_aware: false,
            },
        }
    }
}

impl Default for WebCrawlTool {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[async_trait]
impl Tool for WebCrawlTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        let url = params["url"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'url'".to_string()))?;
        let pages = params["pages"].as_u64().unwrap_or(5) as usize;
        let max_length = params["max_length"].as_u64().unwrap_or(5000) as usize;
        let total_budget = max_length.saturating_mul(pages);

        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| GatewayError::ToolExecution("FIRECRAWL_API_KEY is not configured".to_string()))?;

        let submit: Value = self
            .client
            .post(format!("{FIRECRAWL_BASE}/crawl"))
            .bearer_auth(api_key)
            .json(&serde_json::json!({ "url": url, "limit": pages }))
            .send()
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("crawl submission failed: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("invalid crawl submission response: {e}")))?;

        let job_id = submit["id"].as_str().ok_or_else(|| GatewayError::ToolExecution("crawl submission did not return a job id".to_string()))?;

        let mut status_body = Value::Null;
        for _ in 0..MAX_POLLS {
            status_body = self
                .client
                .get(format!("{FIRECRAWL_BASE}/crawl/{job_id}"))
                .bearer_auth(api_key)
                .send()
                .await
                .map_err(|e| GatewayError::ToolExecution(format!("crawl poll failed: {e}")))?
                .json()
                .await
                .map_err(|e| GatewayError::ToolExecution(format!("invalid crawl poll response: {e}")))?;

            match status_body["status"].as_str() {
                Some("completed") => break,
                Some("failed") => return Err(GatewayError::ToolExecution("crawl job failed".to_string())),
                _ => sleep(POLL_INTERVAL).await,
            }
        }

        if status_body["status"].as_str() != Some("completed") {
            return Err(GatewayError::ToolExecution("crawl job did not complete within the polling budget".to_string()));
        }

        let mut used = 0usize;
        let mut merged = Vec::new();
        for page in status_body["data"].as_array().cloned().unwrap_or_default() {
            if used >= total_budget {
                break;
            }
            let content = page["markdown"].as_str().unwrap_or_default();
            let remaining = total_budget - used;
            let trimmed = truncate_chars(content, max_length.min(remaining));
            used += trimmed.chars().count();
            merged.push(serde_json::json!({
                "url": page.get("url").cloned().unwrap_or(Value::Null),
                "content": trimmed,
            }));
        }

        Ok(serde_json::json!({ "pages": merged, "total_chars": used }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_budget() {
        assert_eq!(truncate_chars("hello world", 5), "hello");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
