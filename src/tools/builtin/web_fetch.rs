//! `web_fetch` built-in tool.
//!
//! Grounded on `original_source/.../llm_service/tools/web_fetch.py` for the contract, and on
//! [`crate::tools::net`] for the SSRF guard and size-capped body read. Markdown-ish text
//! extraction and the redirect cap are new on top of that.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use serde_json::Value;

use crate::error::GatewayError;
use crate::tools::net::check_ssrf_blocked;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

const MAX_RESPONSE_BYTES: usize = 50 * 1024 * 1024;
const MAX_REDIRECTS: usize = 10;

/// Deprecated parameters kept for backward compatibility: accepted and logged, never branched
/// on (§8 "Deprecated parameters").
const DEPRECATED_PARAMS: &[&str] = &["render_js", "use_cache", "proxy", "timeout_override"];

pub struct WebFetchTool {
    metadata: ToolMetadata,
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            metadata: ToolMetadata {
                name: "web_fetch".to_string(),
                description: "Fetch a single URL and return its text content.".to_string(),
                parameters: vec![
                    ToolParameter::new("url", ParamType::String, "the URL to fetch").required(),
                    ToolParameter::new("render_js", ParamType::Boolean, "deprecated, ignored"),
                    ToolParameter::new("use_cache", ParamType::Boolean, "deprecated, ignored"),
                    ToolParameter::new("proxy", ParamType::String, "deprecated, ignored"),
                    ToolParameter::new("timeout_override", ParamType::Integer, "deprecated, ignored"),
                ],
                category: "web".to_string(),
                dangerous: false,
                rate_limit: None,
                session_aware: false,
            },
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_host(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    Some(rest.split('/').next()?.split(':').next()?.to_string())
}

/// Crude tag-stripping "markdown": drop `<script>`/`<style>` bodies, replace tags with
/// whitespace, collapse runs of blank lines. Good enough for an agent to read prose content
/// without a full HTML-parsing dependency.
fn html_to_text(html: &str) -> String {
    let no_scripts = regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</\1>").unwrap().replace_all(html, "");
    let no_tags = regex::Regex::new(r"(?s)<[^>]+>").unwrap().replace_all(&no_scripts, " ");
    let collapsed = regex::Regex::new(r"[ \t]+").unwrap().replace_all(&no_tags, " ");
    regex::Regex::new(r"\n\s*\n+").unwrap().replace_all(collapsed.trim(), "\n\n").into_owned()
}

fn extract_title(html: &str) -> Option<String> {
    let re = regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok()?;
    re.captures(html).map(|c| c[1].trim().to_string())
}

#[async_trait]
impl Tool for WebFetchTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        let url = params["url"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'url'".to_string()))?;
        for key in DEPRECATED_PARAMS {
            if params.get(*key).is_some() {
                log::warn!("web_fetch: deprecated parameter '{key}' supplied, ignoring");
            }
        }

        let host = extract_host(url).ok_or_else(|| GatewayError::ToolValidation("could not parse host from url".to_string()))?;
        check_ssrf_blocked(&host).await?;

        let response = self
            .client
            .get(url)
            .header("Accept", "text/html, text/plain")
            .send()
            .await
            .map_err(|e| GatewayError::ToolExecution(format!("request failed: {e}")))?;

        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_BYTES {
                return Err(GatewayError::ToolExecution("response exceeds maximum size".to_string()));
            }
        }

        let bytes = response.bytes().await.map_err(|e| GatewayError::ToolExecution(format!("failed to read body: {e}")))?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(GatewayError::ToolExecution("response exceeds maximum size".to_string()));
        }
        let body = String::from_utf8_lossy(&bytes).into_owned();

        let title = extract_title(&body).unwrap_or_default();
        let content = html_to_text(&body);
        let word_count = content.split_whitespace().count();
        let char_count = content.chars().count();

        Ok(serde_json::json!({
            "url": url,
            "title": title,
            "content": content,
            "method": "GET",
            "word_count": word_count,
            "char_count": char_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_collapses_whitespace() {
        let html = "<html><head><title>Hi</title><style>.x{}</style></head><body><p>Hello   world</p></body></html>";
        assert_eq!(extract_title(html), Some("Hi".to_string()));
        let text = html_to_text(html);
        assert!(text.contains("Hello world"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn extracts_host_from_url() {
        assert_eq!(extract_host("https://example.com/a/b"), Some("example.com".to_string()));
        assert_eq!(extract_host("not a url"), None);
    }
}
