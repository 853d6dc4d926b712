//! `web_subpage_fetch` built-in tool.
//!
//! Grounded on `original_source/.../llm_service/tools/web_subpage_fetch.py`'s relevance-scoring
//! contract. The original delegates page discovery to the Firecrawl `/map` endpoint; no
//! Firecrawl client exists in this crate's dependency stack (see DESIGN.md), so link discovery
//! here is done by extracting `<a href>` targets from the base page itself via
//! [`crate::tools::builtin::web_fetch`]'s fetch path, then scoring and fetching the top matches
//! concurrently, capped the same way.

use std::collections::HashSet;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;

use crate::error::GatewayError;
use crate::tools::net::check_ssrf_blocked;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

const DEFAULT_CONCURRENCY: usize = 3;
const HIGH_VALUE_PATHS: &[&str] = &["blog", "news", "press", "about", "docs", "faq"];
const ERROR_PHRASES: &[&str] = &["404 not found", "page not found", "access denied", "403 forbidden"];
const ERROR_PAGE_MAX_LEN: usize = 200;

fn synonyms(keyword: &str) -> Vec<String> {
    let mut out = vec![keyword.to_string()];
    match keyword.to_ascii_lowercase().as_str() {
        "pricing" => out.push("cost".to_string()),
        "team" => out.push("staff".to_string()),
        "contact" => out.push("support".to_string()),
        _ => {}
    }
    out
}

fn looks_like_error_page(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    if ERROR_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    text.trim().chars().count() < ERROR_PAGE_MAX_LEN && ERROR_PHRASES.iter().any(|p| lower.contains(&p[..p.len().min(5)]))
}

fn extract_links(base_url: &str, html: &str) -> Vec<String> {
    let re = regex::Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cap in re.captures_iter(html) {
        let href = &cap[1];
        let resolved = if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if let Some(host_end) = base_url.find("://").map(|i| i + 3) {
            let scheme_host = base_url[..host_end]
                .to_string()
                + base_url[host_end..].split('/').next().unwrap_or("");
            if href.starts_with('/') {
                format!("{scheme_host}{href}")
            } else {
                continue;
            }
        } else {
            continue;
        };
        if seen.insert(resolved.clone()) {
            out.push(resolved);
        }
    }
    out
}

fn score_link(url: &str, keywords: &[String]) -> f64 {
    let lower = url.to_ascii_lowercase();
    let mut score = 0.0;
    for kw in keywords {
        for syn in synonyms(kw) {
            if lower.contains(&syn.to_ascii_lowercase()) {
                score += 2.0;
            }
        }
    }
    if HIGH_VALUE_PATHS.iter().any(|p| lower.contains(p)) {
        score += 1.0;
    }
    let depth = url.matches('/').count() as f64;
    score - depth * 0.1
}

pub struct WebSubpageFetchTool {
    metadata: ToolMetadata,
    client: reqwest::Client,
}

impl WebSubpageFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            metadata: ToolMetadata {
                name: "web_subpage_fetch".to_string(),
                description: "Crawl a site's linked subpages and return the ones most relevant to given keywords.".to_string(),
                parameters: vec![
                    ToolParameter::new("url", ParamType::String, "base URL to crawl from").required(),
                    ToolParameter::new("keywords", ParamType::Array, "keywords used for relevance scoring"),
                    ToolParameter::new("max_pages", ParamType::Integer, "maximum subpages to fetch").with_default(serde_json::json!(5)).with_range(1.0, 20.0),
                ],
                category: "web".to_string(),
                dangerous: false,
                rate_limit: None,
                session_aware: false,
            },
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, GatewayError> {
        let host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .and_then(|r| r.split('/').next())
            .ok_or_else(|| GatewayError::ToolValidation("could not parse host from url".to_string()))?;
        check_ssrf_blocked(host).await?;
        let response = self.client.get(url).send().await.map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
        response.text().await.map_err(|e| GatewayError::ToolExecution(e.to_string()))
    }
}

impl Default for WebSubpageFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSubpageFetchTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        let url = params["url"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'url'".to_string()))?;
        let keywords: Vec<String> = params["keywords"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let max_pages = params["max_pages"].as_u64().unwrap_or(5) as usize;

        let base_text = self.fetch_text(url).await?;
        if looks_like_error_page(&base_text) {
            return Ok(serde_json::json!({ "pages": [], "error_page_detected": true }));
        }

        let mut links = extract_links(url, &base_text);
        links.sort_by(|a, b| score_link(b, &keywords).partial_cmp(&score_link(a, &keywords)).unwrap_or(std::cmp::Ordering::Equal));
        links.truncate(max_pages);

        let mut pages = Vec::new();
        for batch in links.chunks(DEFAULT_CONCURRENCY) {
            let fetches = batch.iter().map(|link| async move {
                let text = self.fetch_text(link).await.ok()?;
                Some(serde_json::json!({
                    "url": link,
                    "relevance": score_link(link, &keywords),
                    "char_count": text.chars().count(),
                }))
            });
            pages.extend(join_all(fetches).await.into_iter().flatten());
        }

        Ok(serde_json::json!({ "pages": pages, "error_page_detected": false }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_high_value_paths_and_keyword_matches_higher() {
        let keywords = vec!["pricing".to_string()];
        let plain = score_link("https://example.com/about", &keywords);
        let relevant = score_link("https://example.com/pricing", &keywords);
        assert!(relevant > plain);
    }

    #[test]
    fn detects_short_error_pages() {
        assert!(looks_like_error_page("404 Not Found"));
        assert!(!looks_like_error_page(&"Welcome to our site. ".repeat(20)));
    }

    #[test]
    fn extracts_absolute_and_relative_links() {
        let html = r#"<a href="https://example.com/blog">Blog</a><a href="/pricing">Pricing</a>"#;
        let links = extract_links("https://example.com", html);
        assert!(links.contains(&"https://example.com/blog".to_string()));
        assert!(links.contains(&"https://example.com/pricing".to_string()));
    }
}
