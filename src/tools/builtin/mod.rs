//! Built-in tool contracts.
//!
//! Each submodule owns one tool's [`crate::tools::Tool`] impl; [`register_all`] wires the full
//! set into a fresh [`crate::tools::registry::ToolRegistry`] the way a process composition root
//! would at startup.

pub mod bash;
pub mod calculator;
pub mod filesystem;
pub mod python_executor;
pub mod web_crawl;
pub mod web_fetch;
pub mod web_search;
pub mod web_subpage_fetch;

use std::sync::Arc;

use crate::config::Settings;
use crate::tools::registry::ToolRegistry;

/// Populate `registry` with every built-in tool, rate-limited per `settings` (§4.7's
/// per-category rate limit fields on the settings record).
pub fn register_all(registry: &mut ToolRegistry, settings: &Settings) {
    let _ = registry.register(Arc::new(calculator::CalculatorTool::new(settings)), true);
    let _ = registry.register(Arc::new(filesystem::FileReadTool::new()), true);
    let _ = registry.register(Arc::new(filesystem::FileWriteTool::new()), true);
    let _ = registry.register(Arc::new(filesystem::FileListTool::new()), true);
    let _ = registry.register(Arc::new(bash::BashTool::new()), true);
    let _ = registry.register(Arc::new(web_search::WebSearchTool::new(settings)), true);
    let _ = registry.register(Arc::new(web_fetch::WebFetchTool::new()), true);
    let _ = registry.register(Arc::new(web_subpage_fetch::WebSubpageFetchTool::new()), true);
    let _ = registry.register(Arc::new(web_crawl::WebCrawlTool::new()), true);
    let _ = registry.register(Arc::new(python_executor::PythonExecutorTool::new(settings)), true);
}
