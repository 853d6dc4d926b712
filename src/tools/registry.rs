//! `ToolRegistry`: name-keyed tool catalog plus task-type filtering (§4.7 supplement).
//!
//! Grounded on `original_source/.../llm_service/tools/registry.py`: singleton-per-name
//! instances, a category index, and the `TASK_CATEGORY_MAP`/`TASK_CORE_TOOLS` tables behind
//! `filter_tools_by_task_type`. The distilled spec only gestures at "agents can discover and
//! invoke tools"; this filtering stage is supplemented here because it is load-bearing for the
//! stated "choice paralysis" goal and fully specified in the original.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::GatewayError;
use crate::tools::{execute, schema_for, RateGate, SessionContext, Tool, ToolMetadata, ToolResult};

/// Coarse task types `/tools/select` and `filter_tools_by_task_type` route on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Research,
    Coding,
    Analysis,
    Browser,
    File,
    General,
}

impl TaskType {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "research" => TaskType::Research,
            "coding" => TaskType::Coding,
            "analysis" => TaskType::Analysis,
            "browser" => TaskType::Browser,
            "file" => TaskType::File,
            _ => TaskType::General,
        }
    }
}

/// `task_type -> allowed categories`.
fn category_map(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        TaskType::Research => &["web", "search"],
        TaskType::Coding => &["code", "file", "shell"],
        TaskType::Analysis => &["math", "data"],
        TaskType::Browser => &["web"],
        TaskType::File => &["file"],
        TaskType::General => &["general", "web", "math", "file", "code", "shell", "search", "data"],
    }
}

/// `task_type -> tools always included first, in this order`.
fn core_tools(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        TaskType::Research => &["web_search"],
        TaskType::Coding => &["bash", "file_read"],
        TaskType::Analysis => &["calculator"],
        TaskType::Browser => &["web_fetch"],
        TaskType::File => &["file_read", "file_list"],
        TaskType::General => &[],
    }
}

/// Name-keyed catalog of singleton tool instances (§4.7 "Registration"). Construction is
/// lazy-once per process, not per call.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    gate: RateGate,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            gate: RateGate::new(),
        }
    }

    /// Register a tool by name; `override_existing=false` rejects a name collision (§4.7
    /// "Registration is name-unique; `override=true` replaces").
    pub fn register(&mut self, tool: Arc<dyn Tool>, override_existing: bool) -> Result<(), GatewayError> {
        let name = tool.metadata().name.clone();
        if self.tools.contains_key(&name) && !override_existing {
            return Err(GatewayError::Config(format!("tool '{name}' is already registered")));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&ToolMetadata> {
        self.tools.values().map(|t| t.metadata()).collect()
    }

    pub fn schema(&self, name: &str) -> Option<Value> {
        self.tools.get(name).map(|t| schema_for(t.metadata()))
    }

    pub async fn execute(&self, name: &str, params: Value, ctx: &SessionContext) -> Result<ToolResult, GatewayError> {
        let tool = self.get(name).ok_or_else(|| GatewayError::ToolExecution(format!("no such tool '{name}'")))?;
        Ok(execute(tool.as_ref(), params, ctx, &self.gate).await)
    }

    /// Trim the catalog for a task type: core tools first (declared order), then other
    /// category-matching tools, then (if still under the cap) any remaining non-dangerous tool.
    /// Capped at `max_tools` (§4.7 "Task-type tool filtering").
    pub fn filter_by_task_type(&self, task_type: TaskType, max_tools: usize) -> Vec<&ToolMetadata> {
        let categories = category_map(task_type);
        let core = core_tools(task_type);
        let mut selected: Vec<&ToolMetadata> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for name in core {
            if let Some(tool) = self.tools.get(*name) {
                if seen.insert(tool.metadata().name.clone()) {
                    selected.push(tool.metadata());
                }
            }
            if selected.len() >= max_tools {
                return selected;
            }
        }

        for tool in self.tools.values() {
            if selected.len() >= max_tools {
                break;
            }
            let meta = tool.metadata();
            if seen.contains(&meta.name) {
                continue;
            }
            if categories.contains(&meta.category.as_str()) {
                seen.insert(meta.name.clone());
                selected.push(meta);
            }
        }

        for tool in self.tools.values() {
            if selected.len() >= max_tools {
                break;
            }
            let meta = tool.metadata();
            if seen.contains(&meta.name) || meta.dangerous {
                continue;
            }
            seen.insert(meta.name.clone());
            selected.push(meta);
        }

        selected
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ParamType, ToolParameter};
    use async_trait::async_trait;

    struct StubTool(ToolMetadata);

    #[async_trait]
    impl Tool for StubTool {
        fn metadata(&self) -> &ToolMetadata {
            &self.0
        }
        async fn call(&self, _params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
            Ok(Value::Null)
        }
    }

    fn stub(name: &str, category: &str, dangerous: bool) -> Arc<dyn Tool> {
        Arc::new(StubTool(ToolMetadata {
            name: name.to_string(),
            description: "stub".to_string(),
            parameters: vec![ToolParameter::new("x", ParamType::String, "x")],
            category: category.to_string(),
            dangerous,
            rate_limit: None,
            session_aware: false,
        }))
    }

    #[test]
    fn duplicate_registration_without_override_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(stub("calculator", "math", false), false).unwrap();
        let err = registry.register(stub("calculator", "math", false), false).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(registry.register(stub("calculator", "math", false), true).is_ok());
    }

    #[test]
    fn filter_by_task_type_prioritises_core_tools_then_caps() {
        let mut registry = ToolRegistry::new();
        registry.register(stub("calculator", "math", false), false).unwrap();
        registry.register(stub("web_search", "web", false), false).unwrap();
        registry.register(stub("bash", "shell", true), false).unwrap();
        registry.register(stub("file_read", "file", false), false).unwrap();

        let filtered = registry.filter_by_task_type(TaskType::Analysis, 2);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].name, "calculator");
    }

    #[test]
    fn general_task_type_excludes_dangerous_tools_in_fill_pass() {
        let mut registry = ToolRegistry::new();
        registry.register(stub("calculator", "math", false), false).unwrap();
        registry.register(stub("bash", "shell", true), false).unwrap();
        let filtered = registry.filter_by_task_type(TaskType::General, 5);
        assert!(filtered.iter().all(|m| m.name != "bash"));
    }
}
