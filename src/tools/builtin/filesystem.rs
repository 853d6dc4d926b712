//! `file_read` / `file_write` / `file_list` built-in tools.
//!
//! All three share [`ScopedFs`], a canonicalisation-based path-traversal guard rooted at the
//! caller's session workspace directory (§4.7 step 4 "session-aware tools") rather than a
//! tool-construction-time fixed path, since every session gets its own sandbox. Relative paths
//! are the only form accepted; `..` components are resolved before the result is checked against
//! the workspace root, including symlink escapes through not-yet-existing ancestors.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

/// A directory entry as returned by `file_list`.
struct DirEntry {
    name: String,
    is_directory: bool,
    size: u64,
}

/// Path-restricted file operations rooted at `root`. Every method rejects paths that would
/// resolve outside of it, including via symlinks.
struct ScopedFs {
    root: PathBuf,
}

impl ScopedFs {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve `path` (workspace-relative) against the root, rejecting absolute paths and any
    /// resolution that escapes it.
    fn validate_path(&self, path: &str) -> Result<PathBuf, GatewayError> {
        let path_buf = PathBuf::from(path);
        if path_buf.is_absolute() {
            return Err(GatewayError::ToolValidation("absolute paths are not allowed".to_string()));
        }

        let mut normalized = PathBuf::new();
        for component in path_buf.components() {
            use std::path::Component;
            match component {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::Normal(c) => normalized.push(c),
                Component::CurDir => {}
                _ => {}
            }
        }

        let effective_path = self.root.join(&normalized);

        let root_canonical = self
            .root
            .canonicalize()
            .map_err(|e| GatewayError::ToolExecution(format!("cannot canonicalize workspace root: {e}")))?;

        let canonical_to_check = if effective_path.exists() {
            effective_path
                .canonicalize()
                .map_err(|e| GatewayError::ToolExecution(format!("cannot canonicalize path: {e}")))?
        } else {
            let parent = effective_path
                .parent()
                .ok_or_else(|| GatewayError::ToolValidation("path has no parent".to_string()))?;
            let canonical_parent = canonicalize_nearest_ancestor(parent)?;
            let suffix = effective_path.strip_prefix(parent).unwrap_or(&effective_path);
            canonical_parent.join(suffix)
        };

        if !canonical_to_check.starts_with(&root_canonical) {
            return Err(GatewayError::ToolValidation(format!("path escapes workspace root: {path}")));
        }
        Ok(effective_path)
    }

    async fn read_file(&self, path: &str) -> Result<String, GatewayError> {
        let safe_path = self.validate_path(path)?;
        if !safe_path.exists() {
            return Err(GatewayError::ToolExecution(format!("file not found: {path}")));
        }
        if safe_path.is_dir() {
            return Err(GatewayError::ToolExecution(format!("is a directory: {path}")));
        }
        fs::read_to_string(&safe_path).map_err(|e| GatewayError::ToolExecution(e.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str, append: bool) -> Result<(), GatewayError> {
        let safe_path = self.validate_path(path)?;
        if safe_path.exists() && safe_path.is_dir() {
            return Err(GatewayError::ToolExecution(format!("is a directory: {path}")));
        }
        if let Some(parent) = safe_path.parent() {
            fs::create_dir_all(parent).map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
        }
        if append {
            use std::io::Write;
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&safe_path)
                .map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
            file.write_all(content.as_bytes()).map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
        } else {
            fs::write(&safe_path, content).map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
        }
        Ok(())
    }

    async fn read_directory(&self, path: &str, recursive: bool) -> Result<Vec<DirEntry>, GatewayError> {
        let safe_path = self.validate_path(path)?;
        if !safe_path.exists() {
            return Err(GatewayError::ToolExecution(format!("directory not found: {path}")));
        }
        if !safe_path.is_dir() {
            return Err(GatewayError::ToolExecution(format!("not a directory: {path}")));
        }
        let mut entries = Vec::new();
        if recursive {
            self.read_directory_recursive(&safe_path, &mut entries)?;
        } else {
            for entry in fs::read_dir(&safe_path).map_err(|e| GatewayError::ToolExecution(e.to_string()))? {
                let entry = entry.map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
                let metadata = entry.metadata().map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().to_string(),
                    is_directory: metadata.is_dir(),
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                });
            }
        }
        Ok(entries)
    }

    fn read_directory_recursive(&self, path: &Path, entries: &mut Vec<DirEntry>) -> Result<(), GatewayError> {
        for entry in fs::read_dir(path).map_err(|e| GatewayError::ToolExecution(e.to_string()))? {
            let entry = entry.map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
            let metadata = entry.metadata().map_err(|e| GatewayError::ToolExecution(e.to_string()))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_directory: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
            if metadata.is_dir() {
                // A symlink inside the tree could point outside the root; re-validate before
                // descending rather than trusting the directory walk.
                if let Ok(root_canonical) = self.root.canonicalize() {
                    match entry.path().canonicalize() {
                        Ok(canonical) if !canonical.starts_with(&root_canonical) => continue,
                        Err(_) => continue,
                        Ok(_) => {}
                    }
                }
                self.read_directory_recursive(&entry.path(), entries)?;
            }
        }
        Ok(())
    }
}

fn canonicalize_nearest_ancestor(start: &Path) -> Result<PathBuf, GatewayError> {
    let mut ancestor = start;
    loop {
        if ancestor.exists() {
            return ancestor.canonicalize().map_err(|e| GatewayError::ToolExecution(format!("cannot canonicalize ancestor: {e}")));
        }
        ancestor = ancestor
            .parent()
            .ok_or_else(|| GatewayError::ToolValidation("no existing ancestor found".to_string()))?;
    }
}

fn scoped(ctx: &SessionContext) -> Result<ScopedFs, GatewayError> {
    let root = ctx
        .workspace_dir
        .as_ref()
        .ok_or_else(|| GatewayError::ToolExecution("no workspace directory bound to this session".to_string()))?;
    Ok(ScopedFs::new(PathBuf::from(root)))
}

pub struct FileReadTool {
    metadata: ToolMetadata,
}

impl FileReadTool {
    pub fn new() -> Self {
        Self {
            metadata: ToolMetadata {
                name: "file_read".to_string(),
                description: "Read a text file from the session workspace.".to_string(),
                parameters: vec![ToolParameter::new("path", ParamType::String, "workspace-relative path").required()],
                category: "file".to_string(),
                dangerous: false,
                rate_limit: None,
                session_aware: true,
            },
        }
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, ctx: &SessionContext) -> Result<Value, GatewayError> {
        let path = params["path"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'path'".to_string()))?;
        let fs = scoped(ctx)?;
        let content = fs.read_file(path).await?;
        Ok(serde_json::json!({ "content": content }))
    }
}

pub struct FileWriteTool {
    metadata: ToolMetadata,
}

impl FileWriteTool {
    pub fn new() -> Self {
        Self {
            metadata: ToolMetadata {
                name: "file_write".to_string(),
                description: "Write (overwriting) a text file in the session workspace.".to_string(),
                parameters: vec![
                    ToolParameter::new("path", ParamType::String, "workspace-relative path").required(),
                    ToolParameter::new("content", ParamType::String, "file content").required(),
                    ToolParameter::new("append", ParamType::Boolean, "append instead of overwrite").with_default(Value::Bool(false)),
                ],
                category: "file".to_string(),
                dangerous: true,
                rate_limit: None,
                session_aware: true,
            },
        }
    }
}

impl Default for FileWriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, ctx: &SessionContext) -> Result<Value, GatewayError> {
        let path = params["path"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'path'".to_string()))?;
        let content = params["content"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'content'".to_string()))?;
        let append = params["append"].as_bool().unwrap_or(false);
        let fs = scoped(ctx)?;
        fs.write_file(path, content, append).await?;
        Ok(serde_json::json!({ "bytes_written": content.len() }))
    }
}

pub struct FileListTool {
    metadata: ToolMetadata,
}

impl FileListTool {
    pub fn new() -> Self {
        Self {
            metadata: ToolMetadata {
                name: "file_list".to_string(),
                description: "List files and directories under a session workspace path.".to_string(),
                parameters: vec![
                    ToolParameter::new("path", ParamType::String, "workspace-relative directory").with_default(Value::String(".".to_string())),
                    ToolParameter::new("recursive", ParamType::Boolean, "recurse into subdirectories").with_default(Value::Bool(false)),
                ],
                category: "file".to_string(),
                dangerous: false,
                rate_limit: None,
                session_aware: true,
            },
        }
    }
}

impl Default for FileListTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileListTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, ctx: &SessionContext) -> Result<Value, GatewayError> {
        let path = params["path"].as_str().unwrap_or(".");
        let recursive = params["recursive"].as_bool().unwrap_or(false);
        let fs = scoped(ctx)?;
        let entries = fs.read_directory(path, recursive).await?;
        let out: Vec<Value> = entries
            .into_iter()
            .map(|e| serde_json::json!({ "name": e.name, "is_directory": e.is_directory, "size": e.size }))
            .collect();
        Ok(serde_json::json!({ "entries": out }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(workspace: &std::path::Path) -> SessionContext {
        SessionContext {
            session_id: Some("s1".to_string()),
            workspace_dir: Some(workspace.to_string_lossy().to_string()),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx(dir.path());
        let write = FileWriteTool::new();
        write
            .call(serde_json::json!({ "path": "a.txt", "content": "hi", "append": false }), &ctx)
            .await
            .unwrap();
        let read = FileReadTool::new();
        let result = read.call(serde_json::json!({ "path": "a.txt" }), &ctx).await.unwrap();
        assert_eq!(result["content"], "hi");
    }

    #[tokio::test]
    async fn append_adds_to_existing_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx(dir.path());
        let write = FileWriteTool::new();
        write.call(serde_json::json!({ "path": "a.txt", "content": "hello", "append": false }), &ctx).await.unwrap();
        write.call(serde_json::json!({ "path": "a.txt", "content": " world", "append": true }), &ctx).await.unwrap();
        let read = FileReadTool::new();
        let result = read.call(serde_json::json!({ "path": "a.txt" }), &ctx).await.unwrap();
        assert_eq!(result["content"], "hello world");
    }

    #[tokio::test]
    async fn lists_directory_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx(dir.path());
        let write = FileWriteTool::new();
        write.call(serde_json::json!({ "path": "a.txt", "content": "x", "append": false }), &ctx).await.unwrap();
        write.call(serde_json::json!({ "path": "b.txt", "content": "y", "append": false }), &ctx).await.unwrap();
        let list = FileListTool::new();
        let result = list.call(serde_json::json!({}), &ctx).await.unwrap();
        assert_eq!(result["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx(dir.path());
        let read = FileReadTool::new();
        let err = read.call(serde_json::json!({ "path": "../../../etc/passwd" }), &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolValidation(_) | GatewayError::ToolExecution(_)));
    }

    #[tokio::test]
    async fn rejects_absolute_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ctx(dir.path());
        let read = FileReadTool::new();
        let err = read.call(serde_json::json!({ "path": "/etc/passwd" }), &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn read_without_workspace_fails() {
        let read = FileReadTool::new();
        let err = read.call(serde_json::json!({ "path": "a.txt" }), &SessionContext::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolExecution(_)));
    }
}
