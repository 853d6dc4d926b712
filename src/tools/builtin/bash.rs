//! `bash` built-in tool.
//!
//! Runs `argv[0]` directly via [`tokio::process::Command`] with `shell=False` rather than handing
//! a single string to `/bin/bash -c` — no shell ever parses the arguments, so shell metacharacters
//! cannot cause reinterpretation. `argv[0]` must be in a hard-coded allowlist; any argument
//! containing a shell metacharacter is rejected outright rather than escaped.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

const ALLOWED_COMMANDS: &[&str] = &["ls", "cat", "grep", "find", "wc", "head", "tail", "echo", "pwd", "sort", "uniq", "diff"];
const SHELL_METACHARACTERS: &[char] = &['|', '&', ';', '$', '>', '<', '`', '\\', '\n', '(', ')', '{', '}', '*', '?', '~', '\''];
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const INHERITED_ENV_VARS: &[&str] = &["PATH", "LANG", "LC_ALL", "HOME"];

pub struct BashTool {
    metadata: ToolMetadata,
}

impl BashTool {
    pub fn new() -> Self {
        Self {
            metadata: ToolMetadata {
                name: "bash".to_string(),
                description: format!(
                    "Execute one allowlisted command with its arguments, no shell involved. \
                    Allowed commands: {}.",
                    ALLOWED_COMMANDS.join(", ")
                ),
                parameters: vec![ToolParameter::new(
                    "argv",
                    ParamType::Array,
                    "the command and its arguments, e.g. ['ls', '-la', '.']",
                )
                .required()],
                category: "shell".to_string(),
                dangerous: true,
                rate_limit: None,
                session_aware: true,
            },
        }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_argv(argv: &[String]) -> Result<(), GatewayError> {
    let program = argv.first().ok_or_else(|| GatewayError::ToolValidation("argv must not be empty".to_string()))?;
    if !ALLOWED_COMMANDS.contains(&program.as_str()) {
        return Err(GatewayError::ToolValidation(format!("command '{program}' is not in the allowlist")));
    }
    for arg in argv {
        if arg.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
            return Err(GatewayError::ToolValidation(format!("argument '{arg}' contains a disallowed shell metacharacter")));
        }
    }
    Ok(())
}

#[async_trait]
impl Tool for BashTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, ctx: &SessionContext) -> Result<Value, GatewayError> {
        let argv: Vec<String> = params["argv"]
            .as_array()
            .ok_or_else(|| GatewayError::ToolValidation("'argv' must be an array".to_string()))?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()
            .ok_or_else(|| GatewayError::ToolValidation("'argv' entries must be strings".to_string()))?;
        validate_argv(&argv)?;

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.env_clear();
        for key in INHERITED_ENV_VARS {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        if let Some(workspace) = &ctx.workspace_dir {
            command.current_dir(workspace);
        }

        let output = tokio::time::timeout(EXEC_TIMEOUT, command.output())
            .await
            .map_err(|_| GatewayError::ToolExecution(format!("command timed out after {EXEC_TIMEOUT:?}")))?
            .map_err(|e| GatewayError::ToolExecution(format!("failed to spawn command: {e}")))?;

        Ok(serde_json::json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exit_code": output.status.code().unwrap_or(-1),
            "success": output.status.success(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_allowlisted_command() {
        let err = validate_argv(&["rm".to_string(), "-rf".to_string(), "/".to_string()]).unwrap_err();
        assert!(matches!(err, GatewayError::ToolValidation(_)));
    }

    #[test]
    fn rejects_shell_metacharacters_in_arguments() {
        let err = validate_argv(&["echo".to_string(), "a; rm -rf /".to_string()]).unwrap_err();
        assert!(matches!(err, GatewayError::ToolValidation(_)));
    }

    #[test]
    fn accepts_allowlisted_clean_argv() {
        assert!(validate_argv(&["ls".to_string(), "-la".to_string(), ".".to_string()]).is_ok());
    }

    #[tokio::test]
    async fn executes_allowlisted_command() {
        let tool = BashTool::new();
        let params = serde_json::json!({ "argv": ["echo", "hello"] });
        let result = tool.call(params, &SessionContext::default()).await.unwrap();
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "hello");
        assert!(result["success"].as_bool().unwrap());
    }
}
