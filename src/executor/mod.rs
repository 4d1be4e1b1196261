//! Tool executor — the only component that touches the outside world.
//!
//! Dispatches `(tool, action, params)` to the git/shell/file/sqlite
//! backends. The executor never prompts; callers obtain a [`Decision`]
//! from the permission gate and pass it in.

pub mod file;
pub mod git;
pub mod shell;
pub mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{kind_of, ErrorKind};
use crate::permission::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Git,
    Shell,
    File,
    Sqlite,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Git => write!(f, "git"),
            ToolKind::Shell => write!(f, "shell"),
            ToolKind::File => write!(f, "file"),
            ToolKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Declared side-effect class per `(tool, action)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    Read,
    Write,
    Network,
    Destructive,
}

impl SideEffect {
    pub fn needs_permission(&self) -> bool {
        !matches!(self, SideEffect::Read)
    }
}

/// The static action table. `None` means the action does not exist for
/// that tool (`UnknownAction`, never a silent fallback).
pub fn side_effect(tool: ToolKind, action: &str) -> Option<SideEffect> {
    use SideEffect::*;
    let effect = match (tool, action) {
        (ToolKind::Git, "status") | (ToolKind::Git, "log") | (ToolKind::Git, "diff") => Read,
        (ToolKind::Git, "add") | (ToolKind::Git, "commit") | (ToolKind::Git, "init") => Write,
        (ToolKind::Git, "pull") | (ToolKind::Git, "clone") => Network,
        (ToolKind::Git, "push") => Destructive,
        (ToolKind::Shell, "run") => Write,
        (ToolKind::Shell, "mkdir") => Write,
        (ToolKind::File, "read") | (ToolKind::File, "list") => Read,
        (ToolKind::File, "write") => Write,
        (ToolKind::File, "delete") => Destructive,
        (ToolKind::Sqlite, "schema") | (ToolKind::Sqlite, "query") => Read,
        _ => return None,
    };
    Some(effect)
}

/// A tool name (possibly an alias) resolved to its canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedTool {
    pub tool: ToolKind,
    /// Action implied by the alias itself (e.g. `ls` → `file.list`).
    pub action: Option<&'static str>,
}

impl NormalizedTool {
    pub fn canonical(&self) -> String {
        match self.action {
            Some(action) => format!("{}.{}", self.tool, action),
            None => self.tool.to_string(),
        }
    }
}

/// Total over the fixed alias table; `None` is an unknown tool. Applying
/// the result's canonical form again maps to itself.
pub fn normalize_alias(name: &str) -> Option<NormalizedTool> {
    let name = name.trim().to_ascii_lowercase();

    // Dotted form: normalize the tool part, keep the action.
    if let Some((tool_part, action_part)) = name.split_once('.') {
        let base = normalize_alias(tool_part)?;
        let action = canonical_action(base.tool, action_part)?;
        return Some(NormalizedTool {
            tool: base.tool,
            action: Some(action),
        });
    }

    let (tool, action) = match name.as_str() {
        "git" | "vcs" | "version_control" => (ToolKind::Git, None),
        "shell" | "bash" | "cmd" | "command" => (ToolKind::Shell, None),
        "terminal" => (ToolKind::Shell, Some("run")),
        "run" | "execute" => (ToolKind::Shell, Some("run")),
        "mkdir" => (ToolKind::Shell, Some("mkdir")),
        "file" | "fs" | "filesystem" => (ToolKind::File, None),
        "read" => (ToolKind::File, Some("read")),
        "ls" | "list" => (ToolKind::File, Some("list")),
        "sqlite" | "db" | "sql" | "database" => (ToolKind::Sqlite, None),
        _ => return None,
    };
    Some(NormalizedTool { tool, action })
}

/// Map action aliases within a tool to their canonical action name.
fn canonical_action(tool: ToolKind, action: &str) -> Option<&'static str> {
    let known: &[&'static str] = match tool {
        ToolKind::Git => &[
            "status", "log", "diff", "add", "commit", "push", "pull", "clone", "init",
        ],
        ToolKind::Shell => &["run", "mkdir"],
        ToolKind::File => &["read", "write", "list", "delete"],
        ToolKind::Sqlite => &["schema", "query"],
    };
    known.iter().find(|k| **k == action).copied().or(match (tool, action) {
        (ToolKind::Shell, "execute") => Some("run"),
        (ToolKind::File, "remove") | (ToolKind::File, "rm") => Some("delete"),
        (ToolKind::File, "ls") => Some("list"),
        _ => None,
    })
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool: ToolKind,
    pub action: String,
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(tool: ToolKind, action: &str, output: Value) -> Self {
        Self {
            tool,
            action: action.to_string(),
            success: true,
            output,
            error: None,
        }
    }

    pub fn fail(tool: ToolKind, action: &str, error: impl fmt::Display) -> Self {
        Self {
            tool,
            action: action.to_string(),
            success: false,
            output: Value::Null,
            error: Some(error.to_string()),
        }
    }
}

pub struct ToolExecutor {
    workspace: PathBuf,
    allow_shell: bool,
    shell_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(workspace: PathBuf, allow_shell: bool) -> Self {
        Self {
            workspace,
            allow_shell,
            shell_timeout: Duration::from_secs(60),
        }
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    /// Execute a tool action. `decision` comes from the permission gate;
    /// read actions ignore it, everything else requires an allow.
    pub async fn execute(
        &self,
        tool: ToolKind,
        action: &str,
        params: &Value,
        decision: Decision,
    ) -> ToolResult {
        let Some(effect) = side_effect(tool, action) else {
            return ToolResult::fail(
                tool,
                action,
                ErrorKind::UnknownAction {
                    tool: tool.to_string(),
                    action: action.to_string(),
                },
            );
        };

        if effect.needs_permission() && decision == Decision::Deny {
            return ToolResult::fail(
                tool,
                action,
                ErrorKind::PermissionDenied(format!("{}.{}", tool, action)),
            );
        }

        debug!(%tool, action, "executing tool");
        let result = match tool {
            ToolKind::Git => git::execute(&self.workspace, action, params).await,
            ToolKind::Shell => {
                if !self.allow_shell {
                    Err(anyhow::Error::new(ErrorKind::Forbidden(
                        "shell execution is disabled by configuration".to_string(),
                    )))
                } else {
                    shell::execute(&self.workspace, action, params, self.shell_timeout).await
                }
            }
            ToolKind::File => file::execute(&self.workspace, action, params).await,
            ToolKind::Sqlite => sqlite::execute(&self.workspace, action, params).await,
        };

        match result {
            Ok(output) => ToolResult::ok(tool, action, output),
            Err(err) => {
                // Preserve the typed kind in the message where present.
                let message = match kind_of(&err) {
                    Some(kind) => kind.to_string(),
                    None => err.to_string(),
                };
                ToolResult::fail(tool, action, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn alias_table_covers_spec_examples() {
        let read = normalize_alias("read").unwrap();
        assert_eq!(read.canonical(), "file.read");

        let terminal = normalize_alias("terminal").unwrap();
        assert_eq!(terminal.canonical(), "shell.run");

        let ls = normalize_alias("ls").unwrap();
        assert_eq!(ls.canonical(), "file.list");
    }

    #[test]
    fn alias_normalization_is_idempotent() {
        for name in [
            "read", "terminal", "ls", "git", "bash", "db", "fs", "vcs", "file.write",
            "shell.execute", "sqlite.query",
        ] {
            let first = normalize_alias(name).unwrap();
            let second = normalize_alias(&first.canonical()).unwrap();
            assert_eq!(first.tool, second.tool, "tool for {}", name);
            assert_eq!(first.canonical(), second.canonical(), "canonical for {}", name);
        }
    }

    #[test]
    fn unknown_tool_is_none_not_a_fallback() {
        assert!(normalize_alias("docker").is_none());
        assert!(normalize_alias("kubectl.apply").is_none());
    }

    #[test]
    fn side_effect_table() {
        assert_eq!(side_effect(ToolKind::Git, "status"), Some(SideEffect::Read));
        assert_eq!(
            side_effect(ToolKind::Git, "push"),
            Some(SideEffect::Destructive)
        );
        assert_eq!(
            side_effect(ToolKind::File, "delete"),
            Some(SideEffect::Destructive)
        );
        assert_eq!(side_effect(ToolKind::File, "write"), Some(SideEffect::Write));
        assert_eq!(side_effect(ToolKind::Git, "frobnicate"), None);
    }

    #[tokio::test]
    async fn unknown_action_is_reported_not_coerced() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ToolExecutor::new(dir.path().to_path_buf(), true);
        let result = executor
            .execute(ToolKind::Git, "teleport", &json!({}), Decision::AllowOnce)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("unknown action"));
    }

    #[tokio::test]
    async fn denied_write_fails_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ToolExecutor::new(dir.path().to_path_buf(), true);
        let target = dir.path().join("a.txt");
        let result = executor
            .execute(
                ToolKind::File,
                "write",
                &json!({"path": target.to_str().unwrap(), "content": "hi"}),
                Decision::Deny,
            )
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("permission denied"));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn denied_read_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "content").unwrap();
        let executor = ToolExecutor::new(dir.path().to_path_buf(), true);
        let result = executor
            .execute(ToolKind::File, "read", &json!({"path": "a.txt"}), Decision::Deny)
            .await;
        assert!(result.success, "reads never require permission");
    }

    #[tokio::test]
    async fn shell_disabled_by_config() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ToolExecutor::new(dir.path().to_path_buf(), false);
        let result = executor
            .execute(
                ToolKind::Shell,
                "run",
                &json!({"command": "echo hi"}),
                Decision::AllowOnce,
            )
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("disabled"));
    }
}
