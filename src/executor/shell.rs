//! Shell tool: `shell.run` with a forbidden-pattern policy, timeout and
//! output truncation, and `shell.mkdir` for batched directory creation.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use crate::error::ErrorKind;

use super::file::resolve_path;

const MAX_STDOUT_CHARS: usize = 50_000;
const MAX_STDERR_CHARS: usize = 10_000;

/// Patterns that are never executed, no matter what the user approved.
static FORBIDDEN: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"rm\s+(-[a-zA-Z]+\s+)*(/\s*$|/\s|/\*|~\s*$|\$HOME\s*$)",
            "recursive delete at filesystem root or home",
        ),
        (r":\s*\(\s*\)\s*\{.*\}\s*;?\s*:", "fork bomb"),
        (r">\s*/dev/sd[a-z]", "write to raw block device"),
        (r"\bdd\b.*of=/dev/", "dd onto a device file"),
        (r"\bmkfs\b", "filesystem format"),
        (r"\bshutdown\b|\breboot\b", "system power control"),
    ]
    .into_iter()
    .map(|(pattern, reason)| (Regex::new(pattern).unwrap(), reason))
    .collect()
});

/// Read-only command prefixes that don't need a confirmation prompt.
const SAFE_PREFIXES: &[&str] = &[
    "git status",
    "git log",
    "git diff",
    "git show",
    "git branch",
    "ls",
    "pwd",
    "cat",
    "head",
    "tail",
    "wc",
    "file",
    "stat",
    "tree",
    "which",
    "whoami",
    "uname",
    "date",
    "env",
    "printenv",
    "du",
    "df",
];

/// Why a command is refused outright, if it is. Checked before any
/// permission prompt so forbidden commands never reach the user.
pub fn forbidden_reason(command: &str) -> Option<&'static str> {
    FORBIDDEN
        .iter()
        .find(|(pattern, _)| pattern.is_match(command))
        .map(|(_, reason)| *reason)
}

/// Commands starting with a read-only prefix classify as reads.
pub fn is_safe_readonly(command: &str) -> bool {
    let trimmed = command.trim();
    SAFE_PREFIXES.iter().any(|prefix| {
        trimmed == *prefix || trimmed.starts_with(&format!("{} ", prefix))
    })
}

pub async fn execute(
    workspace: &Path,
    action: &str,
    params: &Value,
    default_timeout: Duration,
) -> anyhow::Result<Value> {
    match action {
        "run" => run(workspace, params, default_timeout).await,
        "mkdir" => mkdir(workspace, params).await,
        other => Err(anyhow::Error::new(ErrorKind::UnknownAction {
            tool: "shell".to_string(),
            action: other.to_string(),
        })),
    }
}

async fn run(workspace: &Path, params: &Value, default_timeout: Duration) -> anyhow::Result<Value> {
    let command = params["command"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: command"))?;
    let cwd = match params["cwd"].as_str() {
        Some(raw) => resolve_path(workspace, raw)?,
        None => workspace.to_path_buf(),
    };
    let timeout = params["timeout"]
        .as_u64()
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    if let Some(reason) = forbidden_reason(command) {
        return Err(anyhow::Error::new(ErrorKind::Forbidden(format!(
            "{} ({})",
            reason, command
        ))));
    }

    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout_pipe = child.stdout.take().expect("piped stdout");
    let mut stderr_pipe = child.stderr.take().expect("piped stderr");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(anyhow::Error::new(ErrorKind::Timeout(timeout)));
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    let (stdout, out_truncated) = truncate(stdout, MAX_STDOUT_CHARS);
    let (stderr, err_truncated) = truncate(stderr, MAX_STDERR_CHARS);

    let mut output = json!({
        "exit_code": status.code().unwrap_or(-1),
        "stdout": stdout,
        "stderr": stderr,
    });
    if out_truncated || err_truncated {
        output["truncated"] = json!(true);
    }
    Ok(output)
}

fn truncate(s: String, max_chars: usize) -> (String, bool) {
    if s.chars().count() <= max_chars {
        return (s, false);
    }
    let half = max_chars / 2;
    let head: String = s.chars().take(half).collect();
    let tail: String = s
        .chars()
        .rev()
        .take(half)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    (format!("{}\n... (output truncated) ...\n{}", head, tail), true)
}

async fn mkdir(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let paths: Vec<String> = match &params["paths"] {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        Value::String(single) => vec![single.clone()],
        _ => anyhow::bail!("missing required parameter: paths"),
    };
    if paths.is_empty() {
        anyhow::bail!("missing required parameter: paths");
    }
    let parents = params["parents"].as_bool().unwrap_or(true);

    let mut created = Vec::new();
    for raw in &paths {
        let dir = resolve_path(workspace, raw)?;
        if dir.exists() {
            continue;
        }
        if parents {
            tokio::fs::create_dir_all(&dir).await?;
        } else {
            tokio::fs::create_dir(&dir).await?;
        }
        created.push(dir.display().to_string());
    }

    Ok(json!({ "created": created }))
}
