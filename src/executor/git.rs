//! Git tool: subprocess-backed verbs with porcelain parsing for status.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::ErrorKind;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn execute(workspace: &Path, action: &str, params: &Value) -> anyhow::Result<Value> {
    match action {
        "status" => status(workspace).await,
        "log" => log(workspace, params).await,
        "diff" => diff(workspace, params).await,
        "add" => add(workspace, params).await,
        "commit" => commit(workspace, params).await,
        "push" => push(workspace, params).await,
        "pull" => pull(workspace, params).await,
        "clone" => clone(workspace, params).await,
        "init" => init(workspace).await,
        other => Err(anyhow::Error::new(ErrorKind::UnknownAction {
            tool: "git".to_string(),
            action: other.to_string(),
        })),
    }
}

async fn run_git(workspace: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        tokio::process::Command::new("git")
            .args(args)
            .current_dir(workspace)
            .output(),
    )
    .await
    .map_err(|_| anyhow::Error::new(ErrorKind::Timeout(GIT_TIMEOUT)))??;

    if !output.status.success() {
        return Err(anyhow::Error::new(ErrorKind::SubprocessFailed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn status(workspace: &Path) -> anyhow::Result<Value> {
    let porcelain = run_git(workspace, &["status", "--porcelain"]).await?;

    let mut staged = Vec::new();
    let mut modified = Vec::new();
    let mut untracked = Vec::new();

    for line in porcelain.lines() {
        if line.len() < 4 {
            continue;
        }
        let index = line.as_bytes()[0] as char;
        let worktree = line.as_bytes()[1] as char;
        let path = line[3..].to_string();

        if index == '?' && worktree == '?' {
            untracked.push(path);
            continue;
        }
        if index != ' ' {
            staged.push(path.clone());
        }
        if worktree != ' ' {
            modified.push(path);
        }
    }

    Ok(json!({
        "staged": staged,
        "modified": modified,
        "untracked": untracked,
    }))
}

async fn log(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let limit = params["limit"].as_u64().unwrap_or(10).to_string();
    let out = run_git(workspace, &["log", "--oneline", "-n", limit.as_str()]).await?;
    let commits: Vec<Value> = out
        .lines()
        .filter_map(|line| {
            let (sha, subject) = line.split_once(' ')?;
            Some(json!({"sha": sha, "subject": subject}))
        })
        .collect();
    Ok(json!({ "commits": commits }))
}

async fn diff(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let mut args = vec!["diff"];
    if let Some(path) = params["path"].as_str() {
        args.push("--");
        args.push(path);
    }
    let out = run_git(workspace, &args).await?;
    Ok(json!({ "diff": out }))
}

fn param_files(params: &Value) -> Vec<String> {
    params["files"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

async fn add(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let files = param_files(params);
    if files.is_empty() {
        anyhow::bail!("missing required parameter: files");
    }
    let mut args: Vec<&str> = vec!["add", "--"];
    args.extend(files.iter().map(|f| f.as_str()));
    run_git(workspace, &args).await?;
    Ok(json!({ "added": files }))
}

async fn commit(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let message = params["message"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: message"))?;

    let files = param_files(params);
    if files.is_empty() {
        // No explicit file list: stage everything, like a checkpoint.
        run_git(workspace, &["add", "-A"]).await?;
    } else {
        let mut args: Vec<&str> = vec!["add", "--"];
        args.extend(files.iter().map(|f| f.as_str()));
        run_git(workspace, &args).await?;
    }

    run_git(workspace, &["commit", "-m", message]).await?;
    let sha = run_git(workspace, &["rev-parse", "HEAD"]).await?;
    Ok(json!({
        "sha": sha.trim(),
        "message": message,
    }))
}

async fn push(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let remote = params["remote"].as_str().unwrap_or("origin");
    let branch = params["branch"].as_str().unwrap_or("HEAD");
    run_git(workspace, &["push", remote, branch]).await?;
    Ok(json!({ "remote": remote, "branch": branch }))
}

async fn pull(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let remote = params["remote"].as_str().unwrap_or("origin");
    let out = run_git(workspace, &["pull", remote]).await?;
    Ok(json!({ "remote": remote, "output": out.trim() }))
}

async fn clone(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let url = params["url"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: url"))?;
    let mut args = vec!["clone", url];
    if let Some(dest) = params["dest"].as_str() {
        args.push(dest);
    }
    run_git(workspace, &args).await?;
    Ok(json!({ "url": url }))
}

async fn init(workspace: &Path) -> anyhow::Result<Value> {
    run_git(workspace, &["init"]).await?;
    Ok(json!({ "path": workspace.display().to_string() }))
}
