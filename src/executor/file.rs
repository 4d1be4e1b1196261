//! File tool: read, write, list, delete. Writes are atomic (`.part` then
//! rename) and destructive operations back the target up under
//! `<workspace>/.backups/` first.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};

use crate::error::ErrorKind;

/// Sensitive locations that are never written or deleted through the tool.
const SENSITIVE_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".env",
    ".pem",
    ".aws/credentials",
    ".netrc",
    "id_rsa",
    "id_ed25519",
];

pub async fn execute(workspace: &Path, action: &str, params: &Value) -> anyhow::Result<Value> {
    match action {
        "read" => read(workspace, params).await,
        "write" => write(workspace, params).await,
        "list" => list(workspace, params).await,
        "delete" => delete(workspace, params).await,
        other => Err(anyhow::Error::new(ErrorKind::UnknownAction {
            tool: "file".to_string(),
            action: other.to_string(),
        })),
    }
}

/// Resolve `~`, anchor relative paths at the workspace, reject traversal.
pub fn resolve_path(workspace: &Path, raw: &str) -> anyhow::Result<PathBuf> {
    let expanded = shellexpand::tilde(raw).into_owned();
    let p = PathBuf::from(&expanded);
    let resolved = if p.is_absolute() {
        p
    } else {
        workspace.join(p)
    };

    let as_str = resolved.to_string_lossy();
    if as_str.contains("/../") || as_str.ends_with("/..") {
        anyhow::bail!("path traversal detected: {}", raw);
    }
    Ok(resolved)
}

pub fn is_sensitive_path(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    SENSITIVE_PATTERNS.iter().any(|pat| path_str.contains(pat))
}

fn required_str<'a>(params: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    params[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: {}", key))
}

async fn read(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let raw = required_str(params, "path")?;
    let path = resolve_path(workspace, raw)?;
    if !path.exists() {
        return Err(anyhow::Error::new(ErrorKind::NotFound(
            path.display().to_string(),
        )));
    }
    let content = tokio::fs::read_to_string(&path).await?;
    Ok(json!({
        "path": path.display().to_string(),
        "bytes": content.len(),
        "content": content,
    }))
}

async fn write(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let raw = required_str(params, "path")?;
    let content = required_str(params, "content")?;
    let overwrite = params["overwrite"].as_bool().unwrap_or(true);

    let path = resolve_path(workspace, raw)?;
    if is_sensitive_path(&path) {
        return Err(anyhow::Error::new(ErrorKind::Forbidden(format!(
            "refusing to write sensitive path: {}",
            path.display()
        ))));
    }

    let existed = path.exists();
    if existed && !overwrite {
        anyhow::bail!("{} already exists and overwrite is false", path.display());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let backup_path = if existed {
        Some(backup_file(workspace, &path).await?)
    } else {
        None
    };

    // Atomic write: stream to `.part`, rename on completion.
    let part = part_path(&path);
    tokio::fs::write(&part, content).await?;
    tokio::fs::rename(&part, &path).await?;

    let mut output = json!({
        "path": path.display().to_string(),
        "bytes": content.len(),
    });
    if let Some(backup) = backup_path {
        output["backup_path"] = json!(backup.display().to_string());
    }
    Ok(output)
}

async fn list(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let raw = params["path"].as_str().unwrap_or(".");
    let path = resolve_path(workspace, raw)?;
    if !path.exists() {
        return Err(anyhow::Error::new(ErrorKind::NotFound(
            path.display().to_string(),
        )));
    }

    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(&path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let meta = entry.metadata().await?;
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "kind": if meta.is_dir() { "dir" } else { "file" },
            "size": meta.len(),
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Ok(json!({
        "path": path.display().to_string(),
        "entries": entries,
    }))
}

async fn delete(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let raw = required_str(params, "path")?;
    let path = resolve_path(workspace, raw)?;
    if is_sensitive_path(&path) {
        return Err(anyhow::Error::new(ErrorKind::Forbidden(format!(
            "refusing to delete sensitive path: {}",
            path.display()
        ))));
    }
    if !path.exists() {
        return Err(anyhow::Error::new(ErrorKind::NotFound(
            path.display().to_string(),
        )));
    }
    if path.is_dir() {
        anyhow::bail!("{} is a directory; only files can be deleted", path.display());
    }

    let backup = backup_file(workspace, &path).await?;
    tokio::fs::remove_file(&path).await?;

    Ok(json!({
        "path": path.display().to_string(),
        "backup_path": backup.display().to_string(),
    }))
}

pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Copy `path` into `<workspace>/.backups/<relative>.<timestamp>.bak`.
/// Files outside the workspace back up side by side instead.
pub async fn backup_file(workspace: &Path, path: &Path) -> anyhow::Result<PathBuf> {
    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");
    let backup = match path.strip_prefix(workspace) {
        Ok(relative) => {
            let mut name = relative.as_os_str().to_os_string();
            name.push(format!(".{}.bak", stamp));
            workspace.join(".backups").join(PathBuf::from(name))
        }
        Err(_) => {
            let mut name = path.as_os_str().to_os_string();
            name.push(format!(".{}.bak", stamp));
            PathBuf::from(name)
        }
    };
    if let Some(parent) = backup.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(path, &backup).await?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let content = "def add(a, b):\n    return a + b\n";
        let out = execute(
            dir.path(),
            "write",
            &json!({"path": "calc.py", "content": content}),
        )
        .await
        .unwrap();
        assert_eq!(out["bytes"], content.len());
        assert!(out.get("backup_path").is_none());

        let read = execute(dir.path(), "read", &json!({"path": "calc.py"}))
            .await
            .unwrap();
        assert!(read["content"].as_str().unwrap().contains("def add"));
    }

    #[tokio::test]
    async fn overwrite_creates_backup_under_backups_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();

        let out = execute(
            dir.path(),
            "write",
            &json!({"path": "a.txt", "content": "new"}),
        )
        .await
        .unwrap();

        let backup = out["backup_path"].as_str().unwrap();
        assert!(backup.contains(".backups"));
        assert!(backup.ends_with(".bak"));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "old");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "new"
        );
    }

    #[tokio::test]
    async fn write_leaves_no_part_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        execute(
            dir.path(),
            "write",
            &json!({"path": "b.txt", "content": "data"}),
        )
        .await
        .unwrap();
        assert!(dir.path().join("b.txt").exists());
        assert!(!dir.path().join("b.txt.part").exists());
    }

    #[tokio::test]
    async fn overwrite_false_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let err = execute(
            dir.path(),
            "write",
            &json!({"path": "a.txt", "content": "new", "overwrite": false}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn sensitive_paths_are_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute(
            dir.path(),
            "write",
            &json!({"path": ".ssh/authorized_keys", "content": "key"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(ErrorKind::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn delete_backs_up_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doomed.txt"), "contents").unwrap();

        let out = execute(dir.path(), "delete", &json!({"path": "doomed.txt"}))
            .await
            .unwrap();
        assert!(!dir.path().join("doomed.txt").exists());
        let backup = out["backup_path"].as_str().unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "contents");
    }

    #[tokio::test]
    async fn list_reports_entries_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let out = execute(dir.path(), "list", &json!({})).await.unwrap();
        let entries = out["entries"].as_array().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[2]["kind"], "dir");
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute(dir.path(), "read", &json!({"path": "ghost.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(ErrorKind::NotFound(_))
        ));
    }

    #[test]
    fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_path(dir.path(), "/tmp/../../etc/passwd").is_err());
        assert!(resolve_path(dir.path(), "ok/nested.txt").is_ok());
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/w/app.py")),
            PathBuf::from("/w/app.py.part")
        );
    }
}
