//! SQLite tool: read-only schema inspection and queries against local
//! database files.

use std::path::Path;

use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Column, Row};

use crate::error::ErrorKind;

use super::file::resolve_path;

pub async fn execute(workspace: &Path, action: &str, params: &Value) -> anyhow::Result<Value> {
    match action {
        "schema" => schema(workspace, params).await,
        "query" => query(workspace, params).await,
        other => Err(anyhow::Error::new(ErrorKind::UnknownAction {
            tool: "sqlite".to_string(),
            action: other.to_string(),
        })),
    }
}

async fn connect(workspace: &Path, params: &Value) -> anyhow::Result<SqlitePool> {
    let raw = params["path"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
    let path = resolve_path(workspace, raw)?;
    if !path.exists() {
        return Err(anyhow::Error::new(ErrorKind::NotFound(
            path.display().to_string(),
        )));
    }

    let options = SqliteConnectOptions::new().filename(&path).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn schema(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let pool = connect(workspace, params).await?;
    let rows = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&pool)
    .await?;

    let tables: Vec<String> = rows
        .iter()
        .filter_map(|row| row.try_get::<String, _>(0).ok())
        .collect();
    pool.close().await;

    Ok(json!({ "tables": tables }))
}

/// Statement verbs allowed through the read-only query surface.
const READ_VERBS: &[&str] = &["select", "with", "pragma", "explain"];

async fn query(workspace: &Path, params: &Value) -> anyhow::Result<Value> {
    let sql = params["sql"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: sql"))?;

    let verb = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if !READ_VERBS.contains(&verb.as_str()) {
        return Err(anyhow::Error::new(ErrorKind::Forbidden(format!(
            "sqlite.query is read-only; '{}' statements are not allowed",
            verb
        ))));
    }

    let pool = connect(workspace, params).await?;
    let rows = sqlx::query(sql).fetch_all(&pool).await?;

    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let data: Vec<Value> = rows
        .iter()
        .map(|row| {
            let values: Vec<Value> = (0..row.columns().len())
                .map(|i| decode_column(row, i))
                .collect();
            Value::Array(values)
        })
        .collect();
    pool.close().await;

    Ok(json!({
        "columns": columns,
        "rows": data,
    }))
}

/// SQLite columns are dynamically typed; try the common decodings in
/// order and fall back to a blob marker.
fn decode_column(row: &sqlx::sqlite::SqliteRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v
            .map(|bytes| Value::from(format!("<blob {} bytes>", bytes.len())))
            .unwrap_or(Value::Null);
    }
    Value::Null
}
