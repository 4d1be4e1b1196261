//! Response formatter — stateless rendering of every result variant to
//! user-facing text. One pure function per variant; nothing in here
//! touches state or does I/O.

use std::path::Path;

use crate::executor::{ToolKind, ToolResult};
use crate::extractor::ContentKind;
use crate::planner::{StepStatus, TaskPlan, TaskStep};
use crate::router::Intent;
use crate::types::{AlgorithmResult, AlgorithmTask, CodeResult, CodingTask};

pub fn format_tool_result(result: &ToolResult) -> String {
    if !result.success {
        return format_error(
            result
                .error
                .as_deref()
                .unwrap_or("tool execution failed"),
        );
    }

    match (result.tool, result.action.as_str()) {
        (ToolKind::Git, "status") => format_git_status(result),
        (ToolKind::Git, "commit") => format!(
            "Committed {} — {}",
            short_sha(result.output["sha"].as_str().unwrap_or("")),
            result.output["message"].as_str().unwrap_or("")
        ),
        (ToolKind::Git, "push") => format!(
            "Pushed {} to {}",
            result.output["branch"].as_str().unwrap_or("HEAD"),
            result.output["remote"].as_str().unwrap_or("origin")
        ),
        (ToolKind::Git, "log") => {
            let commits = result.output["commits"].as_array().cloned().unwrap_or_default();
            if commits.is_empty() {
                "No commits yet".to_string()
            } else {
                commits
                    .iter()
                    .map(|c| {
                        format!(
                            "{} {}",
                            short_sha(c["sha"].as_str().unwrap_or("")),
                            c["subject"].as_str().unwrap_or("")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        (ToolKind::Git, "diff") => {
            let diff = result.output["diff"].as_str().unwrap_or("");
            if diff.trim().is_empty() {
                "No changes".to_string()
            } else {
                format!("```diff\n{}\n```", diff.trim_end())
            }
        }
        (ToolKind::Shell, "run") => format_shell_run(result),
        (ToolKind::Shell, "mkdir") => {
            let created = result.output["created"].as_array().cloned().unwrap_or_default();
            if created.is_empty() {
                "Directories already exist".to_string()
            } else {
                format!(
                    "Created {} director{}:\n{}",
                    created.len(),
                    if created.len() == 1 { "y" } else { "ies" },
                    created
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|p| format!("  {}", p))
                        .collect::<Vec<_>>()
                        .join("\n")
                )
            }
        }
        (ToolKind::File, "read") => {
            let path = result.output["path"].as_str().unwrap_or("");
            let content = result.output["content"].as_str().unwrap_or("");
            let kind = ContentKind::from_path(Path::new(path));
            format!(
                "{} ({} bytes):\n```{}\n{}\n```",
                path,
                result.output["bytes"].as_u64().unwrap_or(0),
                kind.fence_label(),
                content.trim_end()
            )
        }
        (ToolKind::File, "write") => {
            let mut line = format!(
                "Wrote {} ({} bytes)",
                result.output["path"].as_str().unwrap_or(""),
                result.output["bytes"].as_u64().unwrap_or(0)
            );
            if let Some(backup) = result.output["backup_path"].as_str() {
                line.push_str(&format!("\nBackup: {}", backup));
            }
            line
        }
        (ToolKind::File, "list") => {
            let entries = result.output["entries"].as_array().cloned().unwrap_or_default();
            if entries.is_empty() {
                format!("{} is empty", result.output["path"].as_str().unwrap_or(""))
            } else {
                entries
                    .iter()
                    .map(|e| {
                        let name = e["name"].as_str().unwrap_or("");
                        if e["kind"] == "dir" {
                            format!("{}/", name)
                        } else {
                            name.to_string()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        (ToolKind::File, "delete") => format!(
            "Deleted {} (backup at {})",
            result.output["path"].as_str().unwrap_or(""),
            result.output["backup_path"].as_str().unwrap_or("")
        ),
        (ToolKind::Sqlite, "schema") => {
            let tables = result.output["tables"].as_array().cloned().unwrap_or_default();
            if tables.is_empty() {
                "No tables".to_string()
            } else {
                format!(
                    "Tables:\n{}",
                    tables
                        .iter()
                        .filter_map(|t| t.as_str())
                        .map(|t| format!("  {}", t))
                        .collect::<Vec<_>>()
                        .join("\n")
                )
            }
        }
        (ToolKind::Sqlite, "query") => format_sqlite_rows(result),
        _ => serde_json::to_string_pretty(&result.output).unwrap_or_default(),
    }
}

fn format_git_status(result: &ToolResult) -> String {
    let staged = result.output["staged"].as_array().cloned().unwrap_or_default();
    let modified = result.output["modified"].as_array().cloned().unwrap_or_default();
    let untracked = result.output["untracked"].as_array().cloned().unwrap_or_default();

    if staged.is_empty() && modified.is_empty() && untracked.is_empty() {
        return "Working directory is clean".to_string();
    }

    let mut out = String::new();
    let section = |title: &str, items: &[serde_json::Value]| {
        if items.is_empty() {
            String::new()
        } else {
            format!(
                "{}:\n{}\n",
                title,
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|p| format!("  {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        }
    };
    out.push_str(&section("Staged", &staged));
    out.push_str(&section("Modified", &modified));
    out.push_str(&section("Untracked", &untracked));
    out.trim_end().to_string()
}

fn format_shell_run(result: &ToolResult) -> String {
    let exit_code = result.output["exit_code"].as_i64().unwrap_or(-1);
    let stdout = result.output["stdout"].as_str().unwrap_or("").trim_end();
    let stderr = result.output["stderr"].as_str().unwrap_or("").trim_end();

    let mut out = String::new();
    if !stdout.is_empty() {
        out.push_str(stdout);
    }
    if !stderr.is_empty() {
        if !out.is_empty() {
            out.push_str("\n--- stderr ---\n");
        }
        out.push_str(stderr);
    }
    if out.is_empty() {
        out = format!("(no output, exit code {})", exit_code);
    } else if exit_code != 0 {
        out.push_str(&format!("\n(exit code {})", exit_code));
    }
    if result.output["truncated"].as_bool().unwrap_or(false) {
        out.push_str("\n(output truncated)");
    }
    out
}

fn format_sqlite_rows(result: &ToolResult) -> String {
    let columns = result.output["columns"].as_array().cloned().unwrap_or_default();
    let rows = result.output["rows"].as_array().cloned().unwrap_or_default();
    if rows.is_empty() {
        return "No rows".to_string();
    }

    let header = columns
        .iter()
        .filter_map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(" | ");
    let body = rows
        .iter()
        .map(|row| {
            row.as_array()
                .map(|cells| {
                    cells
                        .iter()
                        .map(render_cell)
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}\n{}\n{} row(s)", header, body, rows.len())
}

fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn short_sha(sha: &str) -> String {
    sha.chars().take(8).collect()
}

pub fn format_code_result(result: &CodeResult, task: &CodingTask) -> String {
    if !result.success {
        return format_error(
            result
                .error
                .as_deref()
                .unwrap_or("code generation failed"),
        );
    }

    let mut out = String::new();
    for (path, content) in &result.files {
        let kind = ContentKind::from_path(path);
        out.push_str(&format!(
            "{}:\n```{}\n{}\n```\n\n",
            path.display(),
            kind.fence_label(),
            content.trim_end()
        ));
    }
    if !result.edits.is_empty() {
        out.push_str(&format!(
            "Applied {} edit(s) to {}:\n",
            result.edits.len(),
            task.target_files
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ));
        for edit in &result.edits {
            out.push_str(&format!(
                "  lines {}-{}: {}\n",
                edit.start_line, edit.end_line, edit.description
            ));
        }
    }
    if out.is_empty() {
        out = "Done (no files changed)".to_string();
    }
    out.trim_end().to_string()
}

pub fn format_algorithm_result(result: &AlgorithmResult, task: &AlgorithmTask) -> String {
    let mut out = format_code_result(&result.code, &task.base);
    if !result.complexity.time.is_empty() || !result.complexity.space.is_empty() {
        out.push_str(&format!(
            "\n\nComplexity: {} time, {} space",
            result.complexity.time, result.complexity.space
        ));
    }
    if !result.rationale.is_empty() {
        out.push_str(&format!("\n{}", result.rationale));
    }
    out
}

pub fn format_simple_answer(answer: &str) -> String {
    answer.trim().to_string()
}

pub fn format_error(message: &str) -> String {
    format!("Error: {}", message)
}

/// Clarification prompt listing the top candidate readings.
pub fn format_clarification(utterance: &str, candidates: &[(Intent, f32)]) -> String {
    let mut out = format!(
        "I'm not sure what you meant by \"{}\". Did you want to:\n",
        utterance.trim()
    );
    for (i, (intent, _)) in candidates.iter().take(2).enumerate() {
        let reading = match intent {
            Intent::ToolCall => "run a tool command (git, shell, file, sqlite)",
            Intent::SimpleAnswer => "get a quick answer to a question",
            Intent::CodingTask => "generate or edit code",
            Intent::AlgorithmTask => "design an algorithm",
            Intent::Unknown => "something else",
        };
        out.push_str(&format!("  {}. {}\n", i + 1, reading));
    }
    out.push_str("Please rephrase with a bit more detail.");
    out
}

pub fn format_unknown(utterance: &str) -> String {
    format!(
        "I couldn't classify \"{}\". Try a concrete request like \"git status\", \
         \"create calc.py with two functions\", or \"explain big-O notation\".",
        utterance.trim()
    )
}

pub fn format_step_progress(step: &TaskStep, index: usize, total: usize) -> String {
    format!("[{}/{}] {}", index, total, step.description)
}

pub fn format_plan_summary(plan: &TaskPlan) -> String {
    let (completed, failed, skipped) = plan.counts();
    let mut out = format!("Plan: {} step(s)\n", plan.steps.len());
    for step in &plan.steps {
        let marker = match step.status {
            StepStatus::Completed => "done",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "skipped",
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in progress",
        };
        out.push_str(&format!("  {} — {}", step.description, marker));
        if let Some(error) = &step.error {
            out.push_str(&format!(" ({})", error));
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "{} completed, {} failed, {} skipped",
        completed, failed, skipped
    ));
    out
}
