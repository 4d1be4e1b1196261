//! Shared task/result records passed between the router, orchestrator, and
//! specialist engines.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::editor::EditBlock;

/// What kind of change a coding task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Create,
    Edit,
    Refactor,
    Fix,
    Explain,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Create => "create",
            TaskKind::Edit => "edit",
            TaskKind::Refactor => "refactor",
            TaskKind::Fix => "fix",
            TaskKind::Explain => "explain",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeFor {
    #[default]
    Time,
    Space,
    Readability,
}

/// Request object handed to the coder engine.
#[derive(Debug, Clone)]
pub struct CodingTask {
    pub task_type: TaskKind,
    pub target_files: Vec<PathBuf>,
    pub instructions: String,
    /// Current content of files being edited, keyed by path.
    pub existing_code: BTreeMap<PathBuf, String>,
    pub language: Option<String>,
    pub constraints: Vec<String>,
}

impl CodingTask {
    pub fn create(target: impl Into<PathBuf>, instructions: impl Into<String>) -> Self {
        Self {
            task_type: TaskKind::Create,
            target_files: vec![target.into()],
            instructions: instructions.into(),
            existing_code: BTreeMap::new(),
            language: None,
            constraints: Vec::new(),
        }
    }

    pub fn edit(
        target: impl Into<PathBuf>,
        existing: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        let target = target.into();
        let mut existing_code = BTreeMap::new();
        existing_code.insert(target.clone(), existing.into());
        Self {
            task_type: TaskKind::Edit,
            target_files: vec![target],
            instructions: instructions.into(),
            existing_code,
            language: None,
            constraints: Vec::new(),
        }
    }
}

/// Request object handed to the algorithm specialist.
#[derive(Debug, Clone)]
pub struct AlgorithmTask {
    pub base: CodingTask,
    pub expected_complexity: Option<String>,
    pub optimize_for: OptimizeFor,
}

/// Response from the coder engine: either whole files or edit blocks.
#[derive(Debug, Clone, Default)]
pub struct CodeResult {
    pub success: bool,
    pub files: BTreeMap<PathBuf, String>,
    pub edits: Vec<EditBlock>,
    /// Set by the coder when the problem needs the algorithm specialist.
    pub needs_algorithm_specialist: bool,
    pub error: Option<String>,
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    pub time: String,
    pub space: String,
}

#[derive(Debug, Clone, Default)]
pub struct AlgorithmResult {
    pub code: CodeResult,
    pub complexity: ComplexityAnalysis,
    pub rationale: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_task_captures_existing_content() {
        let task = CodingTask::edit("calc.py", "def add(a, b):\n    return a + b\n", "add hints");
        assert_eq!(task.task_type, TaskKind::Edit);
        assert_eq!(task.target_files, vec![PathBuf::from("calc.py")]);
        assert!(task.existing_code[&PathBuf::from("calc.py")].contains("def add"));
    }

    #[test]
    fn task_kind_display_is_lowercase() {
        assert_eq!(TaskKind::Refactor.to_string(), "refactor");
    }
}
