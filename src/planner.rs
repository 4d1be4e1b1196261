//! Task planner — decomposes multi-clause utterances into an ordered plan
//! and tracks step execution state.
//!
//! Clause steps are typed by re-running the router's deterministic rules
//! against each clause. Full-stack requests expand into a fixed chunk
//! template sized so CPU inference stays under its per-chunk deadline.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::router::{self, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    ToolCall,
    CodeGen,
    Algorithm,
    SimpleAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

#[derive(Debug, Clone)]
pub struct TaskStep {
    pub id: usize,
    pub step_type: StepType,
    pub description: String,
    pub params: Map<String, Value>,
    pub depends_on: Vec<usize>,
    pub status: StepStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TaskStep {
    fn new(id: usize, step_type: StepType, description: impl Into<String>) -> Self {
        Self {
            id,
            step_type,
            description: description.into(),
            params: Map::new(),
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub request: String,
    pub steps: Vec<TaskStep>,
    pub execution_order: Vec<usize>,
    pub is_sequential: bool,
}

impl TaskPlan {
    /// Next pending step whose dependencies have all completed. `None`
    /// when the plan is done or blocked.
    pub fn next_step(&self) -> Option<&TaskStep> {
        self.execution_order
            .iter()
            .filter_map(|id| self.steps.iter().find(|s| s.id == *id))
            .find(|step| {
                step.status == StepStatus::Pending
                    && step.depends_on.iter().all(|dep| {
                        self.steps
                            .iter()
                            .find(|s| s.id == *dep)
                            .map(|s| s.status == StepStatus::Completed)
                            .unwrap_or(false)
                    })
            })
    }

    /// Transition a step. Only `Pending → InProgress`,
    /// `Pending → Skipped`, and `InProgress → {Completed, Failed,
    /// Skipped}` are legal; anything else is an error, never coerced.
    /// Failing a step of a sequential plan skips every later pending
    /// step.
    pub fn update(
        &mut self,
        id: usize,
        status: StepStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let position = self
            .steps
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| anyhow::anyhow!("no step with id {}", id))?;

        let current = self.steps[position].status;
        let legal = matches!(
            (current, status),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::InProgress, StepStatus::Completed)
                | (StepStatus::InProgress, StepStatus::Failed)
                | (StepStatus::InProgress, StepStatus::Skipped)
        );
        if !legal {
            anyhow::bail!(
                "illegal step transition for step {}: {} -> {}",
                id,
                current,
                status
            );
        }

        {
            let step = &mut self.steps[position];
            step.status = status;
            if result.is_some() {
                step.result = result;
            }
            if error.is_some() {
                step.error = error;
            }
        }

        if status == StepStatus::Failed && self.is_sequential {
            let failed_pos = self
                .execution_order
                .iter()
                .position(|sid| *sid == id)
                .unwrap_or(0);
            let to_skip: Vec<usize> = self.execution_order[failed_pos + 1..]
                .iter()
                .copied()
                .collect();
            for sid in to_skip {
                if let Some(step) = self.steps.iter_mut().find(|s| s.id == sid) {
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Skipped;
                        step.error = Some(format!("skipped: step {} failed", id));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let failed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        let skipped = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        (completed, failed, skipped)
    }
}

const SEQUENTIAL_KEYWORDS: &[&str] = &["then", "after", "next", "followed by", "finally", "lastly"];
const PARALLEL_KEYWORDS: &[&str] = &["and also", "simultaneously", "at the same time"];

static NUMBERED_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\n|\s)(\d+[.)]\s+|Step\s+\d+:\s*)").unwrap());
static FULLSTACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)full[- ]?stack|frontend and backend|backend and frontend|web app(lication)?")
        .unwrap()
});
static DATABASE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)database|sqlite|\bdb\b|\bsql\b|crud|storage|persist").unwrap());

#[derive(Default)]
pub struct TaskPlanner;

impl TaskPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Does this utterance need decomposition at all?
    pub fn needs_planning(&self, utterance: &str) -> bool {
        let lower = utterance.to_lowercase();

        if self.is_fullstack(utterance) {
            return true;
        }
        if SEQUENTIAL_KEYWORDS
            .iter()
            .any(|kw| contains_word(&lower, kw))
        {
            return true;
        }
        if PARALLEL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return true;
        }
        // "create a.py and b.py" is one task with two files, not a plan.
        if contains_word(&lower, "and")
            && lower.matches(" and ").count() > 1
            && !lower.contains("file")
        {
            return true;
        }
        NUMBERED_ITEM.find_iter(utterance).count() >= 2
    }

    pub fn is_fullstack(&self, utterance: &str) -> bool {
        FULLSTACK.is_match(utterance)
    }

    pub fn plan(&self, utterance: &str) -> TaskPlan {
        if self.is_fullstack(utterance) {
            return self.plan_fullstack(utterance);
        }

        let clauses = split_clauses(utterance);
        let is_sequential = self.is_sequential(utterance);

        let mut steps = Vec::new();
        for (i, clause) in clauses.iter().enumerate() {
            let id = i + 1;
            let mut step = classify_clause(id, clause);
            if is_sequential && id > 1 {
                step.depends_on.push(id - 1);
            }
            steps.push(step);
        }
        let execution_order = steps.iter().map(|s| s.id).collect();

        TaskPlan {
            request: utterance.to_string(),
            steps,
            execution_order,
            is_sequential,
        }
    }

    fn is_sequential(&self, utterance: &str) -> bool {
        let lower = utterance.to_lowercase();
        if SEQUENTIAL_KEYWORDS
            .iter()
            .any(|kw| contains_word(&lower, kw))
        {
            return true;
        }
        if NUMBERED_ITEM.find_iter(utterance).count() >= 2 {
            return true;
        }
        // Purely parallel connectives; execution may still serialize.
        if PARALLEL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return false;
        }
        true
    }

    /// The fixed full-stack chunk template. Eight chunks when a database
    /// is involved, six otherwise; every generation chunk carries a hard
    /// token budget.
    fn plan_fullstack(&self, utterance: &str) -> TaskPlan {
        let has_database = DATABASE_HINT.is_match(utterance);
        let mut steps: Vec<TaskStep> = Vec::new();

        let code_step =
            |steps: &mut Vec<TaskStep>, file: &str, desc: &str, max_tokens: u64| {
                let id = steps.len() + 1;
                let mut step = TaskStep::new(id, StepType::CodeGen, desc);
                step.params.insert("file".to_string(), Value::from(file));
                step.params
                    .insert("max_tokens".to_string(), Value::from(max_tokens));
                steps.push(step);
            };

        let models_id = if has_database {
            code_step(
                &mut steps,
                "models.py",
                "Create database models and schema (models.py)",
                256,
            );
            Some(steps.len())
        } else {
            None
        };

        code_step(
            &mut steps,
            "app.py",
            "Create backend app with routes (app.py)",
            384,
        );

        if let Some(models_id) = models_id {
            code_step(
                &mut steps,
                "init_db.py",
                "Create database initialization script (init_db.py)",
                192,
            );
            if let Some(step) = steps.last_mut() {
                step.depends_on.push(models_id);
            }
        }

        let mkdir_id = steps.len() + 1;
        let mut mkdir = TaskStep::new(
            mkdir_id,
            StepType::ToolCall,
            "Create templates and static directories",
        );
        mkdir.params.insert("tool".to_string(), Value::from("shell"));
        mkdir.params.insert("action".to_string(), Value::from("mkdir"));
        mkdir.params.insert(
            "paths".to_string(),
            Value::from(vec!["templates", "static/css", "static/js"]),
        );
        steps.push(mkdir);

        code_step(
            &mut steps,
            "templates/index.html",
            "Create HTML template (templates/index.html)",
            384,
        );
        code_step(
            &mut steps,
            "static/css/style.css",
            "Create CSS styles (static/css/style.css)",
            256,
        );
        code_step(
            &mut steps,
            "static/js/app.js",
            "Create JavaScript client (static/js/app.js)",
            384,
        );
        code_step(
            &mut steps,
            "README.md",
            "Generate README.md with setup instructions",
            192,
        );

        // Chunks run strictly in template order.
        for i in 1..steps.len() {
            let prev = steps[i - 1].id;
            let step = &mut steps[i];
            if !step.depends_on.contains(&prev) {
                step.depends_on.push(prev);
            }
        }

        let execution_order = steps.iter().map(|s| s.id).collect();
        TaskPlan {
            request: utterance.to_string(),
            steps,
            execution_order,
            is_sequential: true,
        }
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .any(|token| token == word)
        || (word.contains(' ') && haystack.contains(word))
}

/// Split a multi-clause utterance preserving order.
fn split_clauses(utterance: &str) -> Vec<String> {
    static CONNECTIVE_SPLIT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\b(?:and then|then|after that|followed by|next,?|finally|lastly|and also)\b")
            .unwrap()
    });

    if NUMBERED_ITEM.find_iter(utterance).count() >= 2 {
        let parts: Vec<String> = NUMBERED_ITEM
            .split(utterance)
            .map(|p| p.trim().trim_end_matches(',').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if !parts.is_empty() {
            return parts;
        }
    }

    let parts: Vec<String> = CONNECTIVE_SPLIT
        .split(utterance)
        .map(|p| {
            p.trim()
                .trim_start_matches(',')
                .trim()
                .to_string()
        })
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() {
        vec![utterance.to_string()]
    } else {
        parts
    }
}

/// Type a clause by re-running the router's deterministic rules on it.
fn classify_clause(id: usize, clause: &str) -> TaskStep {
    let intent = router::classify_fallback(clause);
    let step_type = match intent.intent {
        Intent::ToolCall => StepType::ToolCall,
        Intent::CodingTask => StepType::CodeGen,
        Intent::AlgorithmTask => StepType::Algorithm,
        Intent::SimpleAnswer | Intent::Unknown => StepType::SimpleAnswer,
    };

    let mut step = TaskStep::new(id, step_type, clause);
    step.params = intent.params;
    if let Some(tool) = intent.tool {
        step.params
            .insert("tool".to_string(), Value::from(tool.to_string()));
    }
    step
}
