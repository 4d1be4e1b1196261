//! Frozen pattern tables and the classification prompt for the intent
//! router's deterministic tier.

use once_cell::sync::Lazy;
use regex::Regex;

/// Instruction prepended to every tier-A classification call. The router
/// model must answer with a single JSON object.
pub const CLASSIFY_SYSTEM: &str = r#"Classify user requests as JSON. Output ONLY valid JSON, nothing else.

Format (JSON only, no explanation):
{"intent": "<type>", "confidence": <0-1>, "tool": "<tool|null>", "params": {}, "escalate": "<escalate|null>"}

Intent types: tool_call, simple_answer, coding_task, algorithm_task
Tools: git, shell, file, sqlite
Escalate: coder, algorithm

Examples:
User: git status
{"intent": "tool_call", "confidence": 0.99, "tool": "git", "params": {"action": "status"}, "escalate": null}

User: create test.py with hello world
{"intent": "coding_task", "confidence": 0.95, "tool": null, "params": {"filename": "test.py"}, "escalate": "coder"}

User: open calculator.py
{"intent": "tool_call", "confidence": 0.95, "tool": "file", "params": {"filename": "calculator.py", "action": "read"}, "escalate": null}

Classify (JSON only):"#;

pub fn classify_prompt(utterance: &str) -> String {
    format!("{}\n\nUser: {}\n\nClassification:", CLASSIFY_SYSTEM, utterance)
}

/// Rule-specific confidences for the deterministic tier.
pub const CONFIDENCE_TOOL: f32 = 0.95;
pub const CONFIDENCE_SIMPLE: f32 = 0.85;
pub const CONFIDENCE_CODING: f32 = 0.75;
pub const CONFIDENCE_ALGORITHM: f32 = 0.80;
/// Nothing matched: default simple answer at the unknown boundary.
pub const CONFIDENCE_DEFAULT: f32 = 0.50;

fn table(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

pub static GIT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    table(&[
        r"^git\s+(status|diff|log|add|commit|push|pull|clone|init)",
        r"^(status|commit|push|pull|clone)(\s|$)",
    ])
});

pub static SHELL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    table(&[
        r"^(mkdir|run|execute|install|pip|python|node|npm)\s+",
        r"^(pwd|tree)(\s|$)",
        r"^(ls|cd|echo)\s+",
    ])
});

pub static FILE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    table(&[
        r"^(read|show|display|cat|view|open)\s+.*\.(py|js|ts|css|html|json|md|txt)",
        r"^(list|show)\s+files",
        r"^(delete|remove|rm)\s+.*\.(py|js|ts|css|html|json|md|txt)",
        r"read\s+(the\s+)?.*file",
        r"^ls(\s|$)",
    ])
});

pub static SQLITE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    table(&[
        r"(query|select from|schema of)\s+.*\.(db|sqlite3?)",
        r"^(show|list)\s+tables",
    ])
});

pub static CODING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    table(&[
        r"(create|write|generate|make)\s+.*\.(py|js|ts|css|html|json|md|txt)",
        r"(edit|modify|update|change|fix)\s+.*\.(py|js|ts|css|html|json|md|txt)",
        r"(refactor|improve)\s+",
        r"(add|implement|build|create|write|generate)\s+(a\s+)?\w*\s*(function|class|method|feature|script|app|program)",
        r"(write|create|make).*code",
        r"code\s+(that|for|to)\s+",
    ])
});

pub static ALGORITHM_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    table(&[
        r"binary search|quicksort|mergesort|heapsort|bubble sort|\bsort\b",
        r"\b(graph|tree|heap|stack|queue|linked list|hash(\s+table)?)\b",
        r"dynamic programming|greedy|divide and conquer",
        r"\b(algorithm|data structure|complexity)\b|O\([^)]*\)",
        r"\b(parser|state machine)\b|optimize\s+performance|\boptimize\b",
    ])
});

pub static SIMPLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    table(&[
        r"^(what is|what are|what's|how do|how does|why|explain)\s+",
        r"^(can you|could you)\s+(tell|explain|describe)",
        r"^(help|guide|show me how)(\s|$)",
    ])
});

static FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z0-9_./-]+\.(?:py|js|ts|css|html|json|md|txt|db|sqlite3?))").unwrap()
});
static NAMED_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)file\s+(?:called\s+|named\s+)?([A-Za-z0-9_.-]+)").unwrap());

/// Pull a concrete filename out of the utterance, if any.
pub fn extract_filename(utterance: &str) -> Option<String> {
    if let Some(cap) = FILENAME.captures(utterance) {
        return Some(cap[1].to_string());
    }
    NAMED_FILE
        .captures(utterance)
        .map(|cap| cap[1].to_string())
}

const GIT_ACTIONS: &[&str] = &[
    "status", "diff", "log", "add", "commit", "push", "pull", "clone", "init",
];

/// Which git verb the utterance names; `status` when none is explicit.
pub fn extract_git_action(utterance: &str) -> &'static str {
    let lower = utterance.to_lowercase();
    GIT_ACTIONS
        .iter()
        .find(|action| lower.contains(*action))
        .copied()
        .unwrap_or("status")
}
