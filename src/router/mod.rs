//! Intent router — turns one utterance into a typed intent.
//!
//! Tier A prompts the always-resident router engine for a JSON
//! classification; tier B is a frozen, ordered pattern table that fires
//! when the model is unavailable, unparseable, or unsure. Tier B is also
//! reused by the task planner to type individual plan clauses.

pub mod patterns;

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ErrorKind;
use crate::executor::ToolKind;
use crate::lifecycle::{LifecycleManager, Role};

use patterns::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    ToolCall,
    SimpleAnswer,
    CodingTask,
    AlgorithmTask,
    Unknown,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Intent::ToolCall => "tool_call",
            Intent::SimpleAnswer => "simple_answer",
            Intent::CodingTask => "coding_task",
            Intent::AlgorithmTask => "algorithm_task",
            Intent::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct IntentResult {
    pub intent: Intent,
    /// Always within [0, 1].
    pub confidence: f32,
    /// Some iff `intent == ToolCall`.
    pub tool: Option<ToolKind>,
    pub params: Map<String, Value>,
    pub escalate_to: Option<Role>,
    /// True iff the deterministic tier produced this result.
    pub fallback_used: bool,
}

impl IntentResult {
    fn new(intent: Intent, confidence: f32) -> Self {
        Self {
            intent,
            confidence: confidence.clamp(0.0, 1.0),
            tool: None,
            params: Map::new(),
            escalate_to: None,
            fallback_used: false,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Above this, non-destructive side effects execute without a preview.
pub const EXECUTE_THRESHOLD: f32 = 0.95;

/// Max context fed to the classifier, at ~4 chars per token.
const CLASSIFY_CONTEXT_TOKENS: usize = 2048;
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IntentRouter {
    lifecycle: Arc<LifecycleManager>,
    /// Tier-A results below this drop to the deterministic tier.
    accept_threshold: f32,
}

impl IntentRouter {
    pub fn new(lifecycle: Arc<LifecycleManager>, accept_threshold: f32) -> Self {
        Self {
            lifecycle,
            accept_threshold,
        }
    }

    /// Classify one utterance. Never fails: any tier-A problem drops to
    /// the pattern tier.
    pub async fn classify(&self, utterance: &str) -> IntentResult {
        match self.classify_with_model(utterance).await {
            Ok(result) if result.confidence >= self.accept_threshold => result,
            Ok(result) => {
                debug!(confidence = result.confidence, "tier-A confidence too low");
                classify_fallback(utterance)
            }
            Err(err) => {
                debug!(error = %err, "tier-A classification unavailable");
                classify_fallback(utterance)
            }
        }
    }

    async fn classify_with_model(&self, utterance: &str) -> anyhow::Result<IntentResult> {
        let budget_chars = CLASSIFY_CONTEXT_TOKENS * 4;
        let clipped: String = utterance.chars().take(budget_chars).collect();
        let prompt = classify_prompt(&clipped);

        let mut opts = self.lifecycle.policy_options(Role::Router);
        opts.max_tokens = 150;
        opts.temperature = 0.1;
        opts.stop = vec!["User:".to_string(), "\n\n".to_string()];
        opts.deadline = CLASSIFY_TIMEOUT;

        let raw = self
            .lifecycle
            .generate_with(Role::Router, &prompt, &opts, None)
            .await?;
        parse_classification(&raw)
    }
}

#[derive(Debug, Deserialize)]
struct WireClassification {
    intent: String,
    confidence: f32,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    escalate: Option<String>,
}

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Parse the model's JSON reply. Any structural problem is a
/// `SchemaMismatch` so the caller can fall through to tier B.
pub fn parse_classification(raw: &str) -> anyhow::Result<IntentResult> {
    let json_str = JSON_OBJECT
        .find(raw)
        .map(|m| m.as_str())
        .unwrap_or(raw.trim());

    let wire: WireClassification = serde_json::from_str(json_str).map_err(|e| {
        anyhow::Error::new(ErrorKind::SchemaMismatch(format!(
            "classification is not valid JSON: {}",
            e
        )))
    })?;

    let intent = match wire.intent.as_str() {
        "tool_call" => Intent::ToolCall,
        "simple_answer" => Intent::SimpleAnswer,
        "coding_task" => Intent::CodingTask,
        "algorithm_task" => Intent::AlgorithmTask,
        other => {
            return Err(anyhow::Error::new(ErrorKind::SchemaMismatch(format!(
                "unknown intent '{}'",
                other
            ))))
        }
    };

    let tool = match (&intent, wire.tool.as_deref()) {
        (Intent::ToolCall, Some(name)) => {
            let normalized = crate::executor::normalize_alias(name).ok_or_else(|| {
                anyhow::Error::new(ErrorKind::SchemaMismatch(format!("unknown tool '{}'", name)))
            })?;
            Some(normalized.tool)
        }
        (Intent::ToolCall, None) => {
            return Err(anyhow::Error::new(ErrorKind::SchemaMismatch(
                "tool_call without a tool".to_string(),
            )))
        }
        // Invariant: a tool only accompanies a tool call.
        (_, _) => None,
    };

    let escalate_to = match wire.escalate.as_deref() {
        Some("coder") => Some(Role::Coder),
        Some("algorithm") => Some(Role::Algorithm),
        _ => None,
    };

    Ok(IntentResult {
        intent,
        confidence: wire.confidence.clamp(0.0, 1.0),
        tool,
        params: wire.params,
        escalate_to,
        fallback_used: false,
    })
}

/// Tier B: the frozen, ordered rule table. The first matching family
/// fixes the intent; confidences are rule-family constants.
pub fn classify_fallback(utterance: &str) -> IntentResult {
    let lower = utterance.trim().to_lowercase();

    if GIT_PATTERNS.iter().any(|p| p.is_match(&lower)) {
        let mut result = IntentResult::new(Intent::ToolCall, CONFIDENCE_TOOL);
        result.tool = Some(ToolKind::Git);
        result.params.insert(
            "action".to_string(),
            Value::from(extract_git_action(utterance)),
        );
        result
            .params
            .insert("raw_command".to_string(), Value::from(utterance));
        result.fallback_used = true;
        return result;
    }

    if SHELL_PATTERNS.iter().any(|p| p.is_match(&lower)) {
        let mut result = IntentResult::new(Intent::ToolCall, CONFIDENCE_TOOL);
        result.tool = Some(ToolKind::Shell);
        result
            .params
            .insert("command".to_string(), Value::from(utterance));
        result.fallback_used = true;
        return result;
    }

    if FILE_PATTERNS.iter().any(|p| p.is_match(&lower)) {
        let mut result = IntentResult::new(Intent::ToolCall, CONFIDENCE_TOOL);
        result.tool = Some(ToolKind::File);
        let action = if lower.starts_with("delete") || lower.starts_with("remove") || lower.starts_with("rm")
        {
            "delete"
        } else if lower.contains("files") || lower.starts_with("ls") {
            "list"
        } else {
            "read"
        };
        result.params.insert("action".to_string(), Value::from(action));
        if let Some(filename) = extract_filename(utterance) {
            result
                .params
                .insert("filename".to_string(), Value::from(filename));
        }
        result.fallback_used = true;
        return result;
    }

    if SQLITE_PATTERNS.iter().any(|p| p.is_match(&lower)) {
        let mut result = IntentResult::new(Intent::ToolCall, CONFIDENCE_TOOL);
        result.tool = Some(ToolKind::Sqlite);
        if let Some(filename) = extract_filename(utterance) {
            result.params.insert("path".to_string(), Value::from(filename));
        }
        result.fallback_used = true;
        return result;
    }

    if SIMPLE_PATTERNS.iter().any(|p| p.is_match(&lower)) {
        let mut result = IntentResult::new(Intent::SimpleAnswer, CONFIDENCE_SIMPLE);
        result
            .params
            .insert("question".to_string(), Value::from(utterance));
        result.fallback_used = true;
        return result;
    }

    if CODING_PATTERNS.iter().any(|p| p.is_match(&lower)) {
        let mut result = IntentResult::new(Intent::CodingTask, CONFIDENCE_CODING);
        if let Some(filename) = extract_filename(utterance) {
            result
                .params
                .insert("filename".to_string(), Value::from(filename));
        }
        result.params.insert("task".to_string(), Value::from(utterance));
        // A coding request about algorithmic material goes straight to
        // the specialist.
        result.escalate_to = if ALGORITHM_PATTERNS.iter().any(|p| p.is_match(&lower)) {
            Some(Role::Algorithm)
        } else {
            Some(Role::Coder)
        };
        result.fallback_used = true;
        return result;
    }

    if ALGORITHM_PATTERNS.iter().any(|p| p.is_match(&lower)) {
        let mut result = IntentResult::new(Intent::AlgorithmTask, CONFIDENCE_ALGORITHM);
        result.params.insert("task".to_string(), Value::from(utterance));
        result.escalate_to = Some(Role::Algorithm);
        result.fallback_used = true;
        return result;
    }

    let mut result = IntentResult::new(Intent::SimpleAnswer, CONFIDENCE_DEFAULT);
    result
        .params
        .insert("question".to_string(), Value::from(utterance));
    result.fallback_used = true;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_models_config, ScriptedLoader};

    fn fallback(utterance: &str) -> IntentResult {
        let result = classify_fallback(utterance);
        assert!(result.fallback_used);
        assert!((0.0..=1.0).contains(&result.confidence));
        // Invariant: tool present exactly for tool calls.
        assert_eq!(result.tool.is_some(), result.intent == Intent::ToolCall);
        result
    }

    #[test]
    fn git_status_is_a_high_confidence_tool_call() {
        let result = fallback("git status");
        assert_eq!(result.intent, Intent::ToolCall);
        assert_eq!(result.tool, Some(ToolKind::Git));
        assert_eq!(result.param_str("action"), Some("status"));
        assert!(result.confidence >= 0.95);
    }

    #[test]
    fn create_file_is_a_coding_task() {
        let result = fallback("create calc.py with add and sub functions");
        assert_eq!(result.intent, Intent::CodingTask);
        assert!(result.confidence >= 0.75);
        assert_eq!(result.param_str("filename"), Some("calc.py"));
        assert_eq!(result.escalate_to, Some(Role::Coder));
    }

    #[test]
    fn binary_search_is_an_algorithm_task() {
        let result = fallback("implement binary search with O(log n) complexity");
        assert_eq!(result.intent, Intent::AlgorithmTask);
        assert_eq!(result.escalate_to, Some(Role::Algorithm));
        assert!((result.confidence - 0.80).abs() < f32::EPSILON);
    }

    #[test]
    fn coding_task_with_algorithm_keywords_escalates_to_specialist() {
        let result = fallback("create sort.py implementing quicksort");
        assert_eq!(result.intent, Intent::CodingTask);
        assert_eq!(result.escalate_to, Some(Role::Algorithm));
    }

    #[test]
    fn question_prefixes_are_simple_answers() {
        let result = fallback("what is a borrow checker");
        assert_eq!(result.intent, Intent::SimpleAnswer);
        assert!((result.confidence - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn unmatched_input_defaults_to_the_unknown_boundary() {
        let result = fallback("hmm quite puzzling indeed");
        assert_eq!(result.intent, Intent::SimpleAnswer);
        assert!((result.confidence - 0.50).abs() < f32::EPSILON);
    }

    #[test]
    fn file_read_and_delete_actions() {
        let read = fallback("open calculator.py");
        assert_eq!(read.tool, Some(ToolKind::File));
        assert_eq!(read.param_str("action"), Some("read"));

        let delete = fallback("delete old_notes.txt");
        assert_eq!(delete.param_str("action"), Some("delete"));

        let list = fallback("ls");
        assert_eq!(list.tool, Some(ToolKind::File));
        assert_eq!(list.param_str("action"), Some("list"));
    }

    #[test]
    fn parse_accepts_json_wrapped_in_prose() {
        let raw = "Sure! {\"intent\": \"tool_call\", \"confidence\": 0.92, \"tool\": \"git\", \"params\": {\"action\": \"status\"}, \"escalate\": null} done";
        let result = parse_classification(raw).unwrap();
        assert_eq!(result.intent, Intent::ToolCall);
        assert_eq!(result.tool, Some(ToolKind::Git));
        assert!(!result.fallback_used);
    }

    #[test]
    fn parse_rejects_tool_call_without_tool() {
        let raw = "{\"intent\": \"tool_call\", \"confidence\": 0.9}";
        let err = parse_classification(raw).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(ErrorKind::SchemaMismatch(_))
        ));
    }

    #[test]
    fn parse_clamps_confidence() {
        let raw = "{\"intent\": \"simple_answer\", \"confidence\": 3.5}";
        let result = parse_classification(raw).unwrap();
        assert!((result.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_drops_tool_on_non_tool_intents() {
        let raw = "{\"intent\": \"coding_task\", \"confidence\": 0.8, \"tool\": \"git\"}";
        let result = parse_classification(raw).unwrap();
        assert_eq!(result.tool, None);
    }

    #[tokio::test]
    async fn tier_a_result_is_used_when_confident() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ScriptedLoader::with_responses(vec![
            "{\"intent\": \"simple_answer\", \"confidence\": 0.97, \"params\": {}}".to_string(),
        ]);
        let lifecycle = Arc::new(LifecycleManager::new(
            &test_models_config(dir.path()),
            6000,
            Box::new(loader),
        ));
        let router = IntentRouter::new(lifecycle, 0.50);

        let result = router.classify("tell me something").await;
        assert_eq!(result.intent, Intent::SimpleAnswer);
        assert!(!result.fallback_used);
    }

    #[tokio::test]
    async fn unparseable_model_output_falls_back_to_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let loader =
            ScriptedLoader::with_responses(vec!["I think this is about git?".to_string()]);
        let lifecycle = Arc::new(LifecycleManager::new(
            &test_models_config(dir.path()),
            6000,
            Box::new(loader),
        ));
        let router = IntentRouter::new(lifecycle, 0.50);

        let result = router.classify("git status").await;
        assert!(result.fallback_used);
        assert_eq!(result.tool, Some(ToolKind::Git));
    }

    #[tokio::test]
    async fn low_tier_a_confidence_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ScriptedLoader::with_responses(vec![
            "{\"intent\": \"coding_task\", \"confidence\": 0.2}".to_string(),
        ]);
        let lifecycle = Arc::new(LifecycleManager::new(
            &test_models_config(dir.path()),
            6000,
            Box::new(loader),
        ));
        let router = IntentRouter::new(lifecycle, 0.50);

        let result = router.classify("git status").await;
        assert!(result.fallback_used);
    }
}
