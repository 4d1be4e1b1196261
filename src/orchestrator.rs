//! Orchestrator — composes the pipeline: plan detection, intent
//! classification, tool execution or specialist generation, escalation,
//! and formatting.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::editor;
use crate::engine::{EngineLoader, GenerateOptions};
use crate::error::ErrorKind;
use crate::executor::{
    normalize_alias, shell, side_effect, SideEffect, ToolExecutor, ToolKind,
};
use crate::extractor::{self, ContentKind};
use crate::formatter;
use crate::lifecycle::{LifecycleManager, Role};
use crate::permission::{Category, Decision, PermissionGate, PermissionRequest, Prompter};
use crate::planner::{StepStatus, StepType, TaskPlanner, TaskStep};
use crate::router::{Intent, IntentResult, IntentRouter};
use crate::streaming::{FenceBuffer, StreamingWriter};
use crate::types::{AlgorithmResult, AlgorithmTask, CodeResult, CodingTask, TaskKind};

const ALGORITHM_DEADLINE: Duration = Duration::from_secs(600);
const SIMPLE_ANSWER_TOKENS: usize = 256;
/// Marker the coder emits when the problem needs the specialist.
const SPECIALIST_MARKER: &str = "NEEDS_ALGORITHM_SPECIALIST";

/// What one `process` call produced. `denied` distinguishes "the user
/// said no" for the process exit code; `failed` marks outcomes that
/// count as step failures inside a plan.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub text: String,
    pub denied: bool,
    pub failed: bool,
}

impl ProcessOutcome {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            denied: false,
            failed: false,
        }
    }

    fn denied(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            denied: true,
            failed: true,
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            denied: false,
            failed: true,
        }
    }
}

pub struct Orchestrator {
    config: AppConfig,
    lifecycle: Arc<LifecycleManager>,
    router: IntentRouter,
    executor: ToolExecutor,
    gate: PermissionGate,
    planner: TaskPlanner,
    /// Cancellation root for the in-flight request; replaced per call.
    cancel: std::sync::Mutex<CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        loader: Box<dyn EngineLoader>,
        prompter: Box<dyn Prompter>,
    ) -> anyhow::Result<Self> {
        let workspace = config.workspace_path();
        std::fs::create_dir_all(&workspace)?;

        let lifecycle = Arc::new(LifecycleManager::new(
            &config.models,
            config.memory_budget_mb,
            loader,
        ));
        let router = IntentRouter::new(lifecycle.clone(), config.thresholds.unknown);
        let executor = ToolExecutor::new(workspace, config.allow_shell);
        let gate = PermissionGate::new(prompter, config.require_confirmation);

        Ok(Self {
            config,
            lifecycle,
            router,
            executor,
            gate,
            planner: TaskPlanner::new(),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        })
    }

    /// Cancel the in-flight request; generation observes the signal
    /// within a second.
    pub fn cancel_current(&self) {
        self.cancel.lock().expect("cancel lock").cancel();
    }

    fn begin_request(&self) {
        *self.cancel.lock().expect("cancel lock") = CancellationToken::new();
    }

    fn child_cancel(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel lock").child_token()
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    #[cfg(test)]
    pub(crate) fn workspace(&self) -> &PathBuf {
        self.executor.workspace()
    }

    /// The single entry point: one utterance in, rendered text out.
    pub async fn process(&self, utterance: &str) -> ProcessOutcome {
        self.begin_request();
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return ProcessOutcome::ok(formatter::format_unknown(utterance));
        }

        if self.planner.needs_planning(utterance) {
            return self.run_plan(utterance).await;
        }
        self.handle_single(utterance).await
    }

    async fn handle_single(&self, utterance: &str) -> ProcessOutcome {
        let intent = self.router.classify(utterance).await;
        info!(
            intent = %intent.intent,
            confidence = intent.confidence,
            fallback = intent.fallback_used,
            "classified"
        );
        self.dispatch(utterance, intent).await
    }

    async fn dispatch(&self, utterance: &str, intent: IntentResult) -> ProcessOutcome {
        if intent.intent == Intent::Unknown || intent.confidence < self.config.thresholds.unknown {
            return ProcessOutcome::ok(formatter::format_unknown(utterance));
        }
        if intent.confidence < self.config.thresholds.clarify {
            let candidates = [
                (intent.intent, intent.confidence),
                (second_candidate(intent.intent), 0.0),
            ];
            return ProcessOutcome::ok(formatter::format_clarification(utterance, &candidates));
        }

        match intent.intent {
            Intent::ToolCall => self.handle_tool_call(utterance, &intent).await,
            Intent::SimpleAnswer => self.handle_simple_answer(utterance).await,
            Intent::CodingTask => {
                if intent.escalate_to == Some(Role::Algorithm) {
                    self.handle_algorithm_task(utterance, &intent).await
                } else {
                    self.handle_coding_task(utterance, &intent, None).await
                }
            }
            Intent::AlgorithmTask => self.handle_algorithm_task(utterance, &intent).await,
            Intent::Unknown => ProcessOutcome::ok(formatter::format_unknown(utterance)),
        }
    }

    // ----- tool calls ---------------------------------------------------

    async fn handle_tool_call(&self, utterance: &str, intent: &IntentResult) -> ProcessOutcome {
        let Some(tool) = intent.tool else {
            return ProcessOutcome::ok(formatter::format_unknown(utterance));
        };

        let (action, params) = match self.tool_request(tool, intent) {
            Ok(pair) => pair,
            Err(err) => return ProcessOutcome::error(formatter::format_error(&err.to_string())),
        };

        self.execute_gated(tool, &action, &params, intent.confidence)
            .await
    }

    /// Build the concrete (action, params) for a classified tool call.
    fn tool_request(
        &self,
        tool: ToolKind,
        intent: &IntentResult,
    ) -> anyhow::Result<(String, Value)> {
        match tool {
            ToolKind::Git => {
                let action = intent.param_str("action").unwrap_or("status").to_string();
                let params = if action == "commit" {
                    let message = intent
                        .param_str("raw_command")
                        .unwrap_or("checkpoint")
                        .to_string();
                    json!({ "message": message })
                } else {
                    json!({})
                };
                Ok((action, params))
            }
            ToolKind::Shell => {
                let raw = intent
                    .param_str("command")
                    .ok_or_else(|| anyhow::anyhow!("shell call without a command"))?;
                // `mkdir [-p] a b c` becomes one batched mkdir action so
                // the gate can fold it into a single prompt.
                if let Some(rest) = raw.trim().strip_prefix("mkdir ") {
                    let mut parents = false;
                    let mut paths = Vec::new();
                    for token in rest.split_whitespace() {
                        if token == "-p" {
                            parents = true;
                        } else {
                            paths.push(token.to_string());
                        }
                    }
                    return Ok((
                        "mkdir".to_string(),
                        json!({ "paths": paths, "parents": parents }),
                    ));
                }
                Ok(("run".to_string(), json!({ "command": rewrite_run(raw) })))
            }
            ToolKind::File => {
                let action = intent.param_str("action").unwrap_or("read").to_string();
                let mut params = Map::new();
                if let Some(filename) = intent.param_str("filename") {
                    params.insert("path".to_string(), Value::from(filename));
                }
                Ok((action, Value::Object(params)))
            }
            ToolKind::Sqlite => {
                let action = if intent.params.contains_key("sql") {
                    "query"
                } else {
                    "schema"
                };
                Ok((action.to_string(), Value::Object(intent.params.clone())))
            }
        }
    }

    /// Classify the side effect, consult the permission gate, execute.
    async fn execute_gated(
        &self,
        tool: ToolKind,
        action: &str,
        params: &Value,
        confidence: f32,
    ) -> ProcessOutcome {
        let Some(mut effect) = side_effect(tool, action) else {
            return ProcessOutcome::error(formatter::format_error(
                &ErrorKind::UnknownAction {
                    tool: tool.to_string(),
                    action: action.to_string(),
                }
                .to_string(),
            ));
        };

        // Shell refinements: forbidden commands never reach a prompt, and
        // read-only prefixes don't need one.
        if tool == ToolKind::Shell && action == "run" {
            let command = params["command"].as_str().unwrap_or("");
            if let Some(reason) = shell::forbidden_reason(command) {
                return ProcessOutcome::error(formatter::format_error(
                    &ErrorKind::Forbidden(reason.to_string()).to_string(),
                ));
            }
            if shell::is_safe_readonly(command) {
                effect = SideEffect::Read;
            }
        }

        let decision = if effect.needs_permission() {
            let request = self.permission_request(tool, action, params, effect, confidence);
            match self.gate.request(&request) {
                Ok(decision) => decision,
                Err(err) => {
                    return ProcessOutcome::error(formatter::format_error(&err.to_string()))
                }
            }
        } else {
            Decision::AllowOnce
        };

        if decision == Decision::Deny {
            return ProcessOutcome::denied(formatter::format_error(
                &ErrorKind::PermissionDenied(format!("{}.{}", tool, action)).to_string(),
            ));
        }

        let result = self.executor.execute(tool, action, params, decision).await;
        let mut failed = !result.success;
        // A non-zero exit is a subprocess failure as far as plans care.
        if tool == ToolKind::Shell && action == "run" {
            failed = failed || result.output["exit_code"].as_i64().unwrap_or(0) != 0;
        }
        ProcessOutcome {
            text: formatter::format_tool_result(&result),
            denied: false,
            failed,
        }
    }

    fn permission_request(
        &self,
        tool: ToolKind,
        action: &str,
        params: &Value,
        effect: SideEffect,
        confidence: f32,
    ) -> PermissionRequest {
        let (category, description) = match (tool, action) {
            (ToolKind::Shell, "mkdir") => {
                let paths: Vec<String> = params["paths"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                return PermissionRequest::directories(&paths);
            }
            (ToolKind::Shell, _) => {
                let command = params["command"].as_str().unwrap_or("");
                let category = if command.contains("pip install") || command.contains("npm install")
                {
                    Category::Install
                } else {
                    Category::Shell
                };
                (category, format!("run `{}`", command))
            }
            (ToolKind::File, "delete") => (
                Category::FileDelete,
                format!("delete {}", params["path"].as_str().unwrap_or("?")),
            ),
            (ToolKind::File, _) => (
                Category::FileWrite,
                format!("write {}", params["path"].as_str().unwrap_or("?")),
            ),
            (ToolKind::Git, _) => (Category::GitWrite, format!("git {}", action)),
            (ToolKind::Sqlite, _) => (Category::Shell, format!("sqlite {}", action)),
        };

        let mut request = PermissionRequest::new(category, description);
        if effect == SideEffect::Destructive {
            request = request.destructive();
        }
        // Mid-band confidence executes with a preview attached.
        if confidence < crate::router::EXECUTE_THRESHOLD {
            if let Some(content) = params["content"].as_str() {
                request = request.with_preview(preview_of(content));
            }
        }
        request
    }

    // ----- simple answers ----------------------------------------------

    /// Simple answers stay on the router engine. No escalation.
    async fn handle_simple_answer(&self, utterance: &str) -> ProcessOutcome {
        let prompt = format!(
            "Answer the question briefly and factually in a few sentences.\n\nQuestion: {}\n\nAnswer:",
            utterance
        );
        let mut opts = self.lifecycle.policy_options(Role::Router);
        opts.max_tokens = SIMPLE_ANSWER_TOKENS;
        opts.deadline = Duration::from_secs(self.config.generation_timeout_sec);
        opts.cancel = self.child_cancel();

        match self
            .lifecycle
            .generate_with(Role::Router, &prompt, &opts, None)
            .await
        {
            Ok(answer) => ProcessOutcome::ok(formatter::format_simple_answer(&answer)),
            Err(err) => ProcessOutcome::error(formatter::format_error(&err.to_string())),
        }
    }

    // ----- coding tasks -------------------------------------------------

    async fn handle_coding_task(
        &self,
        utterance: &str,
        intent: &IntentResult,
        max_tokens: Option<usize>,
    ) -> ProcessOutcome {
        let target = intent
            .param_str("filename")
            .or_else(|| intent.param_str("file"))
            .map(PathBuf::from);

        let Some(target) = target else {
            // No concrete file named: answer in chat instead of guessing
            // a path to write.
            return self.explain_code(utterance).await;
        };

        let existing_path = self.executor.workspace().join(&target);
        let task = if existing_path.exists() {
            let existing = match tokio::fs::read_to_string(&existing_path).await {
                Ok(content) => content,
                Err(err) => return ProcessOutcome::error(formatter::format_error(&err.to_string())),
            };
            CodingTask::edit(target.clone(), existing, utterance)
        } else {
            CodingTask::create(target.clone(), utterance)
        };

        match task.task_type {
            TaskKind::Edit => self.run_edit_task(&task).await,
            _ => self.run_create_task(&task, Role::Coder, max_tokens).await,
        }
    }

    /// Full-file generation with streaming into a `.part` file. The
    /// rename only happens after the user allows the write.
    async fn run_create_task(
        &self,
        task: &CodingTask,
        role: Role,
        max_tokens: Option<usize>,
    ) -> ProcessOutcome {
        let target = task.target_files[0].clone();
        let absolute = self.executor.workspace().join(&target);
        let kind = ContentKind::from_path(&target);

        let prompt = create_prompt(&target, &task.instructions, kind);
        let mut opts = self.lifecycle.policy_options(role);
        if let Some(max_tokens) = max_tokens {
            opts.max_tokens = max_tokens;
        }
        opts.deadline = Duration::from_secs(self.config.generation_timeout_sec);
        opts.cancel = self.child_cancel();

        let mut raw = match self.generate_streaming(role, &prompt, &opts, &absolute).await {
            Ok(raw) => raw,
            Err(err) => return ProcessOutcome::error(formatter::format_error(&err.to_string())),
        };

        if raw.contains(SPECIALIST_MARKER) {
            debug!("coder deferred to algorithm specialist");
            let intent = IntentResult {
                intent: Intent::AlgorithmTask,
                confidence: 1.0,
                tool: None,
                params: {
                    let mut params = Map::new();
                    params.insert(
                        "filename".to_string(),
                        Value::from(target.display().to_string()),
                    );
                    params
                },
                escalate_to: Some(Role::Algorithm),
                fallback_used: false,
            };
            return self.handle_algorithm_task(&task.instructions, &intent).await;
        }

        let mut extraction = extractor::extract(&raw, kind);
        if extraction.is_none() {
            // One retry with a clarified prompt before giving up.
            debug!("no usable content extracted; retrying with a clarified prompt");
            let clarified = format!(
                "{}\n\nYour previous reply contained no usable fenced code block. \
                 Reply again with ONLY the fenced code block.",
                prompt
            );
            raw = match self
                .generate_streaming(role, &clarified, &opts, &absolute)
                .await
            {
                Ok(raw) => raw,
                Err(err) => return ProcessOutcome::error(formatter::format_error(&err.to_string())),
            };
            extraction = extractor::extract(&raw, kind);
        }
        let Some(extraction) = extraction else {
            self.discard_part(&absolute).await;
            return ProcessOutcome::error(formatter::format_error(
                &ErrorKind::ValidationFailed(format!(
                    "no {} content found in the model output",
                    kind.fence_label()
                ))
                .to_string(),
            ));
        };

        // Gate the write with the extracted content as preview.
        let request = PermissionRequest::new(
            Category::FileWrite,
            format!("create {}", target.display()),
        )
        .with_preview(preview_of(&extraction.content));
        match self.gate.request(&request) {
            Ok(Decision::Deny) => {
                self.discard_part(&absolute).await;
                return ProcessOutcome::denied(formatter::format_error(
                    &ErrorKind::PermissionDenied(format!("create {}", target.display()))
                        .to_string(),
                ));
            }
            Ok(_) => {}
            Err(err) => {
                self.discard_part(&absolute).await;
                return ProcessOutcome::error(formatter::format_error(&err.to_string()));
            }
        }

        if let Err(err) = self.commit_content(&absolute, &extraction.content).await {
            return ProcessOutcome::error(formatter::format_error(&err.to_string()));
        }

        let mut result = CodeResult {
            success: true,
            ..Default::default()
        };
        result.files.insert(target, extraction.content);
        result
            .metadata
            .insert("confidence".to_string(), json!(extraction.confidence));
        ProcessOutcome::ok(formatter::format_code_result(&result, task))
    }

    /// Diff-mode editing with one retry on invalid blocks.
    async fn run_edit_task(&self, task: &CodingTask) -> ProcessOutcome {
        let target = task.target_files[0].clone();
        let absolute = self.executor.workspace().join(&target);
        let existing = task.existing_code.get(&target).cloned().unwrap_or_default();

        let mut opts = self.lifecycle.policy_options(Role::Coder);
        opts.deadline = Duration::from_secs(self.config.generation_timeout_sec);
        opts.cancel = self.child_cancel();

        let mut prompt = editor::build_edit_prompt(&target, &existing, &task.instructions);
        let mut blocks = Vec::new();
        let mut last_errors = Vec::new();

        // One retry with a clarified prompt on recoverable failures.
        for attempt in 0..2 {
            let raw = match self
                .lifecycle
                .generate_with(Role::Coder, &prompt, &opts, None)
                .await
            {
                Ok(raw) => raw,
                Err(err) => return ProcessOutcome::error(formatter::format_error(&err.to_string())),
            };

            let parsed = editor::parse_edit_blocks(&raw);
            if parsed.is_empty() {
                last_errors = vec!["no EDIT blocks found in the response".to_string()];
            } else {
                last_errors = editor::validate_edits(&existing, &parsed);
                if last_errors.is_empty() {
                    blocks = parsed;
                    break;
                }
            }

            if attempt == 0 {
                debug!(errors = ?last_errors, "edit blocks rejected; retrying");
                prompt = format!(
                    "{}\n\nYour previous reply was invalid:\n{}\nReply again with corrected EDIT blocks.",
                    editor::build_edit_prompt(&target, &existing, &task.instructions),
                    last_errors.join("\n")
                );
            }
        }

        if blocks.is_empty() {
            return ProcessOutcome::error(formatter::format_error(
                &ErrorKind::ValidationFailed(last_errors.join("; ")).to_string(),
            ));
        }

        let updated = editor::apply_edits(&existing, &blocks);
        let savings = editor::estimate_savings(&existing, &blocks);
        let diff = editor::unified_diff(&existing, &updated, &target.display().to_string());

        let request = PermissionRequest::new(
            Category::FileWrite,
            format!("edit {}", target.display()),
        )
        .with_preview(diff);
        match self.gate.request(&request) {
            Ok(Decision::Deny) => {
                return ProcessOutcome::denied(formatter::format_error(
                    &ErrorKind::PermissionDenied(format!("edit {}", target.display())).to_string(),
                ))
            }
            Ok(_) => {}
            Err(err) => return ProcessOutcome::error(formatter::format_error(&err.to_string())),
        }

        // Backup, then atomic write through the file tool.
        let write = self
            .executor
            .execute(
                ToolKind::File,
                "write",
                &json!({"path": absolute.display().to_string(), "content": updated}),
                Decision::AllowOnce,
            )
            .await;
        if !write.success {
            return ProcessOutcome::ok(formatter::format_tool_result(&write));
        }

        let mut result = CodeResult {
            success: true,
            edits: blocks,
            ..Default::default()
        };
        result
            .metadata
            .insert("savings_pct".to_string(), json!(savings.savings_pct));
        let mut text = formatter::format_code_result(&result, task);
        text.push_str(&format!(
            "\nDiff mode saved ~{:.0}% of the tokens a full rewrite would need.",
            savings.savings_pct.max(0.0)
        ));
        ProcessOutcome::ok(text)
    }

    /// Coding question with no target file: answer with code in chat.
    async fn explain_code(&self, utterance: &str) -> ProcessOutcome {
        let prompt = format!(
            "You are a coding assistant. {}\n\nReply with a short explanation and a fenced code block when code is needed.",
            utterance
        );
        let mut opts = self.lifecycle.policy_options(Role::Coder);
        opts.deadline = Duration::from_secs(self.config.generation_timeout_sec);
        opts.cancel = self.child_cancel();

        match self
            .lifecycle
            .generate_with(Role::Coder, &prompt, &opts, None)
            .await
        {
            Ok(answer) => ProcessOutcome::ok(formatter::format_simple_answer(&answer)),
            Err(err) => ProcessOutcome::error(formatter::format_error(&err.to_string())),
        }
    }

    // ----- algorithm tasks ----------------------------------------------

    async fn handle_algorithm_task(
        &self,
        utterance: &str,
        intent: &IntentResult,
    ) -> ProcessOutcome {
        // The coder and the algorithm engine are never assumed to be
        // co-resident; switch unloads the coder under budget pressure.
        if let Err(err) = self.lifecycle.switch(Role::Coder, Role::Algorithm).await {
            return ProcessOutcome::error(formatter::format_error(&err.to_string()));
        }

        let target = intent
            .param_str("filename")
            .or_else(|| intent.param_str("file"))
            .map(PathBuf::from);

        let prompt = algorithm_prompt(utterance, target.as_deref());
        let mut opts = self.lifecycle.policy_options(Role::Algorithm);
        opts.deadline = ALGORITHM_DEADLINE;
        opts.cancel = self.child_cancel();

        let raw = match self
            .lifecycle
            .generate_with(Role::Algorithm, &prompt, &opts, None)
            .await
        {
            Ok(raw) => raw,
            Err(err) => return ProcessOutcome::error(formatter::format_error(&err.to_string())),
        };

        let complexity = parse_complexity(&raw);
        let kind = target
            .as_deref()
            .map(ContentKind::from_path)
            .unwrap_or(ContentKind::Py);
        let extraction = extractor::extract(&raw, kind);

        let task = AlgorithmTask {
            base: CodingTask {
                task_type: TaskKind::Create,
                target_files: target.iter().cloned().collect(),
                instructions: utterance.to_string(),
                existing_code: Default::default(),
                language: None,
                constraints: Vec::new(),
            },
            expected_complexity: None,
            optimize_for: Default::default(),
        };

        let mut result = AlgorithmResult {
            complexity,
            rationale: rationale_of(&raw),
            ..Default::default()
        };
        result.code.success = true;

        match (target, extraction) {
            (Some(target), Some(extraction)) => {
                let absolute = self.executor.workspace().join(&target);
                let request = PermissionRequest::new(
                    Category::FileWrite,
                    format!("create {}", target.display()),
                )
                .with_preview(preview_of(&extraction.content));
                match self.gate.request(&request) {
                    Ok(Decision::Deny) => {
                        return ProcessOutcome::denied(formatter::format_error(
                            &ErrorKind::PermissionDenied(format!("create {}", target.display()))
                                .to_string(),
                        ))
                    }
                    Ok(_) => {
                        if let Err(err) = self.commit_content(&absolute, &extraction.content).await
                        {
                            return ProcessOutcome::error(formatter::format_error(&err.to_string()));
                        }
                        result.code.files.insert(target, extraction.content);
                    }
                    Err(err) => {
                        return ProcessOutcome::error(formatter::format_error(&err.to_string()))
                    }
                }
            }
            (None, Some(extraction)) => {
                result
                    .code
                    .files
                    .insert(PathBuf::from("solution.py"), extraction.content);
            }
            (_, None) => {
                result.rationale = raw.trim().to_string();
            }
        }

        ProcessOutcome::ok(formatter::format_algorithm_result(&result, &task))
    }

    // ----- plans ---------------------------------------------------------

    async fn run_plan(&self, utterance: &str) -> ProcessOutcome {
        let mut plan = self.planner.plan(utterance);
        info!(steps = plan.steps.len(), sequential = plan.is_sequential, "running plan");

        let total = plan.steps.len();
        let mut transcript: Vec<String> = Vec::new();
        let mut denied = false;
        let mut position = 0;

        while let Some(step) = plan.next_step() {
            let step = step.clone();
            position += 1;
            transcript.push(formatter::format_step_progress(&step, position, total));

            if plan
                .update(step.id, StepStatus::InProgress, None, None)
                .is_err()
            {
                break;
            }

            let outcome = self.run_step(&step).await;
            denied = denied || outcome.denied;

            match outcome.failed {
                None => {
                    transcript.push(outcome.text.clone());
                    let _ = plan.update(
                        step.id,
                        StepStatus::Completed,
                        Some(outcome.text),
                        None,
                    );
                }
                Some(error) => {
                    transcript.push(formatter::format_error(&error));
                    let _ = plan.update(step.id, StepStatus::Failed, None, Some(error));
                    // Sequential plans cascade the skip inside update().
                }
            }
        }

        transcript.push(String::new());
        transcript.push(formatter::format_plan_summary(&plan));
        let text = transcript.join("\n");
        if denied {
            ProcessOutcome::denied(text)
        } else {
            ProcessOutcome::ok(text)
        }
    }

    async fn run_step(&self, step: &TaskStep) -> StepOutcome {
        match step.step_type {
            StepType::ToolCall => {
                let outcome = self.run_tool_step(step).await;
                StepOutcome::from_process(outcome)
            }
            StepType::CodeGen => {
                let max_tokens = step.params.get("max_tokens").and_then(|v| v.as_u64());
                let mut params = step.params.clone();
                if !params.contains_key("filename") && !params.contains_key("file") {
                    if let Some(name) = crate::router::patterns::extract_filename(&step.description)
                    {
                        params.insert("filename".to_string(), Value::from(name));
                    }
                }
                let intent = IntentResult {
                    intent: Intent::CodingTask,
                    confidence: 1.0,
                    tool: None,
                    params,
                    escalate_to: Some(Role::Coder),
                    fallback_used: true,
                };
                let outcome = self
                    .handle_coding_task(
                        &step.description,
                        &intent,
                        max_tokens.map(|t| t as usize),
                    )
                    .await;
                StepOutcome::from_process(outcome)
            }
            StepType::Algorithm => {
                let intent = IntentResult {
                    intent: Intent::AlgorithmTask,
                    confidence: 1.0,
                    tool: None,
                    params: step.params.clone(),
                    escalate_to: Some(Role::Algorithm),
                    fallback_used: true,
                };
                let outcome = self.handle_algorithm_task(&step.description, &intent).await;
                StepOutcome::from_process(outcome)
            }
            StepType::SimpleAnswer => {
                let outcome = self.handle_simple_answer(&step.description).await;
                StepOutcome::from_process(outcome)
            }
        }
    }

    async fn run_tool_step(&self, step: &TaskStep) -> ProcessOutcome {
        let Some(tool_name) = step.param_str("tool") else {
            return ProcessOutcome::error(formatter::format_error("tool step without a tool"));
        };
        let Some(normalized) = normalize_alias(tool_name) else {
            return ProcessOutcome::error(formatter::format_error(
                &ErrorKind::UnknownTool(tool_name.to_string()).to_string(),
            ));
        };
        let tool = normalized.tool;

        let action = step
            .param_str("action")
            .map(|s| s.to_string())
            .or_else(|| normalized.action.map(|s| s.to_string()))
            .unwrap_or_else(|| match tool {
                ToolKind::Git => "status".to_string(),
                ToolKind::Shell => "run".to_string(),
                ToolKind::File => "read".to_string(),
                ToolKind::Sqlite => "schema".to_string(),
            });

        let mut params = Map::new();
        match (tool, action.as_str()) {
            (ToolKind::Shell, "run") => {
                let command = step
                    .param_str("command")
                    .map(rewrite_run)
                    .unwrap_or_else(|| rewrite_run(&step.description));
                params.insert("command".to_string(), Value::from(command));
            }
            (ToolKind::Shell, "mkdir") => {
                if let Some(paths) = step.params.get("paths") {
                    params.insert("paths".to_string(), paths.clone());
                }
            }
            (ToolKind::File, _) => {
                if let Some(filename) = step.param_str("filename") {
                    params.insert("path".to_string(), Value::from(filename));
                }
            }
            _ => {
                params = step.params.clone();
                params.remove("tool");
                if tool == ToolKind::Git && action == "commit" && !params.contains_key("message") {
                    params.insert("message".to_string(), Value::from(step.description.clone()));
                }
            }
        }

        self.execute_gated(tool, &action, &Value::Object(params), 1.0)
            .await
    }

    // ----- shared helpers -------------------------------------------------

    /// Generate while streaming completed fenced blocks into the target's
    /// `.part` file. Returns the full raw text for extraction.
    async fn generate_streaming(
        &self,
        role: Role,
        prompt: &str,
        opts: &GenerateOptions,
        absolute_target: &Path,
    ) -> anyhow::Result<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = StreamingWriter::open(absolute_target).await?;
        let part_target = absolute_target.to_path_buf();

        let drain = tokio::spawn(async move {
            let mut writer = writer;
            let mut buffer = FenceBuffer::new();
            let mut flushed = false;
            while let Some(token) = rx.recv().await {
                if let Some(block) = buffer.push(&token) {
                    if !flushed {
                        if writer.write(&block.content).await.is_err() {
                            warn!(path = %part_target.display(), "streaming write failed");
                        }
                        flushed = true;
                    }
                }
            }
            if !flushed {
                if let Some(block) = buffer.finish() {
                    let _ = writer.write(&block.content).await;
                    flushed = true;
                }
            }
            (writer, flushed)
        });

        let generated = self
            .lifecycle
            .generate_with(role, prompt, opts, Some(tx))
            .await;

        let (writer, _flushed) = drain.await?;
        match generated {
            Ok(raw) => {
                // The `.part` stays until the permission gate approves the
                // rename; commit_content finishes the job.
                writer.abort().await;
                Ok(raw)
            }
            Err(err) => {
                // Cancelled or failed generation leaves the `.part` file.
                writer.abort().await;
                Err(err)
            }
        }
    }

    /// Write approved content into place through a fresh `.part` file.
    async fn commit_content(&self, absolute: &Path, content: &str) -> anyhow::Result<()> {
        let mut writer = StreamingWriter::open(absolute).await?;
        writer.write(content).await?;
        let normalized_newline = !content.ends_with('\n');
        if normalized_newline {
            writer.write("\n").await?;
        }
        writer.finish().await?;
        info!(path = %absolute.display(), "wrote file");
        Ok(())
    }

    async fn discard_part(&self, absolute: &Path) {
        let part = crate::executor::file::part_path(absolute);
        let _ = tokio::fs::remove_file(part).await;
    }
}

/// A step's result plus whether it failed (and how).
struct StepOutcome {
    text: String,
    failed: Option<String>,
    denied: bool,
}

impl StepOutcome {
    fn from_process(outcome: ProcessOutcome) -> Self {
        // A denial fails the step like any other error but is tracked
        // separately for the exit code.
        let failed = outcome.failed.then(|| {
            outcome
                .text
                .trim_start_matches("Error:")
                .trim()
                .to_string()
        });
        Self {
            text: outcome.text,
            failed,
            denied: outcome.denied,
        }
    }
}

fn second_candidate(primary: Intent) -> Intent {
    match primary {
        Intent::SimpleAnswer => Intent::CodingTask,
        _ => Intent::SimpleAnswer,
    }
}

/// `run foo.py` reads as "execute the file", not a literal command.
fn rewrite_run(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("run ") {
        let rest = rest.trim();
        if rest.ends_with(".py") {
            return format!("python3 {}", rest);
        }
        if rest.ends_with(".js") {
            return format!("node {}", rest);
        }
        return rest.to_string();
    }
    if let Some(rest) = trimmed.strip_prefix("execute ") {
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

fn preview_of(content: &str) -> String {
    let lines: Vec<&str> = content.lines().take(10).collect();
    let mut preview = lines.join("\n");
    let remaining = content.lines().count().saturating_sub(10);
    if remaining > 0 {
        preview.push_str(&format!("\n... ({} more lines)", remaining));
    }
    preview
}

fn create_prompt(target: &Path, instructions: &str, kind: ContentKind) -> String {
    format!(
        "You are a precise code generator. Create the complete content of the file `{}`.\n\
         Task: {}\n\n\
         Reply with exactly one fenced code block tagged `{}` containing the whole file.\n\
         No prose before or after the block.\n\
         If this task requires algorithm-design expertise beyond routine code, reply with \
         exactly {} and nothing else.",
        target.display(),
        instructions,
        kind.fence_label(),
        SPECIALIST_MARKER
    )
}

fn algorithm_prompt(utterance: &str, target: Option<&Path>) -> String {
    let file_line = target
        .map(|t| format!("Write the solution as the complete content of `{}`.\n", t.display()))
        .unwrap_or_default();
    format!(
        "You are an algorithm specialist. {}\n{}\
         Reply with one fenced code block, then two lines:\n\
         Time complexity: O(...)\n\
         Space complexity: O(...)\n\
         Then one short paragraph explaining the approach.",
        utterance, file_line
    )
}

fn parse_complexity(raw: &str) -> crate::types::ComplexityAnalysis {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static TIME: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)time\s+complexity:?\s*(O\([^)]*\))").unwrap());
    static SPACE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)space\s+complexity:?\s*(O\([^)]*\))").unwrap());

    crate::types::ComplexityAnalysis {
        time: TIME
            .captures(raw)
            .map(|c| c[1].to_string())
            .unwrap_or_default(),
        space: SPACE
            .captures(raw)
            .map(|c| c[1].to_string())
            .unwrap_or_default(),
    }
}

/// The prose after the final fence, used as the rationale.
fn rationale_of(raw: &str) -> String {
    raw.rsplit("```")
        .next()
        .map(|tail| {
            tail.lines()
                .filter(|line| {
                    let lower = line.to_lowercase();
                    !lower.starts_with("time complexity") && !lower.starts_with("space complexity")
                })
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_run_maps_scripts_to_interpreters() {
        assert_eq!(rewrite_run("run test.py"), "python3 test.py");
        assert_eq!(rewrite_run("run app.js"), "node app.js");
        assert_eq!(rewrite_run("run pytest"), "pytest");
        assert_eq!(rewrite_run("execute cargo check"), "cargo check");
        assert_eq!(rewrite_run("ls -la"), "ls -la");
    }

    #[test]
    fn complexity_parsing_finds_both_axes() {
        let raw = "```python\npass\n```\nTime complexity: O(log n)\nSpace complexity: O(1)\nBecause halving.";
        let complexity = parse_complexity(raw);
        assert_eq!(complexity.time, "O(log n)");
        assert_eq!(complexity.space, "O(1)");
    }

    #[test]
    fn rationale_excludes_complexity_lines() {
        let raw = "```python\npass\n```\nTime complexity: O(n)\nSpace complexity: O(1)\nLinear scan over the input.";
        assert_eq!(rationale_of(raw), "Linear scan over the input.");
    }

    #[test]
    fn preview_caps_at_ten_lines() {
        let content: String = (0..25).map(|i| format!("line {}\n", i)).collect();
        let preview = preview_of(&content);
        assert!(preview.contains("line 9"));
        assert!(!preview.contains("line 10\n"));
        assert!(preview.contains("15 more lines"));
    }

    #[test]
    fn second_candidate_differs_from_primary() {
        assert_ne!(second_candidate(Intent::SimpleAnswer), Intent::SimpleAnswer);
        assert_ne!(second_candidate(Intent::CodingTask), Intent::CodingTask);
    }
}
