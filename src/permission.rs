//! Permission gate — the single place that asks the user before a side
//! effect happens.
//!
//! Callers classify the side effect, build a [`PermissionRequest`], and
//! act on the returned [`Decision`]. Batch grants live for the session and
//! cover a whole category; destructive operations re-prompt regardless.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use dialoguer::Select;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    FileWrite,
    FileDelete,
    Shell,
    GitWrite,
    Install,
    DirectoryCreate,
    Batch,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::FileWrite => "file write",
            Category::FileDelete => "file delete",
            Category::Shell => "shell command",
            Category::GitWrite => "git write",
            Category::Install => "package install",
            Category::DirectoryCreate => "directory create",
            Category::Batch => "batch operation",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AllowOnce,
    /// Allow and remember for the rest of the session (same category).
    AllowBatch,
    Deny,
}

#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub category: Category,
    pub description: String,
    pub preview: Option<String>,
    pub destructive: bool,
    pub batch_id: Option<String>,
}

impl PermissionRequest {
    pub fn new(category: Category, description: impl Into<String>) -> Self {
        Self {
            category,
            description: description.into(),
            preview: None,
            destructive: false,
            batch_id: None,
        }
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    /// One folded request covering several directory creations.
    pub fn directories(paths: &[String]) -> Self {
        let mut req = Self::new(
            Category::DirectoryCreate,
            format!("Create {} directories", paths.len()),
        );
        req.preview = Some(paths.join("\n"));
        req.batch_id = Some("mkdir".to_string());
        req
    }
}

/// Answers permission prompts. Production uses [`TerminalPrompter`];
/// tests script the answers.
pub trait Prompter: Send + Sync {
    fn ask(&self, request: &PermissionRequest) -> anyhow::Result<Decision>;
}

pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&self, request: &PermissionRequest) -> anyhow::Result<Decision> {
        println!("\nPermission required: {} — {}", request.category, request.description);
        if let Some(preview) = &request.preview {
            for line in preview.lines().take(12) {
                println!("    {}", line);
            }
            let extra = preview.lines().count().saturating_sub(12);
            if extra > 0 {
                println!("    ... ({} more lines)", extra);
            }
        }
        if request.destructive {
            println!("    Warning: this action is destructive and not easily undone.");
        }

        let items = if request.destructive {
            // No session-wide grant for destructive operations.
            vec!["Allow once", "Deny"]
        } else {
            vec!["Allow once", "Allow for this session", "Deny"]
        };
        let choice = Select::new()
            .with_prompt("Proceed?")
            .items(&items)
            .default(0)
            .interact()?;

        Ok(match (choice, request.destructive) {
            (0, _) => Decision::AllowOnce,
            (1, false) => Decision::AllowBatch,
            _ => Decision::Deny,
        })
    }
}

pub struct PermissionGate {
    prompter: Box<dyn Prompter>,
    batch_grants: Mutex<HashSet<Category>>,
    /// From `require_confirmation`. When false nothing prompts and every
    /// gated operation is denied rather than silently allowed.
    prompts_enabled: bool,
}

impl PermissionGate {
    pub fn new(prompter: Box<dyn Prompter>, prompts_enabled: bool) -> Self {
        Self {
            prompter,
            batch_grants: Mutex::new(HashSet::new()),
            prompts_enabled,
        }
    }

    pub fn request(&self, request: &PermissionRequest) -> anyhow::Result<Decision> {
        if !self.prompts_enabled {
            return Ok(Decision::Deny);
        }

        if !request.destructive {
            let grants = self.batch_grants.lock().expect("grant lock poisoned");
            if grants.contains(&request.category) {
                return Ok(Decision::AllowOnce);
            }
        }

        let decision = self.prompter.ask(request)?;
        if decision == Decision::AllowBatch {
            self.batch_grants
                .lock()
                .expect("grant lock poisoned")
                .insert(request.category);
        }
        Ok(decision)
    }

    pub fn clear_session(&self) {
        self.batch_grants
            .lock()
            .expect("grant lock poisoned")
            .clear();
    }
}
