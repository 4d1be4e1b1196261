//! The closed set of failure kinds surfaced across the orchestration core.
//!
//! Components return `anyhow::Result` and attach one of these kinds when the
//! failure class matters downstream (retry policy, plan bookkeeping, exit
//! code). Callers that need to dispatch pull the kind back out with
//! [`kind_of`].

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("memory budget exhausted: need {need_mb} MB, budget {budget_mb} MB")]
    ResourceExhausted { need_mb: u64, budget_mb: u64 },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The user declined a permission prompt.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Blocked by policy before any prompt.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown action '{action}' for tool '{tool}'")]
    UnknownAction { tool: String, action: String },

    /// Model output did not parse into the expected structure.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Edit blocks or extracted content failed validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("subprocess exited with status {code}: {stderr}")]
    SubprocessFailed { code: i32, stderr: String },

    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Kinds that warrant one retry with a clarified prompt. Everything
    /// else fails the step on first occurrence; tool errors are never
    /// retried automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SchemaMismatch(_) | ErrorKind::ValidationFailed(_)
        )
    }
}

/// Extract the typed kind from an `anyhow::Error`, if one was attached.
pub fn kind_of(err: &anyhow::Error) -> Option<&ErrorKind> {
    err.downcast_ref::<ErrorKind>()
}

/// True when `err` carries the given discriminant, ignoring payloads.
#[cfg(test)]
pub fn is_kind(err: &anyhow::Error, probe: fn(&ErrorKind) -> bool) -> bool {
    kind_of(err).map(probe).unwrap_or(false)
}
