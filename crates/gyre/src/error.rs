//! Typed error taxonomy for the engine.
//!
//! Two tiers of failure flow through the engine:
//!
//! - **Expected, recoverable conditions** ([`ActionErrorKind`]) — an unknown
//!   action name, bad arguments, a denial, a timeout. These are values the
//!   pipeline converts into [`ActionResult`](crate::ActionResult)s with
//!   `status = Error`, so the model can read the diagnostic and correct
//!   itself. They never terminate the turn.
//! - **Infrastructure faults** ([`EngineError`], [`AssemblyError`],
//!   [`ModelError`]) — the scheduler lost its runtime primitives, a pinned
//!   context block cannot fit, the model client broke its contract. These
//!   propagate with `?` and terminate the turn as `Failed`.

use thiserror::Error;

/// Why a requested action could not produce a successful result.
///
/// The `Display` text of each variant is model-visible: it becomes the
/// content of the error [`ActionResult`](crate::ActionResult), so every
/// message is phrased as a diagnostic the model can act on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionErrorKind {
    #[error("unknown action '{name}'. Check the action catalogue for the available names.")]
    NotFound { name: String },

    #[error("action '{name}' is currently unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("invalid arguments for action '{name}': {hint}")]
    InvalidArguments { name: String, hint: String },

    #[error("permission denied for action '{name}': {reason}")]
    PermissionDenied { name: String, reason: String },

    #[error("action '{name}' timed out after {seconds} seconds")]
    Timeout { name: String, seconds: u64 },

    #[error("action was cancelled before execution")]
    Cancelled,

    #[error("action '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

impl ActionErrorKind {
    /// The action name this error refers to, when there is one.
    pub fn action_name(&self) -> Option<&str> {
        match self {
            ActionErrorKind::NotFound { name }
            | ActionErrorKind::Unavailable { name, .. }
            | ActionErrorKind::InvalidArguments { name, .. }
            | ActionErrorKind::PermissionDenied { name, .. }
            | ActionErrorKind::Timeout { name, .. }
            | ActionErrorKind::Failed { name, .. } => Some(name),
            ActionErrorKind::Cancelled => None,
        }
    }
}

/// Fatal context-assembly failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// A non-truncatable block does not fit in the remaining budget. The
    /// configuration is broken and silently dropping the block would corrupt
    /// the agent's instructions, so this is loud.
    #[error(
        "non-truncatable context block '{name}' needs {needed} tokens \
         but only {remaining} of {budget} remain"
    )]
    OversizedBlock {
        name: String,
        needed: usize,
        remaining: usize,
        budget: usize,
    },
}

/// Failures reported by a [`ModelClient`](crate::model::ModelClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Transport-level failure (connection, rate limit, upstream 5xx).
    /// The message is matched against the retry classifier.
    #[error("model transport error: {0}")]
    Transport(String),

    /// The stream violated its contract (e.g. ended without `Done`).
    #[error("malformed model response: {0}")]
    Malformed(String),
}

/// Turn-terminating infrastructure faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("context assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("model client fault: {0}")]
    Model(#[from] ModelError),

    #[error("scheduler fault: {0}")]
    Scheduler(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_action() {
        let err = ActionErrorKind::InvalidArguments {
            name: "lookup".into(),
            hint: "'key' is required".into(),
        };
        let text = err.to_string();
        assert!(text.contains("lookup"));
        assert!(text.contains("'key' is required"));
        assert_eq!(err.action_name(), Some("lookup"));
    }

    #[test]
    fn cancelled_has_no_action_name() {
        assert_eq!(ActionErrorKind::Cancelled.action_name(), None);
    }

    #[test]
    fn assembly_error_reports_budget_numbers() {
        let err = AssemblyError::OversizedBlock {
            name: "system".into(),
            needed: 300,
            remaining: 100,
            budget: 200,
        };
        let text = err.to_string();
        assert!(text.contains("300"));
        assert!(text.contains("100"));
        assert!(text.contains("200"));
    }

    #[test]
    fn engine_error_wraps_assembly() {
        let inner = AssemblyError::OversizedBlock {
            name: "system".into(),
            needed: 10,
            remaining: 5,
            budget: 5,
        };
        let err: EngineError = inner.into();
        assert!(err.to_string().starts_with("context assembly failed"));
    }
}
