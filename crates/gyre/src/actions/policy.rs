//! Permission layer.
//!
//! Before an action executes, the pipeline asks a [`PermissionPolicy`] for a
//! decision. `Allow` and `Deny` resolve immediately; `Ask` suspends that one
//! action on an [`ApprovalHandler`] future while the rest of the batch keeps
//! moving.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

/// The policy's verdict for one action invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny(String),
    /// Defer to the [`ApprovalHandler`].
    Ask,
}

/// Decides whether an action may run. Consulted once per request, with the
/// validated arguments in hand.
pub trait PermissionPolicy: Send + Sync {
    fn decide(&self, name: &str, arguments: &serde_json::Value) -> PermissionDecision;
}

/// Permits everything. The default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

impl PermissionPolicy for AllowAllPolicy {
    fn decide(&self, _name: &str, _arguments: &serde_json::Value) -> PermissionDecision {
        PermissionDecision::Allow
    }
}

/// Name-based policy: listed actions are denied (with a reason) or escalated
/// to Ask; everything else is allowed.
#[derive(Debug, Clone, Default)]
pub struct ListPolicy {
    denied: HashMap<String, String>,
    ask: HashSet<String>,
}

impl ListPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny an action by name (builder pattern).
    pub fn deny(mut self, name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.denied.insert(name.into(), reason.into());
        self
    }

    /// Escalate an action to interactive approval (builder pattern).
    pub fn ask(mut self, name: impl Into<String>) -> Self {
        self.ask.insert(name.into());
        self
    }
}

impl PermissionPolicy for ListPolicy {
    fn decide(&self, name: &str, _arguments: &serde_json::Value) -> PermissionDecision {
        if let Some(reason) = self.denied.get(name) {
            PermissionDecision::Deny(reason.clone())
        } else if self.ask.contains(name) {
            PermissionDecision::Ask
        } else {
            PermissionDecision::Allow
        }
    }
}

// ── Approval handler ───────────────────────────────────────────────

/// Resolution of an `Ask` decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalResponse {
    Approved,
    Denied(String),
}

/// Boxed future returned by [`ApprovalHandler::request`].
pub type ApprovalFuture<'a> = Pin<Box<dyn Future<Output = ApprovalResponse> + Send + 'a>>;

/// Resolves `Ask` decisions, typically by prompting a human. The future may
/// stay pending for as long as the approver takes; only the asking action
/// waits on it.
pub trait ApprovalHandler: Send + Sync {
    fn request(&self, name: &str, arguments: &serde_json::Value) -> ApprovalFuture<'_>;
}

/// Approves every request. The default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ApprovalHandler for AutoApprove {
    fn request(&self, _name: &str, _arguments: &serde_json::Value) -> ApprovalFuture<'_> {
        Box::pin(async { ApprovalResponse::Approved })
    }
}
