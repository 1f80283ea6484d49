//! Recursive agent execution engine.
//!
//! `gyre` drives a single logical agent through repeated rounds of context
//! assembly, model generation, and action execution. The core abstraction is
//! the [`ControlLoop`](engine::turn::ControlLoop) — a bounded recursive driver
//! that assembles a token-budgeted context window, streams one model response,
//! runs every requested action as a batch through the
//! [`ActionPipeline`](actions::pipeline::ActionPipeline), appends the results,
//! and repeats until the model produces a final answer, the iteration limit is
//! reached, or the turn is cancelled.
//!
//! The model client, the concrete action catalogue, and the conversation
//! store are all *consumed* interfaces: the engine depends on their shape
//! ([`ModelClient`](model::ModelClient), [`Action`](actions::registry::Action),
//! [`ConversationStore`](store::ConversationStore)) and never on a provider.
//!
//! # Getting started
//!
//! ```ignore
//! use gyre::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = MyModelClient::connect();
//!
//!     let registry = ActionRegistry::new()
//!         .with(FnAction::new(
//!             ActionDef::new("lookup", "Look up a record", json_schema_for::<LookupArgs>()),
//!             |args: LookupArgs| async move { Ok(format!("record {}", args.key)) },
//!         ).concurrency_safe(true));
//!
//!     let store = InMemoryStore::new();
//!     store.append(Message::user("Find the record for key 42."));
//!
//!     let config = EngineConfig::new("You are a retrieval agent.")
//!         .with_max_iterations(12);
//!
//!     let report = ControlLoop::new(&client, &registry, &store, config)
//!         .run()
//!         .await;
//!
//!     println!("{:?}: {}", report.outcome, report.final_text.unwrap_or_default());
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Budget accounting:** [`TokenCounter`](context::budget::TokenCounter)
//!   and [`Budget`](context::budget::Budget) turn content into token counts
//!   and enforce numeric limits. Every other component leans on them.
//! - **Context assembly:** [`ContextAssembler`](context::assembler::ContextAssembler)
//!   places named, prioritized [`ContextBlock`](context::assembler::ContextBlock)s
//!   under a budget and reports every placement decision.
//! - **History compression:** [`CompressionManager`](context::compression::CompressionManager)
//!   produces a structured summary of older turns, with retry and a
//!   deterministic sliding-window fallback.
//! - **Action execution:** [`ActionPipeline`](actions::pipeline::ActionPipeline)
//!   runs discover → validate → authorize → cancellation-check → execute →
//!   format for each request; the execute stage delegates to the
//!   [`Scheduler`](actions::scheduler::Scheduler), which partitions a batch
//!   into concurrency-safe and sequential lanes.
//! - **Observing a run:** implement [`EventHandler`](engine::events::EventHandler)
//!   to receive [`EngineEvent`](engine::events::EngineEvent)s — assembly
//!   reports, per-stage timings, scheduler counters, compression outcomes.
//!
//! # Design principles
//!
//! 1. **Everything below the loop returns a typed outcome.** Bad arguments,
//!    missing actions, denials, and timeouts become
//!    [`ActionResult`](ActionResult)s with `status = Error` that the model can
//!    read and correct; only genuine infrastructure faults terminate the turn.
//! 2. **Context is the scarcest resource.** Assembly never exceeds its
//!    budget, compression keeps the recent span verbatim, and every placement
//!    decision is recorded for observability.
//! 3. **Determinism where it matters.** Assembly output is a pure function of
//!    its inputs, and scheduler results are correlated to requests in request
//!    order regardless of completion order.
//! 4. **No global state.** The registry, policy, store, and cancellation
//!    token are explicit values passed by reference, so every test can swap
//!    its own.

pub mod actions;
pub mod context;
pub mod engine;
pub mod error;
pub mod model;
pub mod prelude;
pub mod retry;
pub mod store;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strongly typed action
/// arguments and the schema carried by an [`ActionDef`](actions::registry::ActionDef).
///
/// # Example
///
/// ```
/// use gyre::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct LookupArgs {
///     key: String,
///     #[serde(default)]
///     limit: Option<u32>,
/// }
///
/// let schema = json_schema_for::<LookupArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"key".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    /// The outcome of an executed action, correlated by `action_call_id`.
    #[serde(rename = "action-result")]
    ActionResult,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::ActionResult => write!(f, "action-result"),
        }
    }
}

/// A message in the conversation. Immutable once appended to the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Set only on `ActionResult` messages: the id of the originating request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            action_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            action_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            action_call_id: None,
        }
    }

    pub fn action_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::ActionResult,
            content: content.into(),
            action_call_id: Some(call_id.into()),
        }
    }
}

// ── Action request / result ────────────────────────────────────────

/// A single action invocation requested by the model.
///
/// Produced by the model response parser; consumed exactly once by the
/// [`ActionPipeline`](actions::pipeline::ActionPipeline).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ActionRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ActionRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome classification of an executed action.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
    /// Succeeded, but the result was altered (e.g. truncated) on the way out.
    Warning,
}

/// Wall-clock duration of each pipeline stage, in milliseconds.
///
/// `execute_ms` covers the scheduler wait plus the action body; stages that
/// short-circuited (e.g. validation failed before authorize ran) report zero.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub discover_ms: u64,
    pub validate_ms: u64,
    pub authorize_ms: u64,
    pub execute_ms: u64,
    pub total_ms: u64,
}

/// Metadata attached to every [`ActionResult`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub timings: StageTimings,
    /// RFC 3339 timestamp of when the result was formatted.
    pub completed_at: String,
    /// True when the content was degraded on the way out (truncation).
    #[serde(default)]
    pub degraded: bool,
}

/// The normalized outcome of one requested action.
///
/// Every [`ActionRequest`] yields exactly one `ActionResult` with a matching
/// `action_call_id`, including on all failure paths.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ActionResult {
    pub action_call_id: String,
    pub status: ActionStatus,
    pub content: String,
    pub metadata: ResultMetadata,
}

impl ActionResult {
    /// Convert into the `action-result` message appended to the conversation.
    pub fn into_message(self) -> Message {
        Message::action_result(self.action_call_id, self.content)
    }

    /// Whether this result reports an error.
    pub fn is_error(&self) -> bool {
        self.status == ActionStatus::Error
    }
}

// ── Turn state ─────────────────────────────────────────────────────

/// Immutable per-iteration loop state.
///
/// Each iteration produces a fresh value via [`advance()`](Self::advance)
/// rather than mutating in place, so concurrent readers never observe a
/// half-updated state and `iteration` is monotone by construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub cancelled: bool,
}

impl TurnState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            cancelled: false,
        }
    }

    /// The state for the next iteration.
    pub fn advance(self) -> Self {
        Self {
            iteration: self.iteration + 1,
            ..self
        }
    }

    /// Mark the turn as cancelled.
    pub fn cancel(self) -> Self {
        Self {
            cancelled: true,
            ..self
        }
    }

    /// Whether the iteration budget is exhausted.
    pub fn exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}
