//! Action abstraction and registry.
//!
//! The [`Action`] trait defines the interface every invocable capability
//! implements: a static definition (name, description, JSON Schema) plus an
//! async `invoke`. Actions are collected into an [`ActionRegistry`], an
//! explicit instance the engine holds by reference — there is no global
//! catalogue.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by [`Action::invoke`].
///
/// `Ok` is the result content handed back to the model; `Err` is a
/// model-readable failure message.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// The definition of an action as advertised to the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ActionDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

impl ActionDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

// ── Action trait ───────────────────────────────────────────────────

/// A capability the model can request by name.
///
/// Uses a boxed future so the trait stays dyn-compatible; the registry
/// stores `Arc<dyn Action>`.
pub trait Action: Send + Sync {
    /// The definition advertised to the model.
    fn definition(&self) -> ActionDef;

    /// Run the action with already-validated arguments.
    fn invoke(&self, arguments: &serde_json::Value) -> ActionFuture<'_>;

    /// The action's name (convenience — delegates to definition).
    fn name(&self) -> String {
        self.definition().name
    }

    /// Whether this action may run in parallel with other actions. Safe
    /// actions are read-only or idempotent; anything that mutates shared
    /// state must leave this `false`.
    fn concurrency_safe(&self) -> bool {
        false
    }

    /// Whether the action is currently invocable. Disabled actions stay
    /// visible in the catalogue but fail discovery with
    /// [`disabled_reason`](Self::disabled_reason).
    fn enabled(&self) -> bool {
        true
    }

    /// Why the action is disabled, shown to the model on discovery failure.
    fn disabled_reason(&self) -> String {
        "action is disabled in this configuration".into()
    }
}

// ── ActionRegistry ─────────────────────────────────────────────────

/// A collection of actions dispatchable by name.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action. Replaces any existing action with the same name.
    pub fn register(&mut self, action: impl Action + 'static) {
        self.actions.insert(action.name(), Arc::new(action));
    }

    /// Register an action (builder pattern).
    pub fn with(mut self, action: impl Action + 'static) -> Self {
        self.register(action);
        self
    }

    /// Conditionally register an action (builder pattern).
    pub fn with_if(self, condition: bool, action: impl Action + 'static) -> Self {
        if condition { self.with(action) } else { self }
    }

    /// Look up an action by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// All definitions, sorted by name so the catalogue is deterministic.
    pub fn definitions(&self) -> Vec<ActionDef> {
        let mut defs: Vec<ActionDef> = self.actions.values().map(|a| a.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── FnAction ───────────────────────────────────────────────────────

/// Type-erased async handler for [`FnAction`].
type ErasedHandler = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        + Send
        + Sync,
>;

/// A closure-based action that auto-parses arguments and delegates to a
/// handler.
///
/// Eliminates the boilerplate of a struct + `impl Action` for actions whose
/// logic is a pure async function. The generic constructor performs type
/// erasure so `FnAction` is a concrete, dyn-compatible type. For actions
/// that need shared state, implement [`Action`] directly.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs {
///     query: String,
/// }
///
/// let action = FnAction::new(
///     ActionDef::new("search", "Search the index", json_schema_for::<SearchArgs>()),
///     |args: SearchArgs| async move { Ok(format!("results for {}", args.query)) },
/// ).concurrency_safe(true);
/// ```
pub struct FnAction {
    def: ActionDef,
    handler: ErasedHandler,
    safe: bool,
}

impl FnAction {
    /// Create a new closure-based action.
    ///
    /// The handler receives arguments deserialized into `A`; deserialization
    /// failures become model-readable `Err` strings.
    pub fn new<A, F, Fut>(def: ActionDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let erased = move |raw: serde_json::Value| -> Pin<
            Box<dyn Future<Output = Result<String, String>> + Send>,
        > {
            let args: A = match serde_json::from_value(raw) {
                Ok(a) => a,
                Err(e) => {
                    return Box::pin(async move {
                        Err(format!(
                            "invalid arguments: {e}. Provide JSON matching the action's parameter schema."
                        ))
                    });
                }
            };
            Box::pin(handler(args))
        };

        Self {
            def,
            handler: Box::new(erased),
            safe: false,
        }
    }

    /// Mark this action as safe to run in parallel (builder pattern).
    pub fn concurrency_safe(mut self, safe: bool) -> Self {
        self.safe = safe;
        self
    }
}

impl Action for FnAction {
    fn definition(&self) -> ActionDef {
        self.def.clone()
    }

    fn invoke(&self, arguments: &serde_json::Value) -> ActionFuture<'_> {
        Box::pin((self.handler)(arguments.clone()))
    }

    fn concurrency_safe(&self) -> bool {
        self.safe
    }
}

impl fmt::Debug for FnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction")
            .field("name", &self.def.name)
            .field("concurrency_safe", &self.safe)
            .finish()
    }
}

// ── DisabledAction ─────────────────────────────────────────────────

/// An action that stays visible in the catalogue but fails discovery with a
/// stated reason. Use it to keep a feature-gated action's name and schema in
/// front of the model while it is switched off.
pub struct DisabledAction {
    def: ActionDef,
    reason: String,
}

impl DisabledAction {
    pub fn new(def: ActionDef, reason: impl Into<String>) -> Self {
        Self {
            def,
            reason: reason.into(),
        }
    }
}

impl Action for DisabledAction {
    fn definition(&self) -> ActionDef {
        self.def.clone()
    }

    fn invoke(&self, _arguments: &serde_json::Value) -> ActionFuture<'_> {
        let reason = self.reason.clone();
        Box::pin(async move { Err(reason) })
    }

    fn enabled(&self) -> bool {
        false
    }

    fn disabled_reason(&self) -> String {
        self.reason.clone()
    }
}

// ── Validation ─────────────────────────────────────────────────────

/// Validate arguments against the action's declared JSON Schema.
///
/// Returns `None` if valid, or `Some(hint)` formatted so the model can
/// self-correct. A schema that itself fails to compile skips validation.
pub fn validate_action_arguments(
    action: &dyn Action,
    arguments: &serde_json::Value,
) -> Option<String> {
    let schema = action.definition().parameters;
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "argument validation failed:\n{}\nFix the arguments and try again.",
            errors.join("\n")
        ))
    }
}

/// Typed marker args for actions that take no arguments.
#[derive(Deserialize, JsonSchema)]
pub struct NoArgs {}
