//! Model client abstraction.
//!
//! The engine consumes a [`ModelClient`] — it never implements a provider.
//! A client turns a message list plus an action catalogue into a stream of
//! [`ModelEvent`]s: text deltas as they arrive, then optionally a batch of
//! action requests, then exactly one `Done` carrying usage numbers when the
//! provider reports them.
//!
//! [`collect_response`] folds a stream into a [`ModelResponse`], forwarding
//! each text delta to a callback so callers can surface streaming output
//! without re-implementing the fold.

use crate::actions::registry::ActionDef;
use crate::error::ModelError;
use crate::{ActionRequest, Message};
use futures::StreamExt;
use futures::stream::BoxStream;

/// Token usage reported by the provider for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// One event in a streaming model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// An incremental chunk of assistant text.
    TextDelta(String),
    /// The complete batch of action requests for this response. At most one
    /// per stream, and always before `Done`.
    ActionRequests(Vec<ActionRequest>),
    /// End of the response. Every well-formed stream ends with exactly one.
    Done { usage: Option<TokenUsage> },
}

/// Boxed event stream returned by [`ModelClient::generate_streaming`].
pub type ModelStream = BoxStream<'static, Result<ModelEvent, ModelError>>;

/// A language-model backend the engine can drive.
///
/// Dyn-compatible: implementations return a boxed stream rather than an
/// `impl Trait`, so the engine can hold `&dyn ModelClient`.
pub trait ModelClient: Send + Sync {
    /// Start one generation over the given messages and action catalogue.
    fn generate_streaming(&self, messages: Vec<Message>, actions: Vec<ActionDef>) -> ModelStream;
}

/// A fully collected model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub action_requests: Vec<ActionRequest>,
    pub usage: Option<TokenUsage>,
}

/// Fold a [`ModelStream`] into a [`ModelResponse`].
///
/// `on_delta` is called once per [`ModelEvent::TextDelta`] in arrival order.
/// A stream that ends without a `Done` event is malformed.
pub async fn collect_response(
    mut stream: ModelStream,
    mut on_delta: impl FnMut(&str),
) -> Result<ModelResponse, ModelError> {
    let mut response = ModelResponse::default();
    let mut done = false;

    while let Some(event) = stream.next().await {
        match event? {
            ModelEvent::TextDelta(delta) => {
                on_delta(&delta);
                response.text.push_str(&delta);
            }
            ModelEvent::ActionRequests(requests) => {
                response.action_requests = requests;
            }
            ModelEvent::Done { usage } => {
                response.usage = usage;
                done = true;
                break;
            }
        }
    }

    if done {
        Ok(response)
    } else {
        Err(ModelError::Malformed(
            "stream ended without a Done event".into(),
        ))
    }
}

/// Run a plain text completion: one system message, one user message, no
/// actions. Used by the compression manager for summary calls.
pub async fn complete_text(
    client: &dyn ModelClient,
    system: impl Into<String>,
    user: impl Into<String>,
) -> Result<String, ModelError> {
    let messages = vec![Message::system(system), Message::user(user)];
    let stream = client.generate_streaming(messages, Vec::new());
    let response = collect_response(stream, |_| {}).await?;
    Ok(response.text)
}
