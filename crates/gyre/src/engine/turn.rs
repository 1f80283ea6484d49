//! The control loop.
//!
//! [`ControlLoop::run`] drives one turn: assemble the context window, stream
//! one model response, execute any requested actions as a batch, append the
//! results, repeat. The loop is bounded by `max_iterations` and rebinds an
//! immutable [`TurnState`](crate::TurnState) each pass, so iteration count
//! is monotone by construction and there is no unbounded recursion.
//!
//! Terminal states:
//! - **Done** — the model answered without requesting actions.
//! - **Aborted** — the cancellation token fired at a checkpoint.
//! - **Failed** — the iteration budget ran out, or an infrastructure fault
//!   (oversized pinned block, broken model stream, scheduler fault) made
//!   continuing pointless.

use crate::actions::pipeline::ActionPipeline;
use crate::actions::policy::{AllowAllPolicy, ApprovalHandler, AutoApprove, PermissionPolicy};
use crate::actions::registry::ActionRegistry;
use crate::actions::scheduler::Scheduler;
use crate::context::assembler::{ContextAssembler, ContextBlock};
use crate::context::budget::{HeuristicCounter, TokenCounter};
use crate::context::compression::CompressionManager;
use crate::engine::config::EngineConfig;
use crate::engine::events::{EngineEvent, EventHandler, NoopHandler};
use crate::model::{ModelClient, collect_response};
use crate::store::ConversationStore;
use crate::{Message, MessageRole, TurnState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Done,
    Aborted,
    Failed,
}

/// The result of one turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    /// Why the turn ended, for `Aborted` and `Failed`.
    pub reason: Option<String>,
    /// The model's final answer, for `Done`.
    pub final_text: Option<String>,
    /// Model calls made.
    pub iterations_used: u32,
    /// The conversation as it stands after the turn.
    pub messages: Vec<Message>,
}

/// Drives one turn over borrowed collaborators.
///
/// # Example
///
/// ```ignore
/// let report = ControlLoop::new(&client, &registry, &store, config)
///     .with_policy(&policy)
///     .with_events(&LoggingHandler)
///     .with_cancellation(token.clone())
///     .run()
///     .await;
/// ```
pub struct ControlLoop<'a> {
    client: &'a dyn ModelClient,
    registry: &'a ActionRegistry,
    store: &'a dyn ConversationStore,
    policy: &'a dyn PermissionPolicy,
    approvals: &'a dyn ApprovalHandler,
    events: &'a dyn EventHandler,
    cancel: CancellationToken,
    counter: Option<Arc<dyn TokenCounter>>,
    config: EngineConfig,
}

impl<'a> ControlLoop<'a> {
    pub fn new(
        client: &'a dyn ModelClient,
        registry: &'a ActionRegistry,
        store: &'a dyn ConversationStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            registry,
            store,
            policy: &AllowAllPolicy,
            approvals: &AutoApprove,
            events: &NoopHandler,
            cancel: CancellationToken::new(),
            counter: None,
            config,
        }
    }

    pub fn with_policy(mut self, policy: &'a dyn PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_approvals(mut self, approvals: &'a dyn ApprovalHandler) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_events(mut self, events: &'a dyn EventHandler) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Substitute an exact token counter for the chars-per-token heuristic.
    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Run the turn to a terminal state. Never panics; every failure mode is
    /// a report.
    pub async fn run(&self) -> TurnReport {
        let counter: Arc<dyn TokenCounter> = self
            .counter
            .clone()
            .unwrap_or_else(|| Arc::new(HeuristicCounter::new(self.config.chars_per_token)));
        let assembler = ContextAssembler::new(counter.clone());
        let compression =
            CompressionManager::new(self.config.compression.clone(), counter.clone());
        let scheduler = Scheduler::new(self.config.scheduler.clone());
        let pipeline = ActionPipeline::new(
            self.registry,
            self.policy,
            self.approvals,
            &scheduler,
            self.config.pipeline.clone(),
        );
        let window = self.config.context_window_tokens;

        let mut state = TurnState::new(self.config.max_iterations);
        while !state.exhausted() {
            self.events.handle(&EngineEvent::IterationStart {
                iteration: state.iteration,
                max_iterations: state.max_iterations,
            });

            if self.cancel.is_cancelled() {
                return self.aborted(state.cancel(), "cancellation requested before iteration start");
            }

            // Compress between iterations, never mid-batch.
            let history = self.store.snapshot();
            let used = counter.count_messages(&history) + counter.count(&self.config.system_prompt);
            if compression.should_compress(used, window) {
                self.events.handle(&EngineEvent::CompressionStarted {
                    message_count: history.len(),
                });
                let (compressed, meta) = compression.compress(self.client, history, window).await;
                self.events.handle(&EngineEvent::CompressionApplied(&meta));
                self.store.replace_all(compressed);
            }

            let history = self.store.snapshot();
            let mut blocks = Vec::with_capacity(history.len() + self.config.auxiliary_blocks.len() + 1);
            blocks.push(ContextBlock::pinned(
                "system",
                MessageRole::System,
                self.config.system_prompt.clone(),
                100,
            ));
            blocks.extend(self.config.auxiliary_blocks.iter().cloned());
            for (index, message) in history.iter().enumerate() {
                blocks.push(ContextBlock::from_message(
                    format!("history-{index}"),
                    message,
                    50,
                ));
            }

            let assembly = match assembler.assemble(blocks, window) {
                Ok(a) => a,
                Err(e) => return self.failed(state, format!("context assembly failed: {e}")),
            };
            self.events
                .handle(&EngineEvent::ContextAssembled(&assembly.report));
            debug!(
                "iteration {}: {} messages, {} tokens",
                state.iteration,
                assembly.messages.len(),
                assembly.used_tokens
            );

            let stream = self
                .client
                .generate_streaming(assembly.messages, self.registry.definitions());
            let response = match collect_response(stream, |delta| {
                self.events.handle(&EngineEvent::TextDelta(delta));
            })
            .await
            {
                Ok(r) => r,
                Err(e) => return self.failed(state, format!("model client fault: {e}")),
            };

            if response.action_requests.is_empty() {
                self.store.append(Message::assistant(&response.text));
                let iterations_used = state.iteration + 1;
                self.events
                    .handle(&EngineEvent::Finished { iterations_used });
                return TurnReport {
                    outcome: TurnOutcome::Done,
                    reason: None,
                    final_text: Some(response.text),
                    iterations_used,
                    messages: self.store.snapshot(),
                };
            }

            // Re-check immediately before committing to the batch.
            if self.cancel.is_cancelled() {
                return self.aborted(state.cancel(), "cancellation requested before action dispatch");
            }

            self.store.append(Message::assistant(&response.text));
            self.events.handle(&EngineEvent::ActionBatchStarted {
                count: response.action_requests.len(),
            });

            let results = match pipeline.run_batch(&response.action_requests, &self.cancel).await {
                Ok(r) => r,
                Err(e) => return self.failed(state, e.to_string()),
            };

            // Results append only after the whole batch resolved, in request
            // order, so a crash mid-batch never leaves partial results.
            for (request, result) in response.action_requests.iter().zip(&results) {
                self.events.handle(&EngineEvent::ActionCompleted {
                    name: &request.name,
                    call_id: &result.action_call_id,
                    status: &result.status,
                    timings: &result.metadata.timings,
                });
            }
            for result in results {
                self.store.append(result.into_message());
            }
            self.events
                .handle(&EngineEvent::SchedulerReport(scheduler.stats()));

            state = state.advance();
        }

        self.failed(
            state,
            format!(
                "maximum iterations ({}) reached without a final answer",
                state.max_iterations
            ),
        )
    }

    fn aborted(&self, state: TurnState, reason: &str) -> TurnReport {
        self.events.handle(&EngineEvent::Aborted { reason });
        TurnReport {
            outcome: TurnOutcome::Aborted,
            reason: Some(reason.into()),
            final_text: None,
            iterations_used: state.iteration,
            messages: self.store.snapshot(),
        }
    }

    fn failed(&self, state: TurnState, reason: String) -> TurnReport {
        self.events.handle(&EngineEvent::Failed { reason: &reason });
        TurnReport {
            outcome: TurnOutcome::Failed,
            reason: Some(reason),
            final_text: None,
            iterations_used: state.iteration,
            messages: self.store.snapshot(),
        }
    }
}
