//! Observability sink.
//!
//! The control loop narrates a turn through [`EngineEvent`]s. Handlers are
//! pure observers: they cannot alter engine behavior, and a panicking or
//! slow handler is the caller's own problem. Events borrow their payloads,
//! so emitting is allocation-free.

use crate::actions::scheduler::SchedulerStats;
use crate::context::assembler::AssemblyReport;
use crate::context::compression::CompressionMetadata;
use crate::{ActionStatus, StageTimings};
use tracing::{debug, info, warn};

/// One observable moment in a turn.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    IterationStart {
        iteration: u32,
        max_iterations: u32,
    },
    /// Every placement decision of the assembly pass that just ran.
    ContextAssembled(&'a AssemblyReport),
    CompressionStarted {
        message_count: usize,
    },
    CompressionApplied(&'a CompressionMetadata),
    /// Incremental assistant text, in arrival order.
    TextDelta(&'a str),
    ActionBatchStarted {
        count: usize,
    },
    ActionCompleted {
        name: &'a str,
        call_id: &'a str,
        status: &'a ActionStatus,
        timings: &'a StageTimings,
    },
    SchedulerReport(SchedulerStats),
    Finished {
        iterations_used: u32,
    },
    Aborted {
        reason: &'a str,
    },
    Failed {
        reason: &'a str,
    },
}

/// Receives engine events. All methods observe; none can steer.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent<'_>);
}

/// Discards every event. The default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn handle(&self, _event: &EngineEvent<'_>) {}
}

/// Logs events through `tracing` at sensible levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::IterationStart {
                iteration,
                max_iterations,
            } => info!("iteration {}/{max_iterations}", iteration + 1),
            EngineEvent::ContextAssembled(report) => debug!(
                "context assembled: {} blocks, {}/{} tokens",
                report.entries.len(),
                report.used_tokens,
                report.budget_tokens
            ),
            EngineEvent::CompressionStarted { message_count } => {
                info!("compressing {message_count} messages")
            }
            EngineEvent::CompressionApplied(meta) => {
                if meta.degraded {
                    warn!(
                        "compression degraded to sliding window, dropped {} messages",
                        meta.removed_count
                    )
                } else {
                    info!(
                        "compression summarized {} messages in {} attempt(s)",
                        meta.removed_count, meta.attempts
                    )
                }
            }
            EngineEvent::TextDelta(_) => {}
            EngineEvent::ActionBatchStarted { count } => debug!("dispatching {count} action(s)"),
            EngineEvent::ActionCompleted {
                name,
                call_id,
                status,
                timings,
            } => debug!(
                "action {name} ({call_id}) -> {status:?} in {}ms",
                timings.total_ms
            ),
            EngineEvent::SchedulerReport(stats) => debug!(
                "scheduler: peak concurrency {}, {} timeout(s)",
                stats.peak_concurrency, stats.timeouts
            ),
            EngineEvent::Finished { iterations_used } => {
                info!("turn finished after {iterations_used} iteration(s)")
            }
            EngineEvent::Aborted { reason } => warn!("turn aborted: {reason}"),
            EngineEvent::Failed { reason } => warn!("turn failed: {reason}"),
        }
    }
}

/// Wraps a closure as an event handler.
///
/// # Example
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let EngineEvent::TextDelta(delta) = event {
///         print!("{delta}");
///     }
/// });
/// ```
pub struct FnEventHandler {
    f: Box<dyn Fn(&EngineEvent<'_>) + Send + Sync>,
}

impl FnEventHandler {
    pub fn new(f: impl Fn(&EngineEvent<'_>) + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }
}

impl EventHandler for FnEventHandler {
    fn handle(&self, event: &EngineEvent<'_>) {
        (self.f)(event)
    }
}
