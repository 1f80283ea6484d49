//! Convenience re-exports for typical engine setup.
//!
//! ```ignore
//! use gyre::prelude::*;
//! ```

pub use crate::actions::pipeline::{ActionPipeline, PipelineConfig};
pub use crate::actions::policy::{
    AllowAllPolicy, ApprovalHandler, ApprovalResponse, AutoApprove, ListPolicy, PermissionDecision,
    PermissionPolicy,
};
pub use crate::actions::registry::{
    Action, ActionDef, ActionFuture, ActionRegistry, DisabledAction, FnAction,
};
pub use crate::actions::scheduler::{BatchSession, Scheduler, SchedulerConfig, SchedulerStats};
pub use crate::context::assembler::{
    Assembly, AssemblyReport, BlockDisposition, ContextAssembler, ContextBlock,
};
pub use crate::context::budget::{Budget, HeuristicCounter, TokenCounter};
pub use crate::context::compression::{CompressionConfig, CompressionManager, CompressionMetadata};
pub use crate::engine::config::EngineConfig;
pub use crate::engine::events::{
    EngineEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
pub use crate::engine::turn::{ControlLoop, TurnOutcome, TurnReport};
pub use crate::error::{ActionErrorKind, AssemblyError, EngineError, ModelError};
pub use crate::model::{ModelClient, ModelEvent, ModelResponse, ModelStream, collect_response};
pub use crate::store::{ConversationStore, InMemoryStore};
pub use crate::{
    ActionRequest, ActionResult, ActionStatus, Message, MessageRole, ResultMetadata, StageTimings,
    TurnState, json_schema_for,
};
