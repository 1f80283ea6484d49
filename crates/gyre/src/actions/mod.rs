//! Action execution: the catalogue of invocable actions, the permission
//! layer, the concurrency-aware scheduler, and the six-stage pipeline that
//! ties them together.

pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod scheduler;

pub use pipeline::{ActionPipeline, PipelineConfig};
pub use policy::{
    AllowAllPolicy, ApprovalHandler, ApprovalResponse, AutoApprove, ListPolicy, PermissionDecision,
    PermissionPolicy,
};
pub use registry::{Action, ActionDef, ActionFuture, ActionRegistry, DisabledAction, FnAction};
pub use scheduler::{
    BatchSession, CallOutcome, ScheduledCall, Scheduler, SchedulerConfig, SchedulerStats,
};
