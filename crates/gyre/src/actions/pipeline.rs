//! The six-stage action pipeline.
//!
//! Every requested action flows through discover → validate → authorize →
//! cancellation-check → execute → format. Discovery and validation resolve
//! the whole batch up front (they are synchronous, and the scheduler needs
//! the safe call names before anything runs); from authorization on, each
//! request is driven by its own future, so an approval prompt suspends only
//! its own action while siblings proceed through execution. Formatting
//! normalizes every outcome into an [`ActionResult`](crate::ActionResult)
//! with per-stage timings.
//!
//! Failure policy: stage failures become error results the model can read
//! and correct. Only scheduler infrastructure faults propagate as `Err`.

use crate::actions::policy::{
    ApprovalHandler, ApprovalResponse, PermissionDecision, PermissionPolicy,
};
use crate::actions::registry::{ActionRegistry, validate_action_arguments};
use crate::actions::scheduler::{BatchSession, ScheduledCall, Scheduler};
use crate::error::{ActionErrorKind, EngineError};
use crate::{ActionRequest, ActionResult, ActionStatus, ResultMetadata, StageTimings};
use futures::future::join_all;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Maximum size (in bytes) for action output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Pipeline limits.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Result content larger than this is truncated and the result is
    /// downgraded to `Warning`.
    pub max_result_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }
}

/// Outcome of resolving one request (discover + validate).
struct Resolved {
    timings: StageTimings,
    verdict: Result<ScheduledCall, ActionErrorKind>,
}

/// Drives batches of action requests through the six stages.
///
/// Borrows its collaborators, the same way the control loop borrows the
/// pipeline: nothing here owns shared state.
pub struct ActionPipeline<'a> {
    registry: &'a ActionRegistry,
    policy: &'a dyn PermissionPolicy,
    approvals: &'a dyn ApprovalHandler,
    scheduler: &'a Scheduler,
    config: PipelineConfig,
}

impl<'a> ActionPipeline<'a> {
    pub fn new(
        registry: &'a ActionRegistry,
        policy: &'a dyn PermissionPolicy,
        approvals: &'a dyn ApprovalHandler,
        scheduler: &'a Scheduler,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            approvals,
            scheduler,
            config,
        }
    }

    /// Run one batch of requests to completion.
    ///
    /// Returns exactly one [`ActionResult`] per request, in request order,
    /// each carrying the originating request's id.
    pub async fn run_batch(
        &self,
        requests: &[ActionRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<ActionResult>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        info!("action batch: {} request(s)", requests.len());

        // Stages 1-2 resolve the whole batch up front, so the session knows
        // every safe call name before anything starts running.
        let resolved: Vec<Resolved> = requests.iter().map(|r| self.resolve(r)).collect();
        let session = self.scheduler.batch(resolved.iter().filter_map(|r| match &r.verdict {
            Ok(call) if call.safe => Some(call.name.clone()),
            _ => None,
        }));

        // Stages 3-6, one future per request. A suspended approval blocks
        // only its own future.
        join_all(
            requests
                .iter()
                .zip(resolved)
                .map(|(request, resolved)| self.drive(request, resolved, &session, cancel)),
        )
        .await
        .into_iter()
        .collect()
    }

    /// Stages 1-2 for one request.
    fn resolve(&self, request: &ActionRequest) -> Resolved {
        let mut timings = StageTimings::default();

        // 1. Discover.
        let discover_start = Instant::now();
        let action = self.registry.lookup(&request.name);
        timings.discover_ms = millis(discover_start.elapsed());
        let action = match action {
            Some(a) if a.enabled() => a,
            Some(a) => {
                return Resolved {
                    timings,
                    verdict: Err(ActionErrorKind::Unavailable {
                        name: request.name.clone(),
                        reason: a.disabled_reason(),
                    }),
                };
            }
            None => {
                return Resolved {
                    timings,
                    verdict: Err(ActionErrorKind::NotFound {
                        name: request.name.clone(),
                    }),
                };
            }
        };

        // 2. Validate.
        let validate_start = Instant::now();
        let validation = validate_action_arguments(action.as_ref(), &request.arguments);
        timings.validate_ms = millis(validate_start.elapsed());
        if let Some(hint) = validation {
            return Resolved {
                timings,
                verdict: Err(ActionErrorKind::InvalidArguments {
                    name: request.name.clone(),
                    hint,
                }),
            };
        }

        Resolved {
            timings,
            verdict: Ok(ScheduledCall::new(action, request.arguments.clone())),
        }
    }

    /// Stages 3-6 for one request.
    async fn drive(
        &self,
        request: &ActionRequest,
        resolved: Resolved,
        session: &BatchSession<'_>,
        cancel: &CancellationToken,
    ) -> Result<ActionResult, EngineError> {
        let mut timings = resolved.timings;
        let call = match resolved.verdict {
            Ok(call) => call,
            Err(kind) => return Ok(format_error(request, &kind, timings)),
        };

        // 3. Authorize. An Ask decision suspends only this action.
        let authorize_start = Instant::now();
        let decision = self.policy.decide(&request.name, &request.arguments);
        let authorized = match decision {
            PermissionDecision::Allow => Ok(()),
            PermissionDecision::Deny(reason) => Err(reason),
            PermissionDecision::Ask => {
                debug!("action '{}' awaiting approval", request.name);
                match self.approvals.request(&request.name, &request.arguments).await {
                    ApprovalResponse::Approved => Ok(()),
                    ApprovalResponse::Denied(reason) => Err(reason),
                }
            }
        };
        timings.authorize_ms = millis(authorize_start.elapsed());
        if let Err(reason) = authorized {
            if call.safe {
                session.withdraw(&call.name);
            }
            return Ok(format_error(
                request,
                &ActionErrorKind::PermissionDenied {
                    name: request.name.clone(),
                    reason,
                },
                timings,
            ));
        }

        // 4. Cancellation check, immediately before handing off to execute.
        if cancel.is_cancelled() {
            if call.safe {
                session.withdraw(&call.name);
            }
            return Ok(format_error(request, &ActionErrorKind::Cancelled, timings));
        }

        // 5. Execute under the session's limits.
        let outcome = session.execute(&call, cancel).await?;
        timings.execute_ms = outcome.elapsed.as_millis() as u64;

        // 6. Format.
        Ok(match outcome.result {
            Ok(content) => self.format_success(request, content, timings),
            Err(kind) => format_error(request, &kind, timings),
        })
    }

    fn format_success(
        &self,
        request: &ActionRequest,
        content: String,
        mut timings: StageTimings,
    ) -> ActionResult {
        finish_timings(&mut timings);
        let (content, truncated) = truncate_content(content, self.config.max_result_bytes);
        debug!(
            "action '{}' succeeded in {}ms ({} bytes)",
            request.name,
            timings.execute_ms,
            content.len()
        );
        ActionResult {
            action_call_id: request.id.clone(),
            status: if truncated {
                ActionStatus::Warning
            } else {
                ActionStatus::Success
            },
            content,
            metadata: ResultMetadata {
                timings,
                completed_at: chrono::Utc::now().to_rfc3339(),
                degraded: truncated,
            },
        }
    }
}

fn format_error(
    request: &ActionRequest,
    kind: &ActionErrorKind,
    mut timings: StageTimings,
) -> ActionResult {
    finish_timings(&mut timings);
    debug!("action '{}' failed: {kind}", request.name);
    ActionResult {
        action_call_id: request.id.clone(),
        status: ActionStatus::Error,
        content: format!("Error: {kind}"),
        metadata: ResultMetadata {
            timings,
            completed_at: chrono::Utc::now().to_rfc3339(),
            degraded: false,
        },
    }
}

fn finish_timings(timings: &mut StageTimings) {
    timings.total_ms =
        timings.discover_ms + timings.validate_ms + timings.authorize_ms + timings.execute_ms;
}

fn millis(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}

/// Trim `content` to at most `max` bytes on a char boundary, appending a
/// notice. Returns whether trimming happened.
fn truncate_content(content: String, max: usize) -> (String, bool) {
    if content.len() <= max {
        return (content, false);
    }
    let mut cut = max;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let total = content.len();
    let mut trimmed = String::with_capacity(cut + 48);
    trimmed.push_str(content.get(..cut).unwrap_or(""));
    trimmed.push_str(&format!("...\n[truncated: {total} bytes total]"));
    (trimmed, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::policy::{AllowAllPolicy, ApprovalFuture, AutoApprove, ListPolicy};
    use crate::actions::registry::{ActionDef, DisabledAction, FnAction};
    use crate::actions::scheduler::SchedulerConfig;
    use crate::json_schema_for;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::{Arc, Mutex};

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        text: String,
    }

    fn registry() -> ActionRegistry {
        ActionRegistry::new()
            .with(
                FnAction::new(
                    ActionDef::new("echo", "Echo the input", json_schema_for::<EchoArgs>()),
                    |args: EchoArgs| async move { Ok(args.text) },
                )
                .concurrency_safe(true),
            )
            .with(FnAction::new(
                ActionDef::new(
                    "fail",
                    "Always fails",
                    serde_json::json!({"type": "object"}),
                ),
                |_: serde_json::Value| async { Err("intentional failure".to_string()) },
            ))
            .with(DisabledAction::new(
                ActionDef::new("deploy", "Deploy", serde_json::json!({"type": "object"})),
                "deployments are switched off",
            ))
    }

    fn request(id: &str, name: &str, args: serde_json::Value) -> ActionRequest {
        ActionRequest::new(id, name, args)
    }

    async fn run(
        requests: &[ActionRequest],
        policy: &dyn PermissionPolicy,
        approvals: &dyn ApprovalHandler,
    ) -> Vec<ActionResult> {
        let registry = registry();
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let pipeline = ActionPipeline::new(
            &registry,
            policy,
            approvals,
            &scheduler,
            PipelineConfig::default(),
        );
        pipeline
            .run_batch(requests, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn success_round_trip() {
        let requests = vec![request("c1", "echo", serde_json::json!({"text": "hi"}))];
        let results = run(&requests, &AllowAllPolicy, &AutoApprove).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action_call_id, "c1");
        assert_eq!(results[0].status, ActionStatus::Success);
        assert_eq!(results[0].content, "hi");
        assert!(!results[0].metadata.completed_at.is_empty());
    }

    #[tokio::test]
    async fn unknown_action_becomes_error_result() {
        let requests = vec![request("c1", "nonexistent", serde_json::json!({}))];
        let results = run(&requests, &AllowAllPolicy, &AutoApprove).await;

        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].content.contains("unknown action"));
        assert_eq!(results[0].action_call_id, "c1");
    }

    #[tokio::test]
    async fn disabled_action_reports_reason() {
        let requests = vec![request("c1", "deploy", serde_json::json!({}))];
        let results = run(&requests, &AllowAllPolicy, &AutoApprove).await;

        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].content.contains("switched off"));
    }

    #[tokio::test]
    async fn invalid_arguments_carry_a_hint() {
        let requests = vec![request("c1", "echo", serde_json::json!({"wrong": 1}))];
        let results = run(&requests, &AllowAllPolicy, &AutoApprove).await;

        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].content.contains("invalid arguments"));
        assert!(results[0].content.contains("Fix the arguments"));
    }

    #[tokio::test]
    async fn denial_becomes_permission_error() {
        let policy = ListPolicy::new().deny("echo", "echo is restricted here");
        let requests = vec![request("c1", "echo", serde_json::json!({"text": "hi"}))];
        let results = run(&requests, &policy, &AutoApprove).await;

        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].content.contains("permission denied"));
        assert!(results[0].content.contains("echo is restricted here"));
    }

    #[tokio::test]
    async fn ask_suspension_blocks_only_its_own_action() {
        /// Denies after recording which action asked.
        struct RecordingApprover {
            asked: Mutex<Vec<String>>,
        }

        impl ApprovalHandler for RecordingApprover {
            fn request(&self, name: &str, _: &serde_json::Value) -> ApprovalFuture<'_> {
                self.asked.lock().unwrap().push(name.to_string());
                Box::pin(async { ApprovalResponse::Denied("operator said no".into()) })
            }
        }

        let policy = ListPolicy::new().ask("fail");
        let approver = RecordingApprover {
            asked: Mutex::new(Vec::new()),
        };
        let requests = vec![
            request("c1", "echo", serde_json::json!({"text": "free"})),
            request("c2", "fail", serde_json::json!({})),
        ];
        let results = run(&requests, &policy, &approver).await;

        // The ungated sibling still ran.
        assert_eq!(results[0].status, ActionStatus::Success);
        assert_eq!(results[0].content, "free");
        // The gated one carries the approver's reason.
        assert_eq!(results[1].status, ActionStatus::Error);
        assert!(results[1].content.contains("operator said no"));
        assert_eq!(*approver.asked.lock().unwrap(), vec!["fail".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_approval_does_not_stall_siblings() {
        /// Approves after a long deliberation.
        struct SlowApprover;

        impl ApprovalHandler for SlowApprover {
            fn request(&self, _: &str, _: &serde_json::Value) -> ApprovalFuture<'_> {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    ApprovalResponse::Approved
                })
            }
        }

        let epoch = Instant::now();
        let ran_at: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));
        let recorder = ran_at.clone();
        let registry = ActionRegistry::new()
            .with(
                FnAction::new(
                    ActionDef::new("free", "Ungated", serde_json::json!({"type": "object"})),
                    move |_: serde_json::Value| {
                        let recorder = recorder.clone();
                        async move {
                            *recorder.lock().unwrap() = Some(epoch.elapsed());
                            Ok("free ran".to_string())
                        }
                    },
                )
                .concurrency_safe(true),
            )
            .with(FnAction::new(
                ActionDef::new("gated", "Gated", serde_json::json!({"type": "object"})),
                |_: serde_json::Value| async { Ok("gated ran".to_string()) },
            ));
        let policy = ListPolicy::new().ask("gated");
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let pipeline = ActionPipeline::new(
            &registry,
            &policy,
            &SlowApprover,
            &scheduler,
            PipelineConfig::default(),
        );

        let requests = vec![
            request("c1", "gated", serde_json::json!({})),
            request("c2", "free", serde_json::json!({})),
        ];
        let results = pipeline
            .run_batch(&requests, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results[0].status, ActionStatus::Success);
        assert_eq!(results[0].content, "gated ran");
        assert_eq!(results[1].status, ActionStatus::Success);

        // The sibling must not have waited out the 500ms approval.
        let ran = ran_at.lock().unwrap().unwrap();
        assert!(
            ran < Duration::from_millis(100),
            "sibling waited {ran:?} on the pending approval"
        );
        assert!(epoch.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn execution_failure_is_an_error_result() {
        let requests = vec![request("c1", "fail", serde_json::json!({}))];
        let results = run(&requests, &AllowAllPolicy, &AutoApprove).await;

        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].content.contains("intentional failure"));
    }

    #[tokio::test]
    async fn mixed_batch_keeps_request_order_and_ids() {
        let requests = vec![
            request("c1", "nonexistent", serde_json::json!({})),
            request("c2", "echo", serde_json::json!({"text": "two"})),
            request("c3", "fail", serde_json::json!({})),
            request("c4", "echo", serde_json::json!({"text": "four"})),
        ];
        let results = run(&requests, &AllowAllPolicy, &AutoApprove).await;

        let ids: Vec<&str> = results.iter().map(|r| r.action_call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(results[1].content, "two");
        assert_eq!(results[3].content, "four");
        assert_eq!(results[0].status, ActionStatus::Error);
        assert_eq!(results[2].status, ActionStatus::Error);
    }

    #[tokio::test]
    async fn cancelled_batch_yields_cancelled_results() {
        let registry = registry();
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let pipeline = ActionPipeline::new(
            &registry,
            &AllowAllPolicy,
            &AutoApprove,
            &scheduler,
            PipelineConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let requests = vec![request("c1", "echo", serde_json::json!({"text": "hi"}))];
        let results = pipeline.run_batch(&requests, &cancel).await.unwrap();

        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].content.contains("cancelled"));
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_with_warning() {
        let registry = ActionRegistry::new().with(FnAction::new(
            ActionDef::new("big", "Big output", serde_json::json!({"type": "object"})),
            |_: serde_json::Value| async { Ok("a".repeat(200)) },
        ));
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let pipeline = ActionPipeline::new(
            &registry,
            &AllowAllPolicy,
            &AutoApprove,
            &scheduler,
            PipelineConfig {
                max_result_bytes: 50,
            },
        );

        let requests = vec![request("c1", "big", serde_json::json!({}))];
        let results = pipeline
            .run_batch(&requests, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results[0].status, ActionStatus::Warning);
        assert!(results[0].content.contains("[truncated: 200 bytes total]"));
        assert!(results[0].metadata.degraded);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (out, truncated) = truncate_content("日本語のテキスト".to_string(), 7);
        assert!(truncated);
        assert!(out.starts_with("日本"));

        let (out, truncated) = truncate_content("short".to_string(), 100);
        assert!(!truncated);
        assert_eq!(out, "short");
    }
}
