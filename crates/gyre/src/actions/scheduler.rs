//! Concurrency-aware batch scheduler.
//!
//! One model response can request many actions. A [`BatchSession`] applies
//! the limits for one batch: calls marked
//! [`concurrency_safe`](crate::actions::registry::Action::concurrency_safe)
//! run in parallel under a semaphore cap, unsafe calls run strictly one at a
//! time in the order they become ready. The lanes overlap, so unsafe work
//! starts as soon as it is ready, with one exception: an unsafe call whose
//! action name matches a registered safe call waits for those same-name
//! calls to drain.
//!
//! Each call is driven by its own [`BatchSession::execute`] future, so a
//! caller can hold one call back (for example on a pending approval) without
//! stalling the rest of the batch. [`Scheduler::run_batch`] is the
//! whole-batch convenience wrapper; it returns outcomes in request order.

use crate::actions::registry::Action;
use crate::error::{ActionErrorKind, EngineError};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default cap on concurrently running safe calls.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default per-call execution timeout.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Scheduler limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently running safe calls.
    pub max_concurrency: usize,
    /// Per-call execution timeout.
    pub action_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }
}

/// One call ready for execution: resolved action plus validated arguments.
pub struct ScheduledCall {
    pub name: String,
    pub action: Arc<dyn Action>,
    pub arguments: serde_json::Value,
    pub safe: bool,
}

impl ScheduledCall {
    pub fn new(action: Arc<dyn Action>, arguments: serde_json::Value) -> Self {
        Self {
            name: action.name(),
            safe: action.concurrency_safe(),
            action,
            arguments,
        }
    }
}

/// The outcome of one scheduled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub result: Result<String, ActionErrorKind>,
    /// Execution wall time, including any same-name or semaphore wait.
    pub elapsed: Duration,
}

/// Counters exposed to the observability sink. Cumulative over the
/// scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Highest number of safe calls observed running at once.
    pub peak_concurrency: usize,
    /// Calls that hit the execution timeout.
    pub timeouts: usize,
}

/// Executes batches of scheduled calls under the configured limits.
pub struct Scheduler {
    config: SchedulerConfig,
    running: AtomicUsize,
    peak: AtomicUsize,
    timeouts: AtomicUsize,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            peak_concurrency: self.peak.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
        }
    }

    /// Open a session for one batch.
    ///
    /// `safe_names` registers the batch's safe call names up front, so an
    /// unsafe call treats same-name safe calls as in-flight even before they
    /// begin running. A registered name the caller later decides not to
    /// execute must be released with [`BatchSession::withdraw`].
    pub fn batch(&self, safe_names: impl IntoIterator<Item = String>) -> BatchSession<'_> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for name in safe_names {
            *counts.entry(name).or_insert(0) += 1;
        }
        BatchSession {
            scheduler: self,
            semaphore: Semaphore::new(self.config.max_concurrency),
            in_flight: Mutex::new(counts),
            notify: Notify::new(),
            unsafe_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one batch. The returned outcomes are in request order.
    ///
    /// `Err` means the scheduler itself broke, which terminates the turn;
    /// per-call failures (timeouts, action errors, cancellation) are values
    /// inside the outcomes.
    pub async fn run_batch(
        &self,
        calls: Vec<ScheduledCall>,
        cancel: &CancellationToken,
    ) -> Result<Vec<CallOutcome>, EngineError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            "scheduling batch: {} safe, {} unsafe (cap {})",
            calls.iter().filter(|c| c.safe).count(),
            calls.iter().filter(|c| !c.safe).count(),
            self.config.max_concurrency
        );

        let session = self.batch(
            calls
                .iter()
                .filter(|c| c.safe)
                .map(|c| c.name.clone()),
        );
        join_all(calls.iter().map(|call| session.execute(call, cancel)))
            .await
            .into_iter()
            .collect()
    }

    async fn execute_one(&self, call: &ScheduledCall, cancel: &CancellationToken) -> CallOutcome {
        let start = Instant::now();

        if cancel.is_cancelled() {
            return CallOutcome {
                result: Err(ActionErrorKind::Cancelled),
                elapsed: start.elapsed(),
            };
        }

        let result =
            match tokio::time::timeout(self.config.action_timeout, call.action.invoke(&call.arguments))
                .await
            {
                Ok(Ok(content)) => Ok(content),
                Ok(Err(message)) => Err(ActionErrorKind::Failed {
                    name: call.name.clone(),
                    message,
                }),
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "action '{}' timed out after {:.0}s",
                        call.name,
                        self.config.action_timeout.as_secs_f64()
                    );
                    Err(ActionErrorKind::Timeout {
                        name: call.name.clone(),
                        seconds: self.config.action_timeout.as_secs(),
                    })
                }
            };

        CallOutcome {
            result,
            elapsed: start.elapsed(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// The limits for one batch: the semaphore capping the safe lane, the
/// in-flight name ledger, and the gate serializing the unsafe lane.
///
/// Each call's [`execute`](BatchSession::execute) future applies the limits
/// independently, so the caller decides when each call becomes ready.
pub struct BatchSession<'a> {
    scheduler: &'a Scheduler,
    semaphore: Semaphore,
    in_flight: Mutex<HashMap<String, usize>>,
    notify: Notify,
    unsafe_gate: tokio::sync::Mutex<()>,
}

impl BatchSession<'_> {
    /// Execute one call under the session's limits.
    ///
    /// A safe call waits for a semaphore permit and releases its registered
    /// name when done. An unsafe call takes the gate (granted in the order
    /// callers reach it), then waits out registered same-name safe calls.
    pub async fn execute(
        &self,
        call: &ScheduledCall,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, EngineError> {
        if call.safe {
            let permit = match self.semaphore.acquire().await {
                Ok(p) => p,
                Err(_) => {
                    self.withdraw(&call.name);
                    return Err(EngineError::Scheduler("semaphore closed".into()));
                }
            };
            let running = self.scheduler.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.scheduler.peak.fetch_max(running, Ordering::SeqCst);

            let outcome = self.scheduler.execute_one(call, cancel).await;

            self.scheduler.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            self.withdraw(&call.name);
            Ok(outcome)
        } else {
            let _gate = self.unsafe_gate.lock().await;

            // Wait out same-name safe calls. Registering the notification
            // before re-checking the ledger closes the gap where a withdraw
            // lands between the check and the await.
            loop {
                let notified = self.notify.notified();
                let pending = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&call.name)
                    .copied()
                    .unwrap_or(0);
                if pending == 0 {
                    break;
                }
                debug!(
                    "unsafe call '{}' waiting on {pending} registered safe call(s)",
                    call.name
                );
                notified.await;
            }

            Ok(self.scheduler.execute_one(call, cancel).await)
        }
    }

    /// Release one registration of a safe call name without executing it,
    /// waking any unsafe call waiting on that name.
    pub fn withdraw(&self, name: &str) {
        let mut ledger = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = ledger.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                ledger.remove(name);
            }
        }
        drop(ledger);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::registry::{ActionDef, ActionFuture};

    /// Sleeps for a configured duration, logging start/end markers.
    struct SleepAction {
        name: String,
        safe: bool,
        duration: Duration,
        log: Arc<Mutex<Vec<String>>>,
        active: Arc<AtomicUsize>,
        peak_seen: Arc<AtomicUsize>,
    }

    impl SleepAction {
        fn new(name: &str, safe: bool, millis: u64) -> Self {
            Self {
                name: name.into(),
                safe,
                duration: Duration::from_millis(millis),
                log: Arc::new(Mutex::new(Vec::new())),
                active: Arc::new(AtomicUsize::new(0)),
                peak_seen: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn shared_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
            self.log = log;
            self
        }

        fn shared_counters(mut self, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
            self.active = active;
            self.peak_seen = peak;
            self
        }
    }

    impl Action for SleepAction {
        fn definition(&self) -> ActionDef {
            ActionDef::new(&self.name, "sleeps", serde_json::json!({"type": "object"}))
        }

        fn invoke(&self, _arguments: &serde_json::Value) -> ActionFuture<'_> {
            Box::pin(async move {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}-start", self.name));
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.duration).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.log.lock().unwrap().push(format!("{}-end", self.name));
                Ok(format!("slept {}", self.name))
            })
        }

        fn concurrency_safe(&self) -> bool {
            self.safe
        }
    }

    fn call(action: SleepAction) -> ScheduledCall {
        ScheduledCall::new(Arc::new(action), serde_json::json!({}))
    }

    fn scheduler(cap: usize, timeout_secs: u64) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            max_concurrency: cap,
            action_timeout: Duration::from_secs(timeout_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn results_in_request_order_despite_completion_order() {
        let sched = scheduler(10, 120);
        // First call sleeps longest, so it finishes last.
        let calls = vec![
            call(SleepAction::new("slow", true, 300)),
            call(SleepAction::new("medium", true, 200)),
            call(SleepAction::new("fast", true, 100)),
        ];

        let outcomes = sched
            .run_batch(calls, &CancellationToken::new())
            .await
            .unwrap();

        let contents: Vec<String> = outcomes
            .into_iter()
            .map(|o| o.result.unwrap())
            .collect();
        assert_eq!(contents, vec!["slept slow", "slept medium", "slept fast"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_bounds_parallelism_into_waves() {
        let sched = scheduler(10, 120);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        // 20 safe calls of 100ms under a cap of 10: two waves, 200ms total.
        let calls: Vec<ScheduledCall> = (0..20)
            .map(|i| {
                call(
                    SleepAction::new(&format!("a{i}"), true, 100)
                        .shared_counters(active.clone(), peak.clone()),
                )
            })
            .collect();

        let start = Instant::now();
        let outcomes = sched
            .run_batch(calls, &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(outcomes.len(), 20);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 10);
        assert_eq!(sched.stats().peak_concurrency, 10);
        assert!(
            elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(250),
            "elapsed {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_calls_never_overlap() {
        let sched = scheduler(10, 120);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls: Vec<ScheduledCall> = (0..4)
            .map(|i| {
                call(
                    SleepAction::new(&format!("mutate{i}"), false, 50)
                        .shared_counters(active.clone(), peak.clone()),
                )
            })
            .collect();

        sched
            .run_batch(calls, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_waits_for_same_name_safe_calls() {
        let sched = scheduler(10, 120);
        let log = Arc::new(Mutex::new(Vec::new()));

        let calls = vec![
            call(SleepAction::new("journal", true, 100).shared_log(log.clone())),
            call(SleepAction::new("journal", false, 10).shared_log(log.clone())),
        ];

        sched
            .run_batch(calls, &CancellationToken::new())
            .await
            .unwrap();

        let log = log.lock().unwrap().clone();
        let safe_end = log.iter().position(|e| e == "journal-end").unwrap();
        // Two "journal-start" entries; the unsafe one must come after the
        // safe call's end marker.
        let unsafe_start = log
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == "journal-start")
            .map(|(i, _)| i)
            .max()
            .unwrap();
        assert!(unsafe_start > safe_end, "log: {log:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_with_distinct_name_overlaps_safe_lane() {
        let sched = scheduler(10, 120);

        // A 100ms safe call and a 100ms unsafe call with a different name:
        // the lanes run concurrently, so the batch takes ~100ms, not 200.
        let calls = vec![
            call(SleepAction::new("read", true, 100)),
            call(SleepAction::new("write", false, 100)),
        ];

        let start = Instant::now();
        sched
            .run_batch(calls, &CancellationToken::new())
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_error_value() {
        let sched = scheduler(10, 1);
        let calls = vec![call(SleepAction::new("stuck", true, 10_000))];

        let outcomes = sched
            .run_batch(calls, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcomes[0].result,
            Err(ActionErrorKind::Timeout {
                name: "stuck".into(),
                seconds: 1,
            })
        );
        assert_eq!(sched.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_short_circuits_every_call() {
        let sched = scheduler(10, 120);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = vec![
            call(SleepAction::new("a", true, 100)),
            call(SleepAction::new("b", false, 100)),
        ];

        let outcomes = sched.run_batch(calls, &cancel).await.unwrap();
        assert!(
            outcomes
                .iter()
                .all(|o| o.result == Err(ActionErrorKind::Cancelled))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn withdraw_releases_same_name_waiters() {
        let sched = scheduler(10, 120);
        // A safe "journal" call is registered but never executed, as if its
        // approval were denied after registration.
        let session = sched.batch(vec!["journal".to_string()]);
        let cancel = CancellationToken::new();
        let unsafe_call = call(SleepAction::new("journal", false, 10));

        let (outcome, ()) = tokio::join!(session.execute(&unsafe_call, &cancel), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.withdraw("journal");
        });

        assert_eq!(outcome.unwrap().result, Ok("slept journal".to_string()));
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let sched = Scheduler::default();
        let outcomes = sched
            .run_batch(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }
}
