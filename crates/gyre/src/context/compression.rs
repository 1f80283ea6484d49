//! History compression.
//!
//! When context usage crosses a threshold, the [`CompressionManager`] asks
//! the model for a structured summary of the older history and replaces the
//! summarized span with a single `<context_summary>` message, keeping the
//! most recent span verbatim. The summary call is retried on transient
//! errors; when every attempt fails, a deterministic sliding-window fallback
//! drops the oldest messages instead. Compression degrades, it never errors.

use crate::context::budget::TokenCounter;
use crate::model::{ModelClient, complete_text};
use crate::retry::{RetryConfig, is_transient};
use crate::Message;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// System prompt for the summary call. The eight sections give later
/// iterations a stable shape to rely on.
const SUMMARY_SYSTEM_PROMPT: &str = "\
You are a conversation summarizer for an autonomous agent. Summarize the \
transcript you are given into exactly these eight sections, each with a \
markdown heading:

1. Background — what the agent was asked to do and any standing constraints.
2. Key decisions — choices made so far and the reasoning behind them.
3. Action usage log — which actions were invoked, with arguments worth remembering.
4. Evolving user intent — how the user's goal has shifted across the conversation.
5. Results so far — concrete outputs and facts established.
6. Errors and resolutions — failures encountered and how they were handled.
7. Open issues — unresolved problems and unanswered questions.
8. Next steps — what the agent should do next.

Be factual and specific. Prefer names, numbers, and identifiers over prose. \
Never invent content that is not in the transcript.";

/// Configuration for the compression manager.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Usage fraction at which compression triggers.
    pub threshold: f64,
    /// Number of most-recent messages kept verbatim, never summarized and
    /// never dropped by the fallback.
    pub keep_recent: usize,
    /// Fallback target: drop oldest messages until the history estimates at
    /// or under this fraction of the budget.
    pub target_fraction: f64,
    /// Retry policy for the summary call.
    pub retry: RetryConfig,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.92,
            keep_recent: 10,
            target_fraction: 0.60,
            retry: RetryConfig::with_retries(3),
        }
    }
}

/// What one compression pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionMetadata {
    /// Messages folded into the summary (or dropped by the fallback).
    pub removed_count: usize,
    /// Summary call attempts made (0 when compression was a no-op).
    pub attempts: u32,
    /// True when the sliding-window fallback ran instead of a summary.
    pub degraded: bool,
}

/// Shrinks history so the next assembly pass has room.
pub struct CompressionManager {
    config: CompressionConfig,
    counter: Arc<dyn TokenCounter>,
}

impl CompressionManager {
    pub fn new(config: CompressionConfig, counter: Arc<dyn TokenCounter>) -> Self {
        Self { config, counter }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Whether `used` of `max` tokens crosses the compression threshold.
    pub fn should_compress(&self, used: usize, max: usize) -> bool {
        if max == 0 {
            return true;
        }
        used as f64 / max as f64 >= self.config.threshold
    }

    /// Compress `messages` against a token budget.
    ///
    /// Returns the new history and metadata about what happened. A history
    /// no longer than `keep_recent` is returned untouched.
    pub async fn compress(
        &self,
        client: &dyn ModelClient,
        messages: Vec<Message>,
        budget_tokens: usize,
    ) -> (Vec<Message>, CompressionMetadata) {
        if messages.len() <= self.config.keep_recent {
            debug!(
                "compression skipped: {} messages within keep_recent {}",
                messages.len(),
                self.config.keep_recent
            );
            return (messages, CompressionMetadata::default());
        }

        let split = messages.len() - self.config.keep_recent;
        let (older, recent) = messages.split_at(split);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match complete_text(client, SUMMARY_SYSTEM_PROMPT, render_transcript(older)).await {
                Ok(summary) if !summary.trim().is_empty() => {
                    info!(
                        "compressed {} messages into a summary ({} attempts)",
                        older.len(),
                        attempts
                    );
                    let mut compressed = Vec::with_capacity(recent.len() + 1);
                    compressed.push(Message::user(format!(
                        "<context_summary>\n{}\n</context_summary>",
                        summary.trim()
                    )));
                    compressed.extend_from_slice(recent);
                    return (
                        compressed,
                        CompressionMetadata {
                            removed_count: older.len(),
                            attempts,
                            degraded: false,
                        },
                    );
                }
                Ok(_) => {
                    warn!("summary call returned empty content (attempt {attempts})");
                }
                Err(err) => {
                    if !is_transient(&err) {
                        warn!("summary call failed permanently: {err}");
                        break;
                    }
                    warn!("summary call failed transiently: {err} (attempt {attempts})");
                }
            }

            if attempts > self.config.retry.max_retries {
                break;
            }
            tokio::time::sleep(self.config.retry.delay_for_attempt(attempts - 1)).await;
        }

        let (fallback, removed) = self.sliding_window(messages, budget_tokens);
        info!("compression fell back to sliding window, dropped {removed} messages");
        (
            fallback,
            CompressionMetadata {
                removed_count: removed,
                attempts,
                degraded: true,
            },
        )
    }

    /// Drop oldest messages until the history fits `target_fraction` of the
    /// budget. Never drops into the `keep_recent` tail, even if that means
    /// missing the target.
    fn sliding_window(&self, messages: Vec<Message>, budget_tokens: usize) -> (Vec<Message>, usize) {
        let target = (budget_tokens as f64 * self.config.target_fraction) as usize;
        let floor = messages.len().saturating_sub(self.config.keep_recent);

        let mut start = 0usize;
        while start < floor && self.counter.count_messages(&messages[start..]) > target {
            start += 1;
        }
        (messages[start..].to_vec(), start)
    }
}

fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&format!("[{}] {}\n", message.role, message.content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::registry::ActionDef;
    use crate::context::budget::HeuristicCounter;
    use crate::error::ModelError;
    use crate::model::{ModelEvent, ModelStream};
    use futures::StreamExt;
    use futures::stream;
    use std::sync::Mutex;

    /// Replays a scripted sequence of summary outcomes.
    struct ScriptedSummarizer {
        outcomes: Mutex<Vec<Result<String, ModelError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSummarizer {
        fn new(outcomes: Vec<Result<String, ModelError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl ModelClient for ScriptedSummarizer {
        fn generate_streaming(&self, _: Vec<Message>, _: Vec<ActionDef>) -> ModelStream {
            *self.calls.lock().unwrap() += 1;
            let outcome = self.outcomes.lock().unwrap().remove(0);
            let events = match outcome {
                Ok(text) => vec![
                    Ok(ModelEvent::TextDelta(text)),
                    Ok(ModelEvent::Done { usage: None }),
                ],
                Err(e) => vec![Err(e)],
            };
            stream::iter(events).boxed()
        }
    }

    fn manager() -> CompressionManager {
        CompressionManager::new(
            CompressionConfig {
                keep_recent: 2,
                retry: RetryConfig {
                    jitter: false,
                    initial_delay: std::time::Duration::from_millis(1),
                    ..RetryConfig::with_retries(3)
                },
                ..CompressionConfig::default()
            },
            Arc::new(HeuristicCounter::new(4.0)),
        )
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("message {i}"))).collect()
    }

    #[test]
    fn threshold_check() {
        let mgr = manager();
        assert!(!mgr.should_compress(91, 100));
        assert!(mgr.should_compress(92, 100));
        assert!(mgr.should_compress(100, 100));
        assert!(mgr.should_compress(1, 0));
    }

    #[tokio::test]
    async fn short_history_is_untouched() {
        let mgr = manager();
        let client = ScriptedSummarizer::new(vec![]);
        let (out, meta) = mgr.compress(&client, history(2), 1000).await;
        assert_eq!(out.len(), 2);
        assert_eq!(meta, CompressionMetadata::default());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn summary_replaces_older_span() {
        let mgr = manager();
        let client = ScriptedSummarizer::new(vec![Ok("## Background\n...".into())]);

        let (out, meta) = mgr.compress(&client, history(6), 1000).await;

        assert_eq!(out.len(), 3);
        assert!(out[0].content.starts_with("<context_summary>"));
        assert!(out[0].content.contains("## Background"));
        assert_eq!(out[1].content, "message 4");
        assert_eq!(out[2].content, "message 5");
        assert_eq!(meta.removed_count, 4);
        assert_eq!(meta.attempts, 1);
        assert!(!meta.degraded);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mgr = manager();
        let client = ScriptedSummarizer::new(vec![
            Err(ModelError::Transport("HTTP 503: overloaded".into())),
            Err(ModelError::Transport("request failed: timed out".into())),
            Ok("summary text".into()),
        ]);

        let (out, meta) = mgr.compress(&client, history(6), 1000).await;

        assert_eq!(client.calls(), 3);
        assert_eq!(meta.attempts, 3);
        assert!(!meta.degraded);
        assert!(out[0].content.contains("summary text"));
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_window() {
        let mgr = manager();
        let client = ScriptedSummarizer::new(vec![
            Err(ModelError::Transport("HTTP 503".into())),
            Err(ModelError::Transport("HTTP 503".into())),
            Err(ModelError::Transport("HTTP 503".into())),
            Err(ModelError::Transport("HTTP 503".into())),
        ]);

        // Tight budget: the window must shrink hard, but never below the
        // keep_recent tail.
        let (out, meta) = mgr.compress(&client, history(6), 10).await;

        assert_eq!(client.calls(), 4);
        assert!(meta.degraded);
        assert_eq!(meta.attempts, 4);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "message 4");
        assert_eq!(meta.removed_count, 4);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let mgr = manager();
        let client = ScriptedSummarizer::new(vec![Err(ModelError::Transport(
            "HTTP 400: bad request".into(),
        ))]);

        let (_, meta) = mgr.compress(&client, history(6), 1000).await;

        assert_eq!(client.calls(), 1);
        assert!(meta.degraded);
    }

    #[tokio::test]
    async fn recompression_preserves_the_recent_tail() {
        let mgr = manager();
        // First pass summarizes; the second pass fails every attempt and
        // degrades to the window under a tight budget; the third pass sees a
        // history no longer than keep_recent. The recent tail must survive
        // all three.
        let client = ScriptedSummarizer::new(vec![
            Ok("pass one summary".into()),
            Err(ModelError::Transport("HTTP 503".into())),
            Err(ModelError::Transport("HTTP 503".into())),
            Err(ModelError::Transport("HTTP 503".into())),
            Err(ModelError::Transport("HTTP 503".into())),
        ]);

        let (once, meta1) = mgr.compress(&client, history(6), 1000).await;
        assert!(!meta1.degraded);
        assert_eq!(once.len(), 3);

        let (twice, meta2) = mgr.compress(&client, once, 10).await;
        assert!(meta2.degraded);
        assert_eq!(
            twice,
            vec![Message::user("message 4"), Message::user("message 5")]
        );

        let (thrice, meta3) = mgr.compress(&client, twice.clone(), 10).await;
        assert_eq!(thrice, twice);
        assert_eq!(meta3.attempts, 0);
        assert_eq!(client.calls(), 5);
    }

    #[tokio::test]
    async fn fallback_keeps_messages_when_budget_allows() {
        let mgr = manager();
        let client = ScriptedSummarizer::new(vec![Err(ModelError::Transport(
            "HTTP 400: bad request".into(),
        ))]);

        // Generous budget: the window target is already met, nothing drops.
        let (out, meta) = mgr.compress(&client, history(6), 10_000).await;
        assert_eq!(out.len(), 6);
        assert_eq!(meta.removed_count, 0);
        assert!(meta.degraded);
    }
}
