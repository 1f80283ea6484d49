//! Retry policy for model calls.
//!
//! The compression manager's summary calls go through this policy: transient
//! transport failures (rate limits, upstream overload, flaky networks) are
//! retried with exponential backoff, while rejected requests and stream
//! contract violations fail fast to the fallback path.

use crate::error::ModelError;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, just fail immediately).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic jitter keyed on the attempt number: cheaper than
            // pulling in rand, and reproducible in tests.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                3 => 0.85,
                _ => 0.80,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Whether a model failure is worth retrying.
///
/// A [`ModelError::Malformed`] stream is a contract violation and never
/// retried. Transport failures are classified by their provider detail:
/// rejected requests (4xx other than 429) fail fast, rate limits, upstream
/// 5xx, and network-level faults are transient.
pub fn is_transient(error: &ModelError) -> bool {
    let detail = match error {
        ModelError::Malformed(_) => return false,
        ModelError::Transport(detail) => detail,
    };

    let rejected = ["HTTP 400", "HTTP 401", "HTTP 403", "HTTP 404", "HTTP 422"];
    if rejected.iter().any(|s| detail.contains(s)) {
        return false;
    }

    let retryable_statuses = ["429", "500", "502", "503", "504"];
    if retryable_statuses
        .iter()
        .any(|s| detail.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = detail.to_lowercase();
    [
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
        "overloaded",
    ]
    .iter()
    .any(|p| lower.contains(p))
}
