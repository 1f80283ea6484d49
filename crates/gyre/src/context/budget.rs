//! Token budget accounting.
//!
//! All budget math runs on estimates from a [`TokenCounter`]. The default
//! [`HeuristicCounter`] uses a chars-per-token ratio with ceiling division,
//! so estimates never under-count; exact provider tokenization is a client
//! concern, not an engine one.

use crate::Message;

/// Default estimation ratio. Empirically ~3.5 characters per token for
/// mixed English prose and code.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Per-message framing overhead added by [`TokenCounter::count_message`],
/// covering role markers and separators so multi-message totals stay
/// conservative.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 3;

/// Estimates the token cost of content. Dyn-safe so the engine can hold an
/// `Arc<dyn TokenCounter>` and tests can substitute exact counters.
pub trait TokenCounter: Send + Sync {
    /// Estimated tokens for a bare string.
    fn count(&self, text: &str) -> usize;

    /// Estimated tokens for a message, including framing overhead.
    fn count_message(&self, message: &Message) -> usize {
        self.count(&message.content) + MESSAGE_OVERHEAD_TOKENS
    }

    /// Estimated total for a message list.
    fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

/// Chars-per-token estimation with ceiling division.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicCounter {
    chars_per_token: f64,
}

impl HeuristicCounter {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(0.1),
        }
    }
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}

/// A numeric token budget for one assembly pass.
///
/// `used <= total` holds at all times: [`charge`](Self::charge) refuses
/// charges that would overflow instead of clamping them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    total: usize,
    used: usize,
}

impl Budget {
    pub fn new(total: usize) -> Self {
        Self { total, used: 0 }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.total - self.used
    }

    /// Whether a charge of `tokens` would fit.
    pub fn fits(&self, tokens: usize) -> bool {
        tokens <= self.remaining()
    }

    /// Charge `tokens` against the budget. Returns `false` (and charges
    /// nothing) when the charge does not fit.
    pub fn charge(&mut self, tokens: usize) -> bool {
        if self.fits(tokens) {
            self.used += tokens;
            true
        } else {
            false
        }
    }

    /// Fraction of the budget consumed, in `[0.0, 1.0]`.
    pub fn usage_fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.used as f64 / self.total as f64
        }
    }
}
