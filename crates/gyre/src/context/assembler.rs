//! Deterministic context window assembly.
//!
//! The assembler takes a set of named, prioritized [`ContextBlock`]s and
//! places them into a token budget: pinned (non-truncatable) blocks first,
//! then truncatable blocks which may be trimmed or dropped. The output is a
//! pure function of the input — no clock reads, no randomness — and every
//! placement decision lands in the [`AssemblyReport`].

use crate::context::budget::{Budget, TokenCounter};
use crate::error::AssemblyError;
use crate::{Message, MessageRole};
use std::sync::Arc;
use tracing::{debug, warn};

// ── ContextBlock ───────────────────────────────────────────────────

/// A candidate piece of the context window.
///
/// Blocks are ephemeral: the control loop rebuilds them from the store and
/// the engine config on every assembly pass.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    /// Stable identifier used in reports and diagnostics.
    pub name: String,
    pub role: MessageRole,
    pub content: String,
    /// Higher priority places earlier and survives pressure longer.
    pub priority: i32,
    /// Whether the block may be trimmed or dropped under pressure.
    pub truncatable: bool,
    /// Preserved on blocks built from `action-result` messages.
    pub action_call_id: Option<String>,
}

impl ContextBlock {
    /// A pinned block: must be included whole or assembly fails.
    pub fn pinned(
        name: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            content: content.into(),
            priority,
            truncatable: false,
            action_call_id: None,
        }
    }

    /// A flexible block: trimmed or dropped when the budget is tight.
    pub fn flexible(
        name: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            truncatable: true,
            ..Self::pinned(name, role, content, priority)
        }
    }

    /// A flexible block carrying a history message's role, content, and
    /// action-call correlation.
    pub fn from_message(name: impl Into<String>, message: &Message, priority: i32) -> Self {
        Self {
            name: name.into(),
            role: message.role.clone(),
            content: message.content.clone(),
            priority,
            truncatable: true,
            action_call_id: message.action_call_id.clone(),
        }
    }

    fn into_message(self) -> Message {
        Message {
            role: self.role,
            content: self.content,
            action_call_id: self.action_call_id,
        }
    }
}

// ── Report ─────────────────────────────────────────────────────────

/// What happened to one block during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDisposition {
    Included,
    Truncated {
        original_tokens: usize,
        kept_tokens: usize,
    },
    Excluded,
}

/// Per-block record in an [`AssemblyReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub name: String,
    pub priority: i32,
    pub disposition: BlockDisposition,
}

/// Every placement decision of one assembly pass, in placement order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReport {
    pub entries: Vec<BlockEntry>,
    pub used_tokens: usize,
    pub budget_tokens: usize,
}

impl AssemblyReport {
    /// The entry for a named block, if it was seen.
    pub fn entry(&self, name: &str) -> Option<&BlockEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// The output of one assembly pass.
#[derive(Debug, Clone)]
pub struct Assembly {
    /// Included blocks as messages, ordered by descending priority with
    /// input order breaking ties.
    pub messages: Vec<Message>,
    pub used_tokens: usize,
    pub report: AssemblyReport,
}

// ── Assembler ──────────────────────────────────────────────────────

/// Places blocks into a budget. Holds only a counter, so it is cheap to
/// build per pass.
#[derive(Clone)]
pub struct ContextAssembler {
    counter: Arc<dyn TokenCounter>,
}

impl ContextAssembler {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    /// Assemble `blocks` into at most `budget_tokens` tokens.
    ///
    /// Pinned blocks are placed first in priority order; a pinned block that
    /// does not fit is a fatal [`AssemblyError::OversizedBlock`] — silently
    /// dropping pinned content would corrupt the agent's instructions.
    /// Flexible blocks are then included whole, trimmed to the remaining
    /// budget, or excluded.
    pub fn assemble(
        &self,
        blocks: Vec<ContextBlock>,
        budget_tokens: usize,
    ) -> Result<Assembly, AssemblyError> {
        // Stable sort: equal priorities keep input order, so assembly is
        // deterministic for identical inputs.
        let mut ordered: Vec<ContextBlock> = blocks;
        ordered.sort_by_key(|b| std::cmp::Reverse(b.priority));

        let mut budget = Budget::new(budget_tokens);
        let mut placed: Vec<Option<ContextBlock>> = Vec::with_capacity(ordered.len());
        let mut entries: Vec<BlockEntry> = Vec::with_capacity(ordered.len());
        placed.resize_with(ordered.len(), || None);
        entries.resize(
            ordered.len(),
            BlockEntry {
                name: String::new(),
                priority: 0,
                disposition: BlockDisposition::Excluded,
            },
        );

        // Pass 1: pinned blocks, in priority order.
        for (slot, block) in ordered.iter().enumerate() {
            if block.truncatable {
                continue;
            }
            let needed = self.counter.count(&block.content);
            if !budget.charge(needed) {
                return Err(AssemblyError::OversizedBlock {
                    name: block.name.clone(),
                    needed,
                    remaining: budget.remaining(),
                    budget: budget_tokens,
                });
            }
            entries[slot] = BlockEntry {
                name: block.name.clone(),
                priority: block.priority,
                disposition: BlockDisposition::Included,
            };
            placed[slot] = Some(block.clone());
        }

        // Pass 2: flexible blocks spend whatever remains.
        for (slot, block) in ordered.iter().enumerate() {
            if !block.truncatable {
                continue;
            }
            let needed = self.counter.count(&block.content);
            let disposition = if budget.charge(needed) {
                placed[slot] = Some(block.clone());
                BlockDisposition::Included
            } else if let Some((trimmed, kept)) =
                self.truncate_to_fit(&block.content, budget.remaining())
            {
                budget.charge(kept);
                warn!(
                    "context block '{}' truncated from {needed} to {kept} tokens",
                    block.name
                );
                let mut kept_block = block.clone();
                kept_block.content = trimmed;
                placed[slot] = Some(kept_block);
                BlockDisposition::Truncated {
                    original_tokens: needed,
                    kept_tokens: kept,
                }
            } else {
                debug!("context block '{}' excluded ({needed} tokens)", block.name);
                BlockDisposition::Excluded
            };
            entries[slot] = BlockEntry {
                name: block.name.clone(),
                priority: block.priority,
                disposition,
            };
        }

        let used_tokens = budget.used();
        let messages = placed
            .into_iter()
            .flatten()
            .map(ContextBlock::into_message)
            .collect();

        Ok(Assembly {
            messages,
            used_tokens,
            report: AssemblyReport {
                entries,
                used_tokens,
                budget_tokens,
            },
        })
    }

    /// Largest char-boundary prefix of `content` that the counter says fits
    /// in `remaining` tokens. `None` when not even one char fits.
    fn truncate_to_fit(&self, content: &str, remaining: usize) -> Option<(String, usize)> {
        if remaining == 0 {
            return None;
        }
        let chars: Vec<char> = content.chars().collect();

        // Binary search over prefix length; the estimate is monotone in
        // content length for any sane counter.
        let mut lo = 0usize;
        let mut hi = chars.len();
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            let prefix: String = chars[..mid].iter().collect();
            if self.counter.count(&prefix) <= remaining {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        if lo == 0 {
            return None;
        }
        let prefix: String = chars[..lo].iter().collect();
        let kept = self.counter.count(&prefix);
        Some((prefix, kept))
    }
}
