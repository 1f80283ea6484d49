//! Conversation storage.
//!
//! The store is an explicit instance passed to the engine by reference, the
//! same way the action registry is. Within a single turn it behaves
//! append-only; [`ConversationStore::replace_all`] exists solely so the
//! compression manager can swap a summarized history in between iterations.

use crate::Message;
use std::sync::Mutex;

/// Durable(ish) home of the conversation history.
pub trait ConversationStore: Send + Sync {
    /// Append one message to the end of the history.
    fn append(&self, message: Message);

    /// A point-in-time copy of the full history.
    fn snapshot(&self) -> Vec<Message>;

    /// Replace the entire history. Only the compression manager's rewrite
    /// path uses this, and only between iterations.
    fn replace_all(&self, messages: Vec<Message>);

    /// Number of stored messages.
    fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the history is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store behind a mutex.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    messages: Mutex<Vec<Message>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-seeded with messages.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }
}

impl ConversationStore for InMemoryStore {
    fn append(&self, message: Message) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    fn snapshot(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_all(&self, messages: Vec<Message>) {
        *self.messages.lock().unwrap_or_else(|e| e.into_inner()) = messages;
    }

    fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
