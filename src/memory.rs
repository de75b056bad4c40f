//! Bounded per-conversation rolling memory.
//!
//! Memory is a volatile cache of the durable transcript log: it can be
//! rebuilt from the log at startup, and clearing it never touches the log.

use crate::{ChatMessage, ConversationKey};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Capability set of a rolling memory store. None of the operations fail;
/// unknown keys read as empty.
pub trait Memory: Send + Sync + 'static {
    /// Messages for a conversation, oldest first. Empty when unknown.
    fn get(&self, key: ConversationKey) -> Vec<ChatMessage>;

    /// Append at the tail, evicting the oldest entry at capacity.
    fn append(&self, key: ConversationKey, message: ChatMessage);

    /// Replace the buffer with the most recent `capacity` of `messages`.
    /// Used only at process bootstrap.
    fn load_history(&self, key: ConversationKey, messages: Vec<ChatMessage>);

    /// Remove the conversation's buffer entirely.
    fn clear(&self, key: ConversationKey);
}

/// In-process memory store over per-conversation ring buffers.
#[derive(Debug)]
pub struct InMemoryStore {
    capacity: usize,
    buffers: Mutex<HashMap<ConversationKey, VecDeque<ChatMessage>>>,
}

impl InMemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, buffers: Mutex::new(HashMap::new()) }
    }
}

impl Memory for InMemoryStore {
    fn get(&self, key: ConversationKey) -> Vec<ChatMessage> {
        let buffers = self.buffers.lock().expect("memory lock poisoned");
        let messages: Vec<ChatMessage> = buffers
            .get(&key)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default();
        tracing::debug!(%key, size = messages.len(), "memory get");
        messages
    }

    fn append(&self, key: ConversationKey, message: ChatMessage) {
        // Capacity 0 keeps no history; the message is dropped rather than
        // buffered.
        if self.capacity == 0 {
            return;
        }
        let mut buffers = self.buffers.lock().expect("memory lock poisoned");
        let buffer = buffers
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        while buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(message);
        tracing::debug!(%key, size = buffer.len(), "memory append");
    }

    fn load_history(&self, key: ConversationKey, messages: Vec<ChatMessage>) {
        let mut buffer: VecDeque<ChatMessage> = messages.into();
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
        let size = buffer.len();
        let mut buffers = self.buffers.lock().expect("memory lock poisoned");
        buffers.insert(key, buffer);
        tracing::debug!(%key, size, "memory load");
    }

    fn clear(&self, key: ConversationKey) {
        let mut buffers = self.buffers.lock().expect("memory lock poisoned");
        buffers.remove(&key);
        tracing::debug!(%key, "memory cleared");
    }
}
