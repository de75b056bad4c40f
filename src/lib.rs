//! Yururi: a Discord relay bot that forwards mentioned messages to the xAI
//! chat API with per-channel rolling context and a durable per-guild /
//! per-user transcript log.

pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod memory;
pub mod messaging;
pub mod names;
pub mod reply;
pub mod router;
pub mod transcript;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Identity of a conversation: a guild (or none for direct messages) and a
/// channel. The sole key for rolling memory and the per-conversation locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub guild_id: Option<u64>,
    pub channel_id: u64,
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.guild_id {
            Some(guild_id) => write!(f, "guild:{}/channel:{}", guild_id, self.channel_id),
            None => write!(f, "dm/channel:{}", self.channel_id),
        }
    }
}

/// Message roles. The set is closed; transcripts only ever carry `user` and
/// `assistant`, prompts additionally carry `system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One prompt or history message. Immutable once created; ordering within a
/// sequence is chronological, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Inbound message from the messaging transport, already mention-stripped.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: u64,
    pub author_id: u64,
    pub author_display_name: String,
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl InboundMessage {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey { guild_id: self.guild_id, channel_id: self.channel_id }
    }
}

/// File attachment metadata, adapted from the transport's native type so the
/// core never touches platform-specific structs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: Option<String>,
    pub filename: String,
    pub size_bytes: u64,
    pub url: String,
}

/// Status updates for the messaging transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Show the transient "working" indicator (typing on Discord).
    Thinking,
    /// Cancel the working indicator.
    StopTyping,
}
