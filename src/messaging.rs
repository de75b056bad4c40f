//! Messaging transport boundary.
//!
//! The orchestrator talks to the platform exclusively through
//! [`ResponseSink`]; adapters translate platform-native events into
//! [`crate::InboundMessage`] and implement the sink over their own send
//! primitives.

pub mod discord;

use crate::error::TransportError;
use crate::{Attachment, StatusUpdate};
use async_trait::async_trait;

/// At most this many image attachments are forwarded per turn.
pub const IMAGE_LIMIT: usize = 2;

/// Attachments above this size are skipped.
pub const IMAGE_MAX_BYTES: u64 = 10 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg"];

/// Per-conversation reply surface handed to the orchestrator alongside each
/// inbound message.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Send one reply chunk to the conversation.
    async fn reply(&self, text: &str) -> Result<(), TransportError>;

    /// Show or clear the transient working indicator.
    async fn send_status(&self, status: StatusUpdate);

    /// Re-register the application commands for the current guild.
    async fn sync_commands(&self) -> Result<(), TransportError>;
}

fn is_image_attachment(attachment: &Attachment) -> bool {
    if attachment
        .content_type
        .as_deref()
        .is_some_and(|content_type| content_type.starts_with("image/"))
    {
        return true;
    }
    let filename = attachment.filename.to_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .any(|extension| filename.ends_with(extension))
}

/// URLs of the first [`IMAGE_LIMIT`] image attachments within the size cap.
pub fn collect_image_urls(attachments: &[Attachment]) -> Vec<String> {
    let mut urls = Vec::new();
    for attachment in attachments {
        if urls.len() >= IMAGE_LIMIT {
            break;
        }
        if !is_image_attachment(attachment) {
            continue;
        }
        if attachment.size_bytes > IMAGE_MAX_BYTES {
            continue;
        }
        urls.push(attachment.url.clone());
    }
    urls
}
