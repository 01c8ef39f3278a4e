//! Teraleech Core
//!
//! Transfer orchestration, progress reporting and the bot runtime that turns
//! inbound messages into transfers and admin actions

pub mod log_buffer;
pub mod orchestrator;
pub mod progress;
pub mod runtime;
pub mod sanitize;
pub mod telegram_sink;

use std::path::Path;
use std::time::Duration;

pub use teraleech_telegram::MediaKind;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("{0}")]
    Other(String),
}

/// Edits the single status message of a transfer.
#[async_trait::async_trait]
pub trait StatusTransport: Send + Sync {
    async fn edit_status(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Delivers uploaded files and plain notices.
#[async_trait::async_trait]
pub trait UploadSink: Send + Sync {
    /// `Ok(None)` means the platform accepted the call without returning a message.
    async fn send_media(
        &self,
        kind: MediaKind,
        chat_id: i64,
        path: &Path,
        caption: &str,
        filename: &str,
    ) -> anyhow::Result<Option<SentMessage>>;

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<Option<SentMessage>>;
}
