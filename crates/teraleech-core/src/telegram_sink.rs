//! Core traits implemented over the Telegram Bot API adapter.

use crate::runtime::BotSurface;
use crate::{MediaKind, SentMessage, StatusTransport, TransportError, UploadSink};
use std::path::Path;
use teraleech_telegram::menu::InlineButton;
use teraleech_telegram::{MediaUpload, ParseMode, TelegramAdapter};

#[async_trait::async_trait]
impl StatusTransport for TelegramAdapter {
    async fn edit_status(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError> {
        self.edit_message_text(chat_id, message_id, text, ParseMode::Html, None)
            .await
            .map_err(|e| match e.retry_after() {
                Some(retry_after) => TransportError::RateLimited { retry_after },
                None => TransportError::Other(e.to_string()),
            })
    }
}

#[async_trait::async_trait]
impl UploadSink for TelegramAdapter {
    async fn send_media(
        &self,
        kind: MediaKind,
        chat_id: i64,
        path: &Path,
        caption: &str,
        filename: &str,
    ) -> anyhow::Result<Option<SentMessage>> {
        let message = TelegramAdapter::send_media(
            self,
            MediaUpload {
                kind,
                chat_id,
                path,
                caption,
                filename,
                parse_mode: ParseMode::Html,
            },
        )
        .await?;
        Ok(Some(SentMessage {
            chat_id: message.chat.id,
            message_id: message.message_id,
        }))
    }

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<Option<SentMessage>> {
        let message = self
            .send_message(chat_id, text, ParseMode::Html, reply_to, None)
            .await?;
        Ok(Some(SentMessage {
            chat_id: message.chat.id,
            message_id: message.message_id,
        }))
    }
}

#[async_trait::async_trait]
impl BotSurface for TelegramAdapter {
    async fn send_html(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<i64> {
        let message = self
            .send_message(chat_id, text, ParseMode::Html, reply_to, None)
            .await?;
        Ok(message.message_id)
    }

    async fn send_panel(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> anyhow::Result<()> {
        self.send_message(chat_id, text, ParseMode::Html, None, Some(keyboard))
            .await?;
        Ok(())
    }

    async fn edit_panel(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> anyhow::Result<()> {
        self.edit_message_text(chat_id, message_id, text, ParseMode::Html, Some(keyboard))
            .await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()> {
        TelegramAdapter::delete_message(self, chat_id, message_id).await?;
        Ok(())
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) {
        self.answer_callback_query(query_id, text).await;
    }

    async fn send_document(
        &self,
        chat_id: i64,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()> {
        self.send_document_bytes(chat_id, bytes, filename, caption)
            .await?;
        Ok(())
    }
}
