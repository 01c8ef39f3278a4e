//! Teraleech Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! status-message editing with typed flood-wait errors, and multipart media
//! uploads

pub mod menu;

use menu::InlineButton;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use teraleech_config::TelegramConfig;
use teraleech_ipc::{Envelope, EventBus, MessageKind, Sender};
use tokio::fs;
use tracing::{debug, info, warn};

pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

/// Upload throughput assumed when sizing per-request upload timeouts.
const ASSUMED_UPLOAD_BYTES_PER_SEC: u64 = 10 * 1024 * 1024 / 60;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("telegram {method} request failed: {source}")]
    Request {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("telegram {method} flood wait: retry after {}s", .retry_after.as_secs())]
    RetryAfter { method: String, retry_after: Duration },

    #[error("telegram {method} API error {code}: {description}")]
    Api {
        method: String,
        code: i64,
        description: String,
    },

    #[error("telegram {method} decode failed: {message}")]
    Decode { method: String, message: String },

    #[error("telegram upload io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelegramError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TelegramError::RetryAfter { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    fn description(&self) -> Option<&str> {
        match self {
            TelegramError::Api { description, .. } => Some(description),
            _ => None,
        }
    }

    fn is_parse_entities_error(&self) -> bool {
        self.description()
            .is_some_and(|d| d.to_ascii_lowercase().contains("can't parse entities"))
    }

    fn is_reply_target_missing(&self) -> bool {
        self.description().is_some_and(|d| {
            d.to_ascii_lowercase()
                .contains("message to be replied not found")
        })
    }

    pub fn is_not_modified(&self) -> bool {
        self.description()
            .is_some_and(|d| d.to_ascii_lowercase().contains("message is not modified"))
    }
}

pub type TelegramResult<T> = std::result::Result<T, TelegramError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Plain,
    Html,
    Markdown,
}

impl ParseMode {
    fn as_api(&self) -> Option<&'static str> {
        match self {
            ParseMode::Plain => None,
            ParseMode::Html => Some("HTML"),
            ParseMode::Markdown => Some("Markdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Document,
}

impl MediaKind {
    fn method(&self) -> &'static str {
        match self {
            MediaKind::Video => "sendVideo",
            MediaKind::Audio => "sendAudio",
            MediaKind::Document => "sendDocument",
        }
    }

    fn field(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub video: Option<TelegramFile>,
    #[serde(default)]
    pub audio: Option<TelegramFile>,
    #[serde(default)]
    pub document: Option<TelegramFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Upload request for [`TelegramAdapter::send_media`].
#[derive(Debug, Clone)]
pub struct MediaUpload<'a> {
    pub kind: MediaKind,
    pub chat_id: i64,
    pub path: &'a Path,
    pub caption: &'a str,
    pub filename: &'a str,
    pub parse_mode: ParseMode,
}

#[derive(Clone)]
pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    api_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> anyhow::Result<Self> {
        let api_url = format!("{}/bot{}", config.api_base_url(), config.bot_token);
        Ok(Self {
            client: Self::build_client()?,
            bot_token: config.bot_token.clone(),
            api_url,
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(60),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> anyhow::Result<Client> {
        Ok(ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()?)
    }

    fn offset_path(&self) -> PathBuf {
        let runtime_dir = self.data_dir.join("runtime");
        let bot_id = self.bot_token.split(':').next().unwrap_or("default");
        runtime_dir.join(format!("telegram.{}.offset", bot_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::write(&p, format!("{}\n", offset)).await {
            warn!("Failed to persist Telegram offset to {}: {}", p.display(), e);
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.api_url, method)
    }

    /// Decodes a Bot API envelope, mapping `ok=false` into typed errors.
    async fn decode<T: DeserializeOwned>(
        method: &str,
        resp: reqwest::Response,
    ) -> TelegramResult<T> {
        let status = resp.status();
        let body = resp.text().await.map_err(|e| TelegramError::Request {
            method: method.to_string(),
            source: e,
        })?;
        let parsed: ApiResponse<T> =
            serde_json::from_str(&body).map_err(|e| TelegramError::Decode {
                method: method.to_string(),
                message: format!("HTTP {}: {} | body={}", status, e, truncate(&body, 300)),
            })?;

        if parsed.ok {
            return parsed.result.ok_or_else(|| TelegramError::Decode {
                method: method.to_string(),
                message: "ok=true without result".to_string(),
            });
        }

        if let Some(secs) = parsed.parameters.as_ref().and_then(|p| p.retry_after) {
            return Err(TelegramError::RetryAfter {
                method: method.to_string(),
                retry_after: Duration::from_secs(secs),
            });
        }

        Err(TelegramError::Api {
            method: method.to_string(),
            code: parsed.error_code.unwrap_or(i64::from(status.as_u16())),
            description: parsed
                .description
                .unwrap_or_else(|| "no description".to_string()),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        client: &Client,
        method: &str,
        payload: &serde_json::Value,
    ) -> TelegramResult<T> {
        let resp = client
            .post(self.endpoint(method))
            .json(payload)
            .send()
            .await
            .map_err(|e| TelegramError::Request {
                method: method.to_string(),
                source: e,
            })?;
        Self::decode(method, resp).await
    }

    /// Retries once without `parse_mode` when entities do not parse and
    /// without `reply_to_message_id` when the reply target is gone.
    async fn call_with_fallback<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> TelegramResult<T> {
        let mut payload = payload;
        for _ in 0..3 {
            let result = self.call(&self.client, method, &payload).await;
            match result {
                Err(err) if err.is_parse_entities_error() && strip_key(&mut payload, "parse_mode") => {
                    warn!(
                        "telegram {} rejected formatted payload, retrying without parse_mode",
                        method
                    );
                }
                Err(err)
                    if err.is_reply_target_missing()
                        && strip_key(&mut payload, "reply_to_message_id") =>
                {
                    warn!(
                        "telegram {} failed due to missing reply target; retrying without reply_to_message_id",
                        method
                    );
                }
                other => return other,
            }
        }
        self.call(&self.client, method, &payload).await
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> TelegramResult<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        self.call(client, "getUpdates", &payload).await
    }

    pub async fn get_me(&self) -> TelegramResult<TelegramUser> {
        self.call(&self.client, "getMe", &serde_json::json!({})).await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: ParseMode,
        reply_to: Option<i64>,
        inline_keyboard: Option<&[Vec<InlineButton>]>,
    ) -> TelegramResult<TelegramMessage> {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "text": truncate(text, TELEGRAM_MAX_MESSAGE_LEN),
            "disable_web_page_preview": true,
        });
        if let Some(mode) = parse_mode.as_api() {
            payload["parse_mode"] = serde_json::json!(mode);
        }
        if let Some(reply_to_message_id) = reply_to {
            payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
        }
        if let Some(keyboard) = inline_keyboard {
            payload["reply_markup"] = keyboard_markup(keyboard);
        }

        self.call_with_fallback("sendMessage", payload).await
    }

    /// "message is not modified" is treated as success.
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        parse_mode: ParseMode,
        inline_keyboard: Option<&[Vec<InlineButton>]>,
    ) -> TelegramResult<()> {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": truncate(text, TELEGRAM_MAX_MESSAGE_LEN),
            "disable_web_page_preview": true,
        });
        if let Some(mode) = parse_mode.as_api() {
            payload["parse_mode"] = serde_json::json!(mode);
        }
        if let Some(keyboard) = inline_keyboard {
            payload["reply_markup"] = keyboard_markup(keyboard);
        }

        match self
            .call_with_fallback::<serde_json::Value>("editMessageText", payload)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_modified() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> TelegramResult<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });
        self.call::<bool>(&self.client, "deleteMessage", &payload)
            .await
            .map(|_| ())
    }

    pub async fn answer_callback_query(&self, callback_query_id: &str, text: Option<&str>) {
        let mut payload = serde_json::json!({
            "callback_query_id": callback_query_id,
        });
        if let Some(t) = text {
            payload["text"] = serde_json::json!(t);
        }
        if let Err(e) = self
            .call::<bool>(&self.client, "answerCallbackQuery", &payload)
            .await
        {
            debug!("answerCallbackQuery failed: {}", e);
        }
    }

    /// Streams a local file to `sendVideo` / `sendAudio` / `sendDocument`.
    pub async fn send_media(&self, upload: MediaUpload<'_>) -> TelegramResult<TelegramMessage> {
        let method = upload.kind.method();
        let file = fs::File::open(upload.path).await?;
        let size = file.metadata().await?.len();

        let part = Part::stream_with_length(Body::from(file), size)
            .file_name(upload.filename.to_string());
        let mut form = Form::new()
            .text("chat_id", upload.chat_id.to_string())
            .text("caption", truncate(upload.caption, 1024))
            .part(upload.kind.field(), part);
        if let Some(mode) = upload.parse_mode.as_api() {
            form = form.text("parse_mode", mode);
        }
        if upload.kind == MediaKind::Video {
            form = form.text("supports_streaming", "true");
        }

        info!(
            method,
            chat_id = upload.chat_id,
            bytes = size,
            "Uploading {}",
            upload.filename
        );
        let resp = self
            .client
            .post(self.endpoint(method))
            .multipart(form)
            .timeout(upload_timeout(size))
            .send()
            .await
            .map_err(|e| TelegramError::Request {
                method: method.to_string(),
                source: e,
            })?;
        Self::decode(method, resp).await
    }

    /// Sends an in-memory buffer as a document (used for log dumps).
    pub async fn send_document_bytes(
        &self,
        chat_id: i64,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> TelegramResult<TelegramMessage> {
        let method = "sendDocument";
        let part = Part::bytes(bytes).file_name(filename.to_string());
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        let resp = self
            .client
            .post(self.endpoint(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TelegramError::Request {
                method: method.to_string(),
                source: e,
            })?;
        Self::decode(method, resp).await
    }

    pub async fn poll(&self) -> anyhow::Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client()?;
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    let wait = err.retry_after().unwrap_or(Duration::from_secs(2));
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(envelope) = Self::envelope_from_update(&update) {
                    self.forward(envelope);
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> TelegramResult<()> {
        let payload = serde_json::json!({ "commands": menu::bot_commands() });
        self.call::<bool>(client, "setMyCommands", &payload)
            .await
            .map(|_| ())
    }

    fn forward(&self, envelope: Envelope) {
        match &self.event_bus {
            Some(event_bus) => {
                if let Err(e) = event_bus.publish(envelope) {
                    warn!("Failed to publish update to event bus: {}", e);
                }
            }
            None => info!("No event bus configured, update not forwarded"),
        }
    }

    fn sender_from(user: &TelegramUser) -> Sender {
        Sender {
            id: user.id,
            first_name: user.first_name.clone(),
            username: user.username.clone(),
        }
    }

    pub fn envelope_from_update(update: &TelegramUpdate) -> Option<Envelope> {
        if let Some(message) = &update.message {
            let user = message.from.as_ref()?;
            if user.is_bot.unwrap_or(false) {
                return None;
            }
            let text = message.text.as_deref()?;
            info!(
                "Received message from {}: {}",
                user.username.as_deref().unwrap_or("unknown"),
                truncate(text, 120)
            );
            return Some(
                Envelope::new(message.chat.id, MessageKind::from_text(text))
                    .with_message_id(message.message_id)
                    .with_sender(Self::sender_from(user)),
            );
        }

        if let Some(callback) = &update.callback_query {
            let message = callback.message.as_ref()?;
            info!("Received callback query: {:?}", callback.data);
            return Some(
                Envelope::new(
                    message.chat.id,
                    MessageKind::Callback {
                        query_id: callback.id.clone(),
                        data: callback.data.clone().unwrap_or_default(),
                    },
                )
                .with_message_id(message.message_id)
                .with_sender(Self::sender_from(&callback.from)),
            );
        }

        None
    }
}

fn keyboard_markup(keyboard: &[Vec<InlineButton>]) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": keyboard.iter().map(|row| {
            row.iter().map(|btn| serde_json::json!({
                "text": btn.text,
                "callback_data": btn.callback_data
            })).collect::<Vec<_>>()
        }).collect::<Vec<_>>()
    })
}

fn strip_key(payload: &mut serde_json::Value, key: &str) -> bool {
    payload
        .as_object_mut()
        .map(|obj| obj.remove(key).is_some())
        .unwrap_or(false)
}

/// Between 2 and 61 minutes, scaled by file size.
pub fn upload_timeout(size_bytes: u64) -> Duration {
    let estimate = size_bytes / ASSUMED_UPLOAD_BYTES_PER_SEC;
    Duration::from_secs(estimate.clamp(120, 3600) + 60)
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_adapter(data_dir: PathBuf) -> TelegramAdapter {
        let config = TelegramConfig {
            bot_token: "123456:TESTTOKEN".to_string(),
            ..TelegramConfig::default()
        };
        TelegramAdapter::new(&config, data_dir).expect("adapter")
    }

    #[test]
    fn remove_reply_to_message_id_when_present() {
        let mut payload = serde_json::json!({
            "chat_id": 123,
            "text": "hello",
            "reply_to_message_id": 42
        });
        assert!(strip_key(&mut payload, "reply_to_message_id"));
        assert!(payload.get("reply_to_message_id").is_none());
        assert!(!strip_key(&mut payload, "reply_to_message_id"));
    }

    #[test]
    fn flood_wait_body_maps_to_retry_after() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#;
        let parsed: ApiResponse<serde_json::Value> = serde_json::from_str(body).expect("parse");
        assert!(!parsed.ok);
        assert_eq!(parsed.parameters.and_then(|p| p.retry_after), Some(7));
    }

    #[test]
    fn error_classification_matches_bot_api_descriptions() {
        let missing = TelegramError::Api {
            method: "sendMessage".to_string(),
            code: 400,
            description: "Bad Request: message to be replied not found".to_string(),
        };
        assert!(missing.is_reply_target_missing());
        assert!(!missing.is_not_modified());

        let unchanged = TelegramError::Api {
            method: "editMessageText".to_string(),
            code: 400,
            description: "Bad Request: message is not modified: specified new message content and reply markup are exactly the same".to_string(),
        };
        assert!(unchanged.is_not_modified());

        let entities = TelegramError::Api {
            method: "editMessageText".to_string(),
            code: 400,
            description: "Bad Request: can't parse entities: Unsupported start tag".to_string(),
        };
        assert!(entities.is_parse_entities_error());

        let flood = TelegramError::RetryAfter {
            method: "editMessageText".to_string(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(flood.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn upload_timeout_is_clamped() {
        assert_eq!(upload_timeout(0), Duration::from_secs(180));
        assert_eq!(
            upload_timeout(100 * 1024 * 1024 * 1024),
            Duration::from_secs(3660)
        );
    }

    #[test]
    fn envelope_from_text_message_carries_sender() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{
                "update_id": 10,
                "message": {
                    "message_id": 5,
                    "text": "https://terabox.com/s/abc123",
                    "chat": {"id": 77, "type": "private"},
                    "from": {"id": 77, "is_bot": false, "first_name": "Ana", "username": "ana"}
                }
            }"#,
        )
        .expect("update");
        let envelope = TelegramAdapter::envelope_from_update(&update).expect("envelope");
        assert_eq!(envelope.chat_id, 77);
        assert_eq!(envelope.message_id, Some(5));
        assert_eq!(envelope.from.map(|s| s.first_name), Some("Ana".to_string()));
        assert!(matches!(envelope.kind, MessageKind::Text { .. }));
    }

    #[test]
    fn envelope_skips_bot_senders() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{
                "update_id": 11,
                "message": {
                    "message_id": 6,
                    "text": "hello",
                    "chat": {"id": 1, "type": "private"},
                    "from": {"id": 2, "is_bot": true, "first_name": "bot"}
                }
            }"#,
        )
        .expect("update");
        assert!(TelegramAdapter::envelope_from_update(&update).is_none());
    }

    #[tokio::test]
    async fn offset_round_trips_through_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = make_adapter(dir.path().to_path_buf());
        assert_eq!(adapter.read_offset().await, None);
        adapter.write_offset(991).await;
        assert_eq!(adapter.read_offset().await, Some(991));
        assert!(adapter
            .offset_path()
            .ends_with("runtime/telegram.123456.offset"));
    }
}
