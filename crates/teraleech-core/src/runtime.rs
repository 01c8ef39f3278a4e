//! Bot runtime
//!
//! Consumes inbound envelopes from the event bus, spawning one task per
//! message. Share links become transfers; commands and settings-panel
//! callbacks are answered directly.

use crate::log_buffer::LogBuffer;
use crate::orchestrator::{TransferError, TransferOrchestrator, TransferRequest};
use crate::progress::{Requester, StatusHandle};
use crate::sanitize::escape_html;
use std::sync::Arc;
use teraleech_config::{Config, RuntimeSettings, SettingChange};
use teraleech_ipc::{Envelope, EventBus, MessageKind, Sender};
use teraleech_resolver::extract_share_link;
use teraleech_telegram::menu::{self, InlineButton, SettingsAction};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Inline logs above this many characters are sent as a file instead.
pub const INLINE_LOG_LIMIT: usize = 4000;
const HINT_MAX_WORDS: usize = 10;

/// Chat operations the runtime needs beyond status edits and uploads.
#[async_trait::async_trait]
pub trait BotSurface: Send + Sync {
    /// Returns the new message id.
    async fn send_html(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<i64>;

    async fn send_panel(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> anyhow::Result<()>;

    async fn edit_panel(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> anyhow::Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()>;

    async fn answer_callback(&self, query_id: &str, text: Option<&str>);

    async fn send_document(
        &self,
        chat_id: i64,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()>;
}

pub struct AppContext {
    pub config: Config,
    pub settings: RwLock<RuntimeSettings>,
    pub surface: Arc<dyn BotSurface>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub log_buffer: LogBuffer,
    pub engine: String,
}

impl AppContext {
    pub fn new(
        config: Config,
        surface: Arc<dyn BotSurface>,
        orchestrator: Arc<TransferOrchestrator>,
        log_buffer: LogBuffer,
        engine: String,
    ) -> Self {
        let settings = RwLock::new(config.initial_settings());
        Self {
            config,
            settings,
            surface,
            orchestrator,
            log_buffer,
            engine,
        }
    }
}

pub struct BotRuntime {
    ctx: Arc<AppContext>,
}

impl BotRuntime {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Processes inbound envelopes until the bus closes.
    pub async fn run(&self, event_bus: &EventBus) -> anyhow::Result<()> {
        info!("Teraleech runtime starting...");
        let mut inbound_rx = event_bus.subscribe();

        loop {
            match inbound_rx.recv().await {
                Ok(envelope) => {
                    let ctx = Arc::clone(&self.ctx);
                    let trace_id = envelope.trace_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_envelope(&ctx, envelope).await {
                            error!(
                                "Error processing inbound message (trace_id={}): {:#}",
                                trace_id, e
                            );
                        }
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping message processor");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} messages", n);
                }
            }
        }
        Ok(())
    }
}

pub async fn handle_envelope(ctx: &Arc<AppContext>, envelope: Envelope) -> anyhow::Result<()> {
    let Some(sender) = envelope.from.clone() else {
        debug!(trace_id = %envelope.trace_id, "envelope without sender ignored");
        return Ok(());
    };

    match &envelope.kind {
        MessageKind::Command { name, args } => {
            handle_command(ctx, &envelope, &sender, name, args).await
        }
        MessageKind::Text { text } => handle_text(ctx, &envelope, &sender, text).await,
        MessageKind::Callback { query_id, data } => {
            handle_callback(ctx, &envelope, &sender, query_id, data).await
        }
    }
}

async fn reply(ctx: &AppContext, envelope: &Envelope, text: &str) -> anyhow::Result<()> {
    ctx.surface
        .send_html(envelope.chat_id, text, envelope.message_id)
        .await?;
    Ok(())
}

async fn handle_text(
    ctx: &Arc<AppContext>,
    envelope: &Envelope,
    sender: &Sender,
    text: &str,
) -> anyhow::Result<()> {
    match extract_share_link(text) {
        Some(url) => start_transfer(ctx, envelope, sender, url).await,
        None => {
            let trimmed = text.trim_start();
            if !trimmed.starts_with('/') && text.split_whitespace().count() <= HINT_MAX_WORDS {
                reply(
                    ctx,
                    envelope,
                    "Please send a valid Terabox link. If you need help, type /help.",
                )
                .await?;
            }
            Ok(())
        }
    }
}

async fn start_transfer(
    ctx: &Arc<AppContext>,
    envelope: &Envelope,
    sender: &Sender,
    url: String,
) -> anyhow::Result<()> {
    let preview: String = url.chars().take(50).collect();
    let status_text = format!("🔄 Processing Terabox link: {}...", escape_html(&preview));
    let status_id = ctx
        .surface
        .send_html(envelope.chat_id, &status_text, envelope.message_id)
        .await?;

    let dump_channel = ctx.settings.read().await.dump_channel_id();
    let request = TransferRequest::new(
        url,
        Requester {
            id: sender.id,
            first_name: sender.first_name.clone(),
        },
        envelope.chat_id,
        envelope.message_id,
        dump_channel,
    );
    info!(
        request = %request.id,
        user = sender.id,
        delivery = request.delivery_chat_id,
        "Transfer started for {}",
        request.source_url
    );

    let reporter = Arc::clone(ctx.orchestrator.reporter());
    let handle = StatusHandle {
        chat_id: envelope.chat_id,
        message_id: status_id,
    };
    reporter
        .register_with_text(&request.id, handle, &status_text)
        .await;

    let orchestrator = Arc::clone(&ctx.orchestrator);
    let task_request = request.clone();
    let outcome = tokio::spawn(async move { orchestrator.run(&task_request).await }).await;

    let unexpected = match outcome {
        Ok(Ok(report)) => {
            info!(
                request = %request.id,
                found = report.files_found,
                uploaded = report.uploaded(),
                "Transfer finished"
            );
            None
        }
        Ok(Err(TransferError::Resolution(_))) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(join) => Some(join.to_string()),
    };

    if let Some(detail) = unexpected {
        error!(request = %request.id, "Unexpected transfer failure: {}", detail);
        let short: String = detail.chars().take(100).collect();
        reporter
            .report(
                &request.id,
                &format!(
                    "❌ An unexpected error occurred. Please try again later or check the link.\nError: {}",
                    escape_html(&short)
                ),
            )
            .await;
    }

    reporter.release(&request.id).await;
    Ok(())
}

async fn handle_command(
    ctx: &Arc<AppContext>,
    envelope: &Envelope,
    sender: &Sender,
    name: &str,
    args: &[String],
) -> anyhow::Result<()> {
    match name {
        "start" => {
            let greeting = format!(
                "Hello {}!\nI can help you download files from Terabox links.\n\
                 Just send me a Terabox link, and I'll process it for you.\n\n\
                 Type /help for more information.",
                escape_html(&sender.first_name)
            );
            reply(ctx, envelope, &greeting).await
        }
        "help" => reply(ctx, envelope, HELP_TEXT).await,
        "setdump" | "setfsub" | "viewconfig" | "settings" | "logs" => {
            if !ctx.config.is_admin(sender.id) {
                warn!(user = sender.id, command = name, "Unauthorized admin command");
                return reply(
                    ctx,
                    envelope,
                    "⛔ You are not authorized to use this command.",
                )
                .await;
            }
            match name {
                "setdump" => set_dump(ctx, envelope, args).await,
                "setfsub" => set_fsub(ctx, envelope, args).await,
                "viewconfig" => reply(ctx, envelope, &config_summary(ctx).await).await,
                "settings" => {
                    let (text, keyboard) = menu::settings_menu();
                    ctx.surface
                        .send_panel(envelope.chat_id, &text, &keyboard)
                        .await
                }
                _ => send_logs(ctx, envelope).await,
            }
        }
        other => {
            debug!(command = other, "Unknown command ignored");
            Ok(())
        }
    }
}

const HELP_TEXT: &str = "<b>How to use this bot:</b>\n\n\
    1. Send any valid Terabox link directly to me.\n\
    2. I will attempt to fetch the direct download link(s).\n\
    3. The file(s) will be downloaded and then uploaded here.\n\n\
    <b>Features:</b>\n\
    - Shows download progress.\n\
    - Handles single files and folders.\n\
    - Uses Aria2 for faster downloads when available.\n\n\
    If you encounter any issues, please ensure your link is correct and publicly accessible.";

async fn set_dump(ctx: &AppContext, envelope: &Envelope, args: &[String]) -> anyhow::Result<()> {
    let Some(raw) = args.first() else {
        return reply(
            ctx,
            envelope,
            "Usage: <code>/setdump &lt;channel_id&gt;</code> or <code>/setdump none</code>",
        )
        .await;
    };

    let result = ctx.settings.write().await.set_dump_channel(raw);
    let text = match result {
        Ok(SettingChange::Set(id)) => {
            info!("Dump channel set to {}", id);
            format!(
                "✅ Dump channel set to <code>{}</code>. Make sure the bot is an admin there.",
                id
            )
        }
        Ok(SettingChange::Cleared) => {
            info!("Dump channel cleared");
            "✅ Dump channel disabled. Files will be sent to users directly.".to_string()
        }
        Err(msg) => format!("❌ {}", msg),
    };
    reply(ctx, envelope, &text).await
}

async fn set_fsub(ctx: &AppContext, envelope: &Envelope, args: &[String]) -> anyhow::Result<()> {
    let Some(raw) = args.first() else {
        return reply(
            ctx,
            envelope,
            "Usage: <code>/setfsub @channel</code>, <code>/setfsub -100xxxxxxxxxx</code> or <code>/setfsub none</code>",
        )
        .await;
    };

    let result = ctx.settings.write().await.set_force_sub(raw);
    let text = match result {
        Ok(SettingChange::Set(target)) => {
            info!("Force-sub channel set to {}", target);
            format!(
                "✅ Force subscribe channel set to <code>{}</code>.",
                escape_html(&target.to_string())
            )
        }
        Ok(SettingChange::Cleared) => {
            info!("Force-sub channel cleared");
            "✅ Force subscribe disabled.".to_string()
        }
        Err(msg) => format!("❌ {}", escape_html(&msg)),
    };
    reply(ctx, envelope, &text).await
}

pub async fn config_summary(ctx: &AppContext) -> String {
    let settings = ctx.settings.read().await;
    let dump = settings
        .dump_channel_id()
        .map(|id| format!("<code>{}</code>", id))
        .unwrap_or_else(|| "Not set (files go to users)".to_string());
    let fsub = settings
        .force_sub()
        .map(|target| format!("<code>{}</code>", escape_html(&target.to_string())))
        .unwrap_or_else(|| "Not set".to_string());
    format!(
        "<b>Current Bot Configuration:</b>\n\
         Dump Channel ID: {}\n\
         Force Subscribe Channel: {}\n\
         Download Engine: {}\n\
         Admins: {}",
        dump,
        fsub,
        ctx.engine,
        ctx.config.telegram.admins.len()
    )
}

async fn send_logs(ctx: &AppContext, envelope: &Envelope) -> anyhow::Result<()> {
    let logs = ctx.log_buffer.render();
    if logs.trim().is_empty() {
        return reply(ctx, envelope, "No logs captured yet.").await;
    }
    if logs.chars().count() <= INLINE_LOG_LIMIT {
        return reply(ctx, envelope, &format!("<pre>{}</pre>", escape_html(&logs))).await;
    }
    ctx.surface
        .send_document(
            envelope.chat_id,
            logs.into_bytes(),
            "bot_logs.txt",
            Some("Recent bot logs"),
        )
        .await
}

async fn handle_callback(
    ctx: &Arc<AppContext>,
    envelope: &Envelope,
    sender: &Sender,
    query_id: &str,
    data: &str,
) -> anyhow::Result<()> {
    if !ctx.config.is_admin(sender.id) {
        ctx.surface
            .answer_callback(query_id, Some("You are not authorized."))
            .await;
        return Ok(());
    }
    ctx.surface.answer_callback(query_id, None).await;

    let Some(message_id) = envelope.message_id else {
        return Ok(());
    };
    let chat_id = envelope.chat_id;
    let back = menu::back_keyboard();

    match SettingsAction::from_callback(data) {
        Some(SettingsAction::Menu) => {
            let (text, keyboard) = menu::settings_menu();
            ctx.surface
                .edit_panel(chat_id, message_id, &text, &keyboard)
                .await
        }
        Some(SettingsAction::ViewConfig) => {
            let summary = config_summary(ctx).await;
            ctx.surface
                .edit_panel(chat_id, message_id, &summary, &back)
                .await
        }
        Some(SettingsAction::DumpInfo) => {
            ctx.surface
                .edit_panel(chat_id, message_id, menu::dump_channel_help(), &back)
                .await
        }
        Some(SettingsAction::FsubInfo) => {
            ctx.surface
                .edit_panel(chat_id, message_id, menu::force_sub_help(), &back)
                .await
        }
        Some(SettingsAction::Close) => ctx.surface.delete_message(chat_id, message_id).await,
        None => {
            debug!(data, "Unknown callback ignored");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorSettings;
    use crate::progress::{ProgressReporter, ReporterSettings};
    use crate::{MediaKind, SentMessage, StatusTransport, TransportError, UploadSink};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use teraleech_config::DownloadConfig;
    use teraleech_download::streaming::StreamingBackend;
    use teraleech_resolver::{LinkResolver, ResolveError, ResolvedContent};

    const ADMIN: i64 = 1;
    const USER: i64 = 2;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Html(i64, String),
        Panel(i64, String),
        EditPanel(i64, String),
        Delete(i64),
        Answer(Option<String>),
        Document(String, usize),
        Status(String),
    }

    #[derive(Default)]
    struct FakeSurface {
        calls: StdMutex<Vec<Call>>,
    }

    impl FakeSurface {
        fn push(&self, call: Call) {
            self.calls.lock().expect("lock").push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl BotSurface for FakeSurface {
        async fn send_html(
            &self,
            chat_id: i64,
            text: &str,
            _reply_to: Option<i64>,
        ) -> anyhow::Result<i64> {
            self.push(Call::Html(chat_id, text.to_string()));
            Ok(100)
        }

        async fn send_panel(
            &self,
            chat_id: i64,
            text: &str,
            _keyboard: &[Vec<InlineButton>],
        ) -> anyhow::Result<()> {
            self.push(Call::Panel(chat_id, text.to_string()));
            Ok(())
        }

        async fn edit_panel(
            &self,
            _chat_id: i64,
            message_id: i64,
            text: &str,
            _keyboard: &[Vec<InlineButton>],
        ) -> anyhow::Result<()> {
            self.push(Call::EditPanel(message_id, text.to_string()));
            Ok(())
        }

        async fn delete_message(&self, _chat_id: i64, message_id: i64) -> anyhow::Result<()> {
            self.push(Call::Delete(message_id));
            Ok(())
        }

        async fn answer_callback(&self, _query_id: &str, text: Option<&str>) {
            self.push(Call::Answer(text.map(str::to_string)));
        }

        async fn send_document(
            &self,
            _chat_id: i64,
            bytes: Vec<u8>,
            filename: &str,
            _caption: Option<&str>,
        ) -> anyhow::Result<()> {
            self.push(Call::Document(filename.to_string(), bytes.len()));
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl StatusTransport for FakeSurface {
        async fn edit_status(&self, _chat_id: i64, _message_id: i64, text: &str) -> Result<(), TransportError> {
            self.push(Call::Status(text.to_string()));
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl UploadSink for FakeSurface {
        async fn send_media(
            &self,
            _kind: MediaKind,
            _chat_id: i64,
            _path: &Path,
            _caption: &str,
            _filename: &str,
        ) -> anyhow::Result<Option<SentMessage>> {
            Ok(None)
        }

        async fn send_text(
            &self,
            chat_id: i64,
            text: &str,
            _reply_to: Option<i64>,
        ) -> anyhow::Result<Option<SentMessage>> {
            self.push(Call::Html(chat_id, text.to_string()));
            Ok(None)
        }
    }

    struct OfflineResolver;

    impl LinkResolver for OfflineResolver {
        fn resolve(&self, _url: &str) -> Result<ResolvedContent, ResolveError> {
            Err(ResolveError::NoApi)
        }
    }

    fn context(surface: Arc<FakeSurface>, log_buffer: LogBuffer) -> Arc<AppContext> {
        let mut config = Config::default();
        config.telegram.admins = vec![ADMIN];
        let reporter = Arc::new(ProgressReporter::new(
            surface.clone(),
            ReporterSettings {
                min_interval: Duration::ZERO,
                max_retry_wait: Duration::from_millis(10),
                max_total_wait: Duration::from_millis(50),
                breaker_threshold: 3,
                breaker_cooldown: Duration::from_secs(60),
            },
        ));
        let backend = Arc::new(StreamingBackend::new(&DownloadConfig::default()).expect("backend"));
        let orchestrator = Arc::new(TransferOrchestrator::new(
            Arc::new(OfflineResolver),
            backend,
            surface.clone(),
            reporter,
            OrchestratorSettings {
                temp_dir: std::env::temp_dir().join("teraleech-runtime-tests"),
                poll_interval: Duration::from_millis(5),
                progress_interval: Duration::from_millis(5),
                max_upload_bytes: 1024,
                bot_username: None,
            },
        ));
        Arc::new(AppContext::new(
            config,
            surface,
            orchestrator,
            log_buffer,
            "HTTP stream".to_string(),
        ))
    }

    fn envelope(from: i64, text: &str) -> Envelope {
        Envelope::new(from, MessageKind::from_text(text))
            .with_message_id(9)
            .with_sender(Sender {
                id: from,
                first_name: "Ana".to_string(),
                username: None,
            })
    }

    fn callback(from: i64, data: &str) -> Envelope {
        Envelope::new(
            from,
            MessageKind::Callback {
                query_id: "q1".to_string(),
                data: data.to_string(),
            },
        )
        .with_message_id(55)
        .with_sender(Sender {
            id: from,
            first_name: "Ana".to_string(),
            username: None,
        })
    }

    #[tokio::test]
    async fn short_text_without_link_gets_hint() {
        let surface = Arc::new(FakeSurface::default());
        let ctx = context(surface.clone(), LogBuffer::default());

        handle_envelope(&ctx, envelope(USER, "hello there")).await.expect("handle");
        let long = "word ".repeat(11);
        handle_envelope(&ctx, envelope(USER, &long)).await.expect("handle");

        let calls = surface.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Html(USER, text) if text.starts_with("Please send a valid Terabox link")));
    }

    #[tokio::test]
    async fn admin_commands_require_admin() {
        let surface = Arc::new(FakeSurface::default());
        let ctx = context(surface.clone(), LogBuffer::default());

        handle_envelope(&ctx, envelope(USER, "/setdump -1001234567890"))
            .await
            .expect("handle");

        assert_eq!(ctx.settings.read().await.dump_channel_id(), None);
        assert!(matches!(&surface.calls()[0], Call::Html(_, text) if text.starts_with("⛔")));
    }

    #[tokio::test]
    async fn setdump_updates_shared_settings() {
        let surface = Arc::new(FakeSurface::default());
        let ctx = context(surface.clone(), LogBuffer::default());

        handle_envelope(&ctx, envelope(ADMIN, "/setdump -1001234567890"))
            .await
            .expect("handle");
        assert_eq!(
            ctx.settings.read().await.dump_channel_id(),
            Some(-1001234567890)
        );

        handle_envelope(&ctx, envelope(ADMIN, "/setdump 12345"))
            .await
            .expect("handle");
        assert_eq!(
            ctx.settings.read().await.dump_channel_id(),
            Some(-1001234567890)
        );

        handle_envelope(&ctx, envelope(ADMIN, "/setdump none"))
            .await
            .expect("handle");
        assert_eq!(ctx.settings.read().await.dump_channel_id(), None);

        let calls = surface.calls();
        assert!(matches!(&calls[1], Call::Html(_, text) if text.starts_with("❌")));
    }

    #[tokio::test]
    async fn setfsub_is_shown_in_viewconfig() {
        let surface = Arc::new(FakeSurface::default());
        let ctx = context(surface.clone(), LogBuffer::default());

        handle_envelope(&ctx, envelope(ADMIN, "/setfsub mychannel"))
            .await
            .expect("handle");
        handle_envelope(&ctx, envelope(ADMIN, "/viewconfig"))
            .await
            .expect("handle");

        let calls = surface.calls();
        assert!(matches!(&calls[1], Call::Html(_, text) if text.contains("<code>@mychannel</code>")));
    }

    #[tokio::test]
    async fn settings_panel_callbacks() {
        let surface = Arc::new(FakeSurface::default());
        let ctx = context(surface.clone(), LogBuffer::default());

        handle_envelope(&ctx, envelope(ADMIN, "/settings")).await.expect("handle");
        handle_envelope(&ctx, callback(ADMIN, menu::CALLBACK_VIEW_CONFIG))
            .await
            .expect("handle");
        handle_envelope(&ctx, callback(ADMIN, menu::CALLBACK_CLOSE))
            .await
            .expect("handle");
        handle_envelope(&ctx, callback(USER, menu::CALLBACK_CLOSE))
            .await
            .expect("handle");

        let calls = surface.calls();
        assert!(matches!(&calls[0], Call::Panel(ADMIN, _)));
        assert_eq!(calls[1], Call::Answer(None));
        assert!(matches!(&calls[2], Call::EditPanel(55, text) if text.contains("Current Bot Configuration")));
        assert_eq!(calls[3], Call::Answer(None));
        assert_eq!(calls[4], Call::Delete(55));
        assert_eq!(
            calls[5],
            Call::Answer(Some("You are not authorized.".to_string()))
        );
        assert_eq!(calls.len(), 6);
    }

    #[tokio::test]
    async fn logs_switch_to_document_when_long() {
        let surface = Arc::new(FakeSurface::default());
        let buffer = LogBuffer::new(200);
        let ctx = context(surface.clone(), buffer.clone());

        buffer.push("short line".to_string());
        handle_envelope(&ctx, envelope(ADMIN, "/logs")).await.expect("handle");

        for i in 0..100 {
            buffer.push(format!("{} {}", i, "x".repeat(80)));
        }
        handle_envelope(&ctx, envelope(ADMIN, "/logs")).await.expect("handle");

        let calls = surface.calls();
        assert!(matches!(&calls[0], Call::Html(_, text) if text.starts_with("<pre>short line")));
        assert!(matches!(&calls[1], Call::Document(name, _) if name == "bot_logs.txt"));
    }

    #[tokio::test]
    async fn resolution_failure_is_reported_on_status_message() {
        let surface = Arc::new(FakeSurface::default());
        let ctx = context(surface.clone(), LogBuffer::default());

        handle_envelope(&ctx, envelope(USER, "get https://terabox.com/s/abc123 now"))
            .await
            .expect("handle");

        let calls = surface.calls();
        assert!(matches!(&calls[0], Call::Html(USER, text) if text.starts_with("🔄 Processing Terabox link")));
        assert_eq!(
            calls[1],
            Call::Status("❌ Error processing link: no resolver API configured".to_string())
        );
    }
}
