//! Transfer orchestration
//!
//! Drives one request through resolution and then, file by file, through
//! preparing, downloading, verifying and uploading. A failing file is
//! reported and skipped; the batch always runs to the end. Local files are
//! removed before the next file starts.

use crate::progress::{render_progress, ProgressReporter, ProgressView, Requester};
use crate::sanitize::{escape_html, media_kind_for, sanitize_filename};
use crate::{SentMessage, UploadSink};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teraleech_config::Config;
use teraleech_download::{format_size, DownloadBackend, JobHandle, JobState};
use teraleech_resolver::{FileDescriptor, LinkResolver, ResolveError, ResolvedContent};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: String,
    pub source_url: String,
    pub user: Requester,
    pub user_chat_id: i64,
    pub source_message_id: Option<i64>,
    pub delivery_chat_id: i64,
    pub created_at: DateTime<Utc>,
}

impl TransferRequest {
    /// Files go to `dump_channel` when set, back to the user's chat otherwise.
    pub fn new(
        source_url: impl Into<String>,
        user: Requester,
        user_chat_id: i64,
        source_message_id: Option<i64>,
        dump_channel: Option<i64>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_url: source_url.into(),
            user,
            user_chat_id,
            source_message_id,
            delivery_chat_id: dump_channel.unwrap_or(user_chat_id),
            created_at: Utc::now(),
        }
    }

    pub fn delivers_to_dump(&self) -> bool {
        self.delivery_chat_id != self.user_chat_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("{0}")]
    Resolution(#[from] ResolveError),

    #[error("resolver task failed: {0}")]
    ResolverTask(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("file is too large ({}) to upload, limit is {}", size_text(.size), size_text(.limit))]
    SizeLimit { size: u64, limit: u64 },

    #[error("upload failed: {0}")]
    Upload(String),
}

fn size_text(bytes: &u64) -> String {
    format_size(*bytes as i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Uploaded(SentMessage),
    /// The sink accepted the upload but returned no message.
    Unconfirmed,
    Failed(String),
    TooLarge { size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub filename: String,
    pub status: FileStatus,
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub title: String,
    pub files_found: usize,
    pub outcomes: Vec<FileOutcome>,
}

impl TransferReport {
    pub fn uploaded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FileStatus::Uploaded(_)))
            .count()
    }

    pub fn final_message(&self) -> String {
        format!(
            "🏁 All {} file(s) from '{}' processed.",
            self.files_found,
            escape_html(&self.title)
        )
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub temp_dir: PathBuf,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub max_upload_bytes: u64,
    pub bot_username: Option<String>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config, bot_username: Option<String>) -> Self {
        Self {
            temp_dir: config.temp_dir(),
            poll_interval: Duration::from_millis(config.download.poll_interval_ms),
            progress_interval: Duration::from_millis(config.download.progress_interval_ms),
            max_upload_bytes: config.download.max_upload_bytes,
            bot_username,
        }
    }
}

/// Per-file bookkeeping the cleanup step needs regardless of outcome.
#[derive(Default)]
struct FileSlot {
    job: Option<JobHandle>,
    local_path: Option<PathBuf>,
    completed: bool,
}

struct FileContext<'a> {
    request: &'a TransferRequest,
    content: &'a ResolvedContent,
    index: usize,
    filename: String,
}

pub struct TransferOrchestrator {
    resolver: Arc<dyn LinkResolver>,
    backend: Arc<dyn DownloadBackend>,
    sink: Arc<dyn UploadSink>,
    reporter: Arc<ProgressReporter>,
    settings: OrchestratorSettings,
}

impl TransferOrchestrator {
    pub fn new(
        resolver: Arc<dyn LinkResolver>,
        backend: Arc<dyn DownloadBackend>,
        sink: Arc<dyn UploadSink>,
        reporter: Arc<ProgressReporter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            resolver,
            backend,
            sink,
            reporter,
            settings,
        }
    }

    pub fn reporter(&self) -> &Arc<ProgressReporter> {
        &self.reporter
    }

    /// Runs `request` to completion. The caller registers the request's
    /// status message with the reporter beforehand.
    pub async fn run(&self, request: &TransferRequest) -> Result<TransferReport, TransferError> {
        let content = match self.resolve(request).await {
            Ok(content) => content,
            Err(err) => {
                warn!(request = %request.id, "Resolution failed: {}", err);
                self.reporter
                    .report(&request.id, &format!("❌ Error processing link: {}", err))
                    .await;
                return Err(err);
            }
        };

        let files_found = content.contents.len();
        self.reporter
            .report(
                &request.id,
                &format!(
                    "✅ Link processed!\n<b>Title:</b> {}\n<b>Files Found:</b> {}\nStarting downloads...",
                    escape_html(&content.title),
                    files_found
                ),
            )
            .await;

        let mut outcomes = Vec::with_capacity(files_found);
        for (index, descriptor) in content.contents.iter().enumerate() {
            let ctx = FileContext {
                request,
                content: &content,
                index,
                filename: sanitize_filename(&descriptor.filename, &descriptor.url, index),
            };
            let outcome = self.transfer_file(&ctx, descriptor).await;
            info!(
                request = %request.id,
                file = %outcome.filename,
                status = ?outcome.status,
                "File {}/{} finished",
                index + 1,
                files_found
            );
            outcomes.push(outcome);
        }

        self.remove_request_dir(request).await;

        let report = TransferReport {
            title: content.title.clone(),
            files_found,
            outcomes,
        };
        self.reporter
            .report(&request.id, &report.final_message())
            .await;
        Ok(report)
    }

    async fn resolve(&self, request: &TransferRequest) -> Result<ResolvedContent, TransferError> {
        let resolver = Arc::clone(&self.resolver);
        let url = request.source_url.clone();
        let content = tokio::task::spawn_blocking(move || resolver.resolve(&url))
            .await
            .map_err(|e| TransferError::ResolverTask(e.to_string()))??;
        if content.contents.is_empty() {
            return Err(TransferError::Resolution(ResolveError::EmptyContents));
        }
        Ok(content)
    }

    fn request_dir(&self, request: &TransferRequest) -> PathBuf {
        self.settings.temp_dir.join(&request.id)
    }

    async fn remove_request_dir(&self, request: &TransferRequest) {
        let dir = self.request_dir(request);
        if let Err(e) = tokio::fs::remove_dir(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }

    async fn transfer_file(&self, ctx: &FileContext<'_>, descriptor: &FileDescriptor) -> FileOutcome {
        let mut slot = FileSlot::default();
        let result = self.process_file(ctx, descriptor, &mut slot).await;
        self.cleanup(&slot).await;

        let status = match result {
            Ok(Some(sent)) => FileStatus::Uploaded(sent),
            Ok(None) => {
                warn!(file = %ctx.filename, "Upload returned no message");
                self.reporter
                    .report(
                        &ctx.request.id,
                        &format!(
                            "⚠️ Could not confirm upload of <b>{}</b>. The bot might lack permissions.",
                            escape_html(&ctx.filename)
                        ),
                    )
                    .await;
                FileStatus::Unconfirmed
            }
            Err(FileError::SizeLimit { size, limit }) => {
                self.report_too_large(ctx, size, limit).await;
                FileStatus::TooLarge { size }
            }
            Err(err) => {
                error!(file = %ctx.filename, url = %descriptor.url, "File failed: {}", err);
                let detail: String = err.to_string().chars().take(150).collect();
                self.reporter
                    .report(
                        &ctx.request.id,
                        &format!(
                            "❌ Error with <b>{}</b>: {}",
                            escape_html(&ctx.filename),
                            escape_html(&detail)
                        ),
                    )
                    .await;
                FileStatus::Failed(err.to_string())
            }
        };

        FileOutcome {
            filename: ctx.filename.clone(),
            status,
        }
    }

    async fn process_file(
        &self,
        ctx: &FileContext<'_>,
        descriptor: &FileDescriptor,
        slot: &mut FileSlot,
    ) -> Result<Option<SentMessage>, FileError> {
        let limit = self.settings.max_upload_bytes;
        if let Some(size) = descriptor.size.filter(|size| *size > limit) {
            return Err(FileError::SizeLimit { size, limit });
        }

        let engine = self.backend.kind().to_string();
        let total_files = ctx.content.contents.len();
        self.reporter
            .report(
                &ctx.request.id,
                &format!(
                    "⏳ Preparing download for <b>{}</b> ({}/{}) via {}...",
                    escape_html(&ctx.filename),
                    ctx.index + 1,
                    total_files,
                    engine
                ),
            )
            .await;

        let destination = self.request_dir(ctx.request).join(&ctx.filename);
        let job = self
            .backend
            .start(&descriptor.url, &destination)
            .await
            .map_err(|e| FileError::Download(e.to_string()))?;
        slot.local_path = Some(destination);
        slot.job = Some(job.clone());

        self.await_download(ctx, &job, &engine).await?;
        slot.completed = true;

        let path = self
            .backend
            .result(&job)
            .await
            .map_err(|e| FileError::Download(e.to_string()))?;
        slot.local_path = Some(path.clone());

        let size = verify_file(&path).await?;
        self.reporter
            .report(
                &ctx.request.id,
                &format!(
                    "✅ Downloaded <b>{}</b> ({} via {}).\nNow preparing to upload...",
                    escape_html(&ctx.filename),
                    format_size(size as i64),
                    engine
                ),
            )
            .await;

        if size > limit {
            return Err(FileError::SizeLimit { size, limit });
        }

        self.upload(ctx, &path, size).await
    }

    async fn await_download(
        &self,
        ctx: &FileContext<'_>,
        job: &JobHandle,
        engine: &str,
    ) -> Result<(), FileError> {
        let started = Instant::now();
        let mut last_render: Option<Instant> = None;

        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            let status = self
                .backend
                .poll(job)
                .await
                .map_err(|e| FileError::Download(e.to_string()))?;

            match status.state {
                JobState::Complete => return Ok(()),
                JobState::Failed(reason) => return Err(FileError::Download(reason)),
                JobState::Active => {
                    let due = last_render
                        .map(|at| at.elapsed() >= self.settings.progress_interval)
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    let frame = render_progress(&ProgressView {
                        filename: &ctx.filename,
                        bytes_done: status.bytes_done,
                        bytes_total: status.bytes_total,
                        status: "📥 Downloading",
                        engine,
                        speed: status.speed,
                        eta: status.eta,
                        elapsed: started.elapsed(),
                        user: &ctx.request.user,
                    });
                    self.reporter.report(&ctx.request.id, &frame).await;
                    last_render = Some(Instant::now());
                }
            }
        }
    }

    fn caption(&self, ctx: &FileContext<'_>, size: u64) -> String {
        let mut caption = format!(
            "<b>{}</b>\n\n<b>Size:</b> {}\n\n",
            escape_html(&ctx.filename),
            format_size(size as i64)
        );
        if ctx.content.is_folder && ctx.content.contents.len() > 1 {
            caption.push_str(&format!("<b>Folder:</b> {}\n", escape_html(&ctx.content.title)));
        }
        if let Some(username) = &self.settings.bot_username {
            caption.push_str(&format!("Processed by @{}", username));
        }
        caption
    }

    async fn upload(
        &self,
        ctx: &FileContext<'_>,
        path: &Path,
        size: u64,
    ) -> Result<Option<SentMessage>, FileError> {
        let request = ctx.request;
        self.reporter
            .report(
                &request.id,
                &format!(
                    "┏ ғɪʟᴇɴᴀᴍᴇ: {}\n┠ sᴛᴀᴛᴜs: 📤 Uploading to Telegram...\n┠ sɪᴢᴇ: {}\n┖ ᴜsᴇʀ: {}\n",
                    escape_html(&ctx.filename),
                    format_size(size as i64),
                    request.user.html_link()
                ),
            )
            .await;

        let kind = media_kind_for(&ctx.filename);
        let sent = self
            .sink
            .send_media(
                kind,
                request.delivery_chat_id,
                path,
                &self.caption(ctx, size),
                &ctx.filename,
            )
            .await
            .map_err(|e| FileError::Upload(e.to_string()))?;

        if sent.is_some() {
            let done = format!(
                "✅ Successfully uploaded <b>{}</b>!",
                escape_html(&ctx.filename)
            );
            if request.delivers_to_dump() {
                if let Err(e) = self
                    .sink
                    .send_text(request.user_chat_id, &done, request.source_message_id)
                    .await
                {
                    warn!("Failed to confirm upload to user: {}", e);
                }
            }
            self.reporter.report(&request.id, &done).await;
        }
        Ok(sent)
    }

    async fn report_too_large(&self, ctx: &FileContext<'_>, size: u64, limit: u64) {
        let request = ctx.request;
        warn!(file = %ctx.filename, size, limit, "File exceeds upload limit");
        self.reporter
            .report(
                &request.id,
                &format!(
                    "❌ File <b>{}</b> is too large ({}) to upload. Max is {} for bot uploads.",
                    escape_html(&ctx.filename),
                    format_size(size as i64),
                    format_size(limit as i64)
                ),
            )
            .await;

        if request.delivers_to_dump() {
            let notice = format!(
                "Failed to upload: {} (too large: {}) from user {}. Link: {}",
                escape_html(&ctx.filename),
                format_size(size as i64),
                request.user.id,
                escape_html(&request.source_url)
            );
            if let Err(e) = self
                .sink
                .send_text(request.delivery_chat_id, &notice, None)
                .await
            {
                warn!("Failed to notify dump channel: {}", e);
            }
        }
    }

    async fn cleanup(&self, slot: &FileSlot) {
        if let Some(path) = &slot.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("Removed temp file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }
        let Some(job) = &slot.job else {
            return;
        };
        if slot.completed {
            if let Err(e) = self.backend.release(job).await {
                warn!(job = %job.id, "Failed to release download: {}", e);
            }
        } else if let Err(e) = self.backend.cancel(job).await {
            warn!(job = %job.id, "Failed to cancel download: {}", e);
        }
    }
}

async fn verify_file(path: &Path) -> Result<u64, FileError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FileError::Verification(format!("{}: {}", path.display(), e)))?;
    if meta.len() == 0 {
        return Err(FileError::Verification(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(meta.len())
}
