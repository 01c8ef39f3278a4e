//! Rate-limited status message updates
//!
//! One status message per transfer request. Reports with unchanged text are
//! dropped, sends are spaced by a minimum interval, and flood waits are
//! retried within a bounded budget. Requests whose edits keep getting
//! abandoned trip a breaker and go quiet for a cooldown period.

use crate::sanitize::escape_html;
use crate::{StatusTransport, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use teraleech_config::ProgressConfig;
use teraleech_download::format_size;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusHandle {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub min_interval: Duration,
    pub max_retry_wait: Duration,
    pub max_total_wait: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl From<&ProgressConfig> for ReporterSettings {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            max_retry_wait: Duration::from_secs(config.max_retry_wait_secs),
            max_total_wait: Duration::from_secs(config.max_total_wait_secs),
            breaker_threshold: config.breaker_threshold.max(1),
            breaker_cooldown: Duration::from_secs(config.breaker_cooldown_secs),
        }
    }
}

#[derive(Debug)]
struct Entry {
    handle: StatusHandle,
    last_text: Option<String>,
    last_sent: Option<Instant>,
    abandoned_streak: u32,
    breaker_open_until: Option<Instant>,
}

impl Entry {
    fn new(handle: StatusHandle) -> Self {
        Self {
            handle,
            last_text: None,
            last_sent: None,
            abandoned_streak: 0,
            breaker_open_until: None,
        }
    }
}

enum Attempt {
    Sent,
    Abandoned,
    Failed,
}

pub struct ProgressReporter {
    transport: Arc<dyn StatusTransport>,
    settings: ReporterSettings,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProgressReporter {
    pub fn new(transport: Arc<dyn StatusTransport>, settings: ReporterSettings) -> Self {
        Self {
            transport,
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, request_id: &str, handle: StatusHandle) {
        self.entries
            .lock()
            .await
            .insert(request_id.to_string(), Entry::new(handle));
    }

    /// Seeds the text the status message was created with.
    pub async fn register_with_text(&self, request_id: &str, handle: StatusHandle, text: &str) {
        let mut entry = Entry::new(handle);
        entry.last_text = Some(text.to_string());
        entry.last_sent = Some(Instant::now());
        self.entries
            .lock()
            .await
            .insert(request_id.to_string(), entry);
    }

    pub async fn release(&self, request_id: &str) {
        self.entries.lock().await.remove(request_id);
    }

    /// Pushes `text` to the request's status message. Never fails.
    pub async fn report(&self, request_id: &str, text: &str) {
        let (handle, wait) = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(request_id) else {
                debug!(request_id, "report for unregistered request ignored");
                return;
            };

            let now = Instant::now();
            match entry.breaker_open_until {
                Some(until) if now < until => {
                    debug!(request_id, "status breaker open, report dropped");
                    return;
                }
                Some(_) => {
                    entry.breaker_open_until = None;
                    entry.abandoned_streak = 0;
                }
                None => {}
            }

            if entry.last_text.as_deref() == Some(text) {
                return;
            }

            let wait = entry
                .last_sent
                .map(|sent| self.settings.min_interval.saturating_sub(now.duration_since(sent)))
                .unwrap_or(Duration::ZERO);
            (entry.handle, wait)
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let attempt = self.send_bounded(request_id, handle, text).await;

        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(request_id) else {
            return;
        };
        let now = Instant::now();
        match attempt {
            Attempt::Sent => {
                entry.last_text = Some(text.to_string());
                entry.last_sent = Some(now);
                entry.abandoned_streak = 0;
            }
            Attempt::Failed => {
                entry.last_sent = Some(now);
            }
            Attempt::Abandoned => {
                entry.abandoned_streak += 1;
                if entry.abandoned_streak >= self.settings.breaker_threshold {
                    warn!(
                        request_id,
                        streak = entry.abandoned_streak,
                        "status updates keep hitting flood limits, pausing for {}s",
                        self.settings.breaker_cooldown.as_secs()
                    );
                    entry.breaker_open_until = Some(now + self.settings.breaker_cooldown);
                }
            }
        }
    }

    async fn send_bounded(&self, request_id: &str, handle: StatusHandle, text: &str) -> Attempt {
        let deadline = Instant::now() + self.settings.max_total_wait;
        loop {
            match self
                .transport
                .edit_status(handle.chat_id, handle.message_id, text)
                .await
            {
                Ok(()) => return Attempt::Sent,
                Err(TransportError::RateLimited { retry_after }) => {
                    let wait = retry_after.min(self.settings.max_retry_wait);
                    if Instant::now() + wait > deadline {
                        warn!(
                            request_id,
                            "status edit abandoned after exhausting {}s wait budget",
                            self.settings.max_total_wait.as_secs()
                        );
                        return Attempt::Abandoned;
                    }
                    warn!(
                        request_id,
                        "status edit rate limited, retrying in {}ms",
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(TransportError::Other(e)) => {
                    warn!(request_id, "status edit failed: {}", e);
                    return Attempt::Failed;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: i64,
    pub first_name: String,
}

impl Requester {
    pub fn html_link(&self) -> String {
        format!(
            "<a href='tg://user?id={}'>{}</a> | ɪᴅ: {}",
            self.id,
            escape_html(&self.first_name),
            self.id
        )
    }
}

/// Everything shown in one progress frame.
#[derive(Debug, Clone)]
pub struct ProgressView<'a> {
    pub filename: &'a str,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub status: &'a str,
    pub engine: &'a str,
    pub speed: u64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub user: &'a Requester,
}

impl ProgressView<'_> {
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

pub fn progress_bar(percent: f64) -> String {
    let filled = ((percent / 10.0).floor() as usize).min(10);
    format!("{}{}", "★".repeat(filled), "☆".repeat(10 - filled))
}

fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) => {
            let secs = d.as_secs();
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else {
                format!("{}m {}s", secs / 60, secs % 60)
            }
        }
        None => "-".to_string(),
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

pub fn render_progress(view: &ProgressView<'_>) -> String {
    let percent = view.percent();
    format!(
        "┏ ғɪʟᴇɴᴀᴍᴇ: {}\n\
         ┠ [{}] {:.2}%\n\
         ┠ ᴘʀᴏᴄᴇssᴇᴅ: {} ᴏғ {}\n\
         ┠ sᴛᴀᴛᴜs: {}\n\
         ┠ ᴇɴɢɪɴᴇ: <b><u>{}</u></b>\n\
         ┠ sᴘᴇᴇᴅ: {}/s\n\
         ┠ ᴇᴛᴀ: {} | ᴇʟᴀᴘsᴇᴅ: {}\n\
         ┖ ᴜsᴇʀ: {}\n",
        escape_html(view.filename),
        progress_bar(percent),
        percent,
        format_size(view.bytes_done as i64),
        format_size(view.bytes_total as i64),
        view.status,
        view.engine,
        format_size(view.speed as i64),
        format_eta(view.eta),
        format_elapsed(view.elapsed),
        view.user.html_link(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTransport {
        sends: std::sync::Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait::async_trait]
    impl StatusTransport for RecordingTransport {
        async fn edit_status(&self, _: i64, _: i64, text: &str) -> Result<(), TransportError> {
            self.sends
                .lock()
                .expect("lock")
                .push((text.to_string(), Instant::now()));
            Ok(())
        }
    }

    struct FloodedTransport {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StatusTransport for FloodedTransport {
        async fn edit_status(&self, _: i64, _: i64, _: &str) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::RateLimited {
                retry_after: Duration::from_secs(30),
            })
        }
    }

    /// Answers edits from `script` in order, then succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        script: std::sync::Mutex<std::collections::VecDeque<TransportError>>,
        sends: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn failing_with(errors: Vec<TransportError>) -> Self {
            Self {
                script: std::sync::Mutex::new(errors.into()),
                ..Self::default()
            }
        }

        fn sends(&self) -> usize {
            self.sends.lock().expect("lock").len()
        }
    }

    #[async_trait::async_trait]
    impl StatusTransport for ScriptedTransport {
        async fn edit_status(&self, _: i64, _: i64, text: &str) -> Result<(), TransportError> {
            self.sends.lock().expect("lock").push(text.to_string());
            match self.script.lock().expect("lock").pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn settings(min_interval: Duration) -> ReporterSettings {
        ReporterSettings {
            min_interval,
            max_retry_wait: Duration::from_millis(20),
            max_total_wait: Duration::from_millis(50),
            breaker_threshold: 2,
            breaker_cooldown: Duration::from_secs(3600),
        }
    }

    const HANDLE: StatusHandle = StatusHandle {
        chat_id: 1,
        message_id: 2,
    };

    #[tokio::test]
    async fn identical_text_is_sent_once() {
        let transport = Arc::new(RecordingTransport::default());
        let reporter = ProgressReporter::new(transport.clone(), settings(Duration::ZERO));
        reporter.register("req", HANDLE).await;

        reporter.report("req", "📥 Downloading").await;
        reporter.report("req", "📥 Downloading").await;

        assert_eq!(transport.sends.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn second_send_waits_for_min_interval() {
        let interval = Duration::from_millis(250);
        let transport = Arc::new(RecordingTransport::default());
        let reporter = ProgressReporter::new(transport.clone(), settings(interval));
        reporter.register("req", HANDLE).await;

        reporter.report("req", "first").await;
        reporter.report("req", "second").await;

        let sends = transport.sends.lock().expect("lock");
        assert_eq!(sends.len(), 2);
        assert!(sends[1].1.duration_since(sends[0].1) >= interval);
    }

    #[tokio::test]
    async fn flood_waits_are_bounded_and_trip_breaker() {
        let transport = Arc::new(FloodedTransport {
            calls: AtomicUsize::new(0),
        });
        let reporter = ProgressReporter::new(transport.clone(), settings(Duration::ZERO));
        reporter.register("req", HANDLE).await;

        let started = Instant::now();
        reporter.report("req", "a").await;
        reporter.report("req", "b").await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let calls_before = transport.calls.load(Ordering::SeqCst);
        assert!(calls_before >= 2);
        reporter.report("req", "c").await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn rate_limited_edit_is_retried_then_deduplicated() {
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            TransportError::RateLimited {
                retry_after: Duration::from_millis(10),
            },
        ]));
        let reporter = ProgressReporter::new(transport.clone(), settings(Duration::ZERO));
        reporter.register("req", HANDLE).await;

        reporter.report("req", "📥 Downloading").await;
        assert_eq!(transport.sends(), 2);

        reporter.report("req", "📥 Downloading").await;
        assert_eq!(transport.sends(), 2);

        reporter.report("req", "✅ Downloaded").await;
        assert_eq!(transport.sends(), 3);
    }

    #[tokio::test]
    async fn failed_edit_is_retried_on_next_report() {
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            TransportError::Other("Bad Request: message to edit not found".to_string()),
            TransportError::Other("Bad Request: message to edit not found".to_string()),
        ]));
        let reporter = ProgressReporter::new(transport.clone(), settings(Duration::ZERO));
        reporter.register("req", HANDLE).await;

        reporter.report("req", "📤 Uploading").await;
        assert_eq!(transport.sends(), 1);

        reporter.report("req", "📤 Uploading").await;
        assert_eq!(transport.sends(), 2);

        reporter.report("req", "📤 Uploading").await;
        assert_eq!(transport.sends(), 3);

        reporter.report("req", "📤 Uploading").await;
        assert_eq!(transport.sends(), 3);
    }

    #[tokio::test]
    async fn released_request_is_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let reporter = ProgressReporter::new(transport.clone(), settings(Duration::ZERO));
        reporter.register("req", HANDLE).await;
        reporter.release("req").await;
        reporter.report("req", "late").await;
        assert!(transport.sends.lock().expect("lock").is_empty());
    }

    #[test]
    fn progress_frame_shows_bar_and_user() {
        let user = Requester {
            id: 42,
            first_name: "<Ana>".to_string(),
        };
        let view = ProgressView {
            filename: "x.mp4",
            bytes_done: 512 * 1024,
            bytes_total: 1024 * 1024,
            status: "📥 Downloading",
            engine: "Aria2",
            speed: 2048,
            eta: Some(Duration::from_secs(75)),
            elapsed: Duration::from_millis(125_900),
            user: &user,
        };
        let text = render_progress(&view);
        assert!(text.contains("[★★★★★☆☆☆☆☆] 50.00%"));
        assert!(text.contains("512.00 KB ᴏғ 1.00 MB"));
        assert!(text.contains("sᴘᴇᴇᴅ: 2.00 KB/s"));
        assert!(text.contains("ᴇᴛᴀ: 1m 15s | ᴇʟᴀᴘsᴇᴅ: 2m 5s"));
        assert!(text.contains("<a href='tg://user?id=42'>&lt;Ana&gt;</a> | ɪᴅ: 42"));
    }

    #[test]
    fn unknown_total_renders_empty_bar() {
        assert_eq!(progress_bar(0.0), "☆☆☆☆☆☆☆☆☆☆");
        assert_eq!(progress_bar(100.0), "★★★★★★★★★★");
        assert_eq!(progress_bar(99.9), "★★★★★★★★★☆");
        assert_eq!(format_eta(None), "-");
    }
}
