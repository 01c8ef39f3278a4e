//! Teraleech Download Backends
//!
//! Two interchangeable ways of fetching a direct URL to local disk: an aria2
//! daemon driven over JSON-RPC, or an in-process streaming HTTP client

pub mod aria2;
pub mod streaming;

use aria2::{Aria2Backend, Aria2Client};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use streaming::StreamingBackend;
use teraleech_config::{Aria2Config, DownloadConfig};
use tracing::{info, warn};

const KB: f64 = 1024.0;
const MB: f64 = KB * 1024.0;
const GB: f64 = MB * 1024.0;
const TB: f64 = GB * 1024.0;

/// Human readable size: largest 1024-based unit not above the value,
/// two decimals except for plain bytes.
pub fn format_size(bytes: i64) -> String {
    format_size_f64(bytes as f64)
}

pub fn format_size_f64(bytes: f64) -> String {
    if !bytes.is_finite() || bytes < 0.0 {
        return "N/A".to_string();
    }
    if bytes >= TB {
        format!("{:.2} TB", bytes / TB)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes / KB)
    } else {
        format!("{} B", bytes.floor() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Aria2,
    Streaming,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Aria2 => write!(f, "Aria2"),
            BackendKind::Streaming => write!(f, "HTTP stream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub kind: BackendKind,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Active,
    Complete,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second.
    pub speed: u64,
    pub eta: Option<Duration>,
    pub state: JobState,
}

impl JobStatus {
    pub fn active(bytes_done: u64, bytes_total: u64, speed: u64) -> Self {
        Self {
            bytes_done,
            bytes_total,
            speed,
            eta: estimate_eta(bytes_done, bytes_total, speed),
            state: JobState::Active,
        }
    }

    pub fn fraction_done(&self) -> f64 {
        if self.bytes_total > 0 {
            self.bytes_done as f64 / self.bytes_total as f64
        } else {
            0.0
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, JobState::Active)
    }
}

pub fn estimate_eta(bytes_done: u64, bytes_total: u64, speed: u64) -> Option<Duration> {
    if speed == 0 || bytes_total == 0 || bytes_done > bytes_total {
        return None;
    }
    Some(Duration::from_secs((bytes_total - bytes_done) / speed))
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("aria2 {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("http transfer failed: {0}")]
    Http(String),

    #[error("download io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown download job {0}")]
    UnknownJob(String),

    #[error("download job {0} has not completed")]
    NotComplete(String),
}

/// A way of turning a direct URL into a local file.
///
/// `start` takes the full destination path; backends may still report a
/// different final path through `result`.
#[async_trait::async_trait]
pub trait DownloadBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn start(&self, url: &str, destination: &Path) -> Result<JobHandle, DownloadError>;

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, DownloadError>;

    /// Local path of a completed job.
    async fn result(&self, job: &JobHandle) -> Result<PathBuf, DownloadError>;

    /// Stops the job and removes whatever it left on disk.
    async fn cancel(&self, job: &JobHandle) -> Result<(), DownloadError>;

    /// Forgets a completed job. The local file belongs to the caller.
    async fn release(&self, job: &JobHandle) -> Result<(), DownloadError>;
}

/// Removes a partial download and any `.aria2` control file next to it.
pub async fn remove_partial(path: &Path) {
    let mut control = path.as_os_str().to_owned();
    control.push(".aria2");
    for candidate in [path.to_path_buf(), PathBuf::from(control)] {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => info!("Removed partial file {}", candidate.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", candidate.display(), e),
        }
    }
}

/// Picks aria2 when it is enabled and reachable, streaming otherwise.
pub async fn select_backend(
    aria2: &Aria2Config,
    download: &DownloadConfig,
) -> anyhow::Result<Arc<dyn DownloadBackend>> {
    if aria2.enabled {
        let client = Arc::new(Aria2Client::new(&aria2.rpc_url(), &aria2.secret)?);
        match client.get_version().await {
            Ok(version) => {
                if let Err(e) = client.apply_global_options(aria2).await {
                    warn!("Failed to apply aria2 global options: {}", e);
                }
                info!(
                    "Download backend: aria2 {} at {}",
                    version,
                    aria2.rpc_url()
                );
                return Ok(Arc::new(Aria2Backend::new(client, aria2)));
            }
            Err(e) => warn!(
                "Download backend: streaming HTTP (aria2 unreachable at {}: {})",
                aria2.rpc_url(),
                e
            ),
        }
    } else {
        info!("Download backend: streaming HTTP (aria2 disabled in config)");
    }

    Ok(Arc::new(StreamingBackend::new(download)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_picks_largest_unit() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_size(2 * 1024 * 1024 * 1024 * 1024), "2.00 TB");
    }

    #[test]
    fn format_size_rejects_invalid_input() {
        assert_eq!(format_size(-1), "N/A");
        assert_eq!(format_size_f64(f64::NAN), "N/A");
        assert_eq!(format_size_f64(f64::INFINITY), "N/A");
    }

    #[test]
    fn fraction_done_is_zero_without_total() {
        let status = JobStatus::active(500, 0, 10);
        assert_eq!(status.fraction_done(), 0.0);
        assert_eq!(status.eta, None);

        let status = JobStatus::active(250, 1000, 50);
        assert!((status.fraction_done() - 0.25).abs() < f64::EPSILON);
        assert_eq!(status.eta, Some(Duration::from_secs(15)));
        assert!(!status.is_terminal());
    }

    #[tokio::test]
    async fn remove_partial_deletes_control_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("movie.mp4");
        let control = dir.path().join("movie.mp4.aria2");
        tokio::fs::write(&file, b"partial").await.expect("write");
        tokio::fs::write(&control, b"ctl").await.expect("write");

        remove_partial(&file).await;

        assert!(!file.exists());
        assert!(!control.exists());
        remove_partial(&file).await;
    }

    #[tokio::test]
    async fn disabled_aria2_selects_streaming() {
        let aria2 = Aria2Config {
            enabled: false,
            ..Aria2Config::default()
        };
        let backend = select_backend(&aria2, &DownloadConfig::default())
            .await
            .expect("backend");
        assert_eq!(backend.kind(), BackendKind::Streaming);
    }
}
