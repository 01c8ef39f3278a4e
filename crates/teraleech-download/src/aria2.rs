//! aria2 JSON-RPC backend
//!
//! Talks JSON-RPC 2.0 over HTTP POST to a running aria2c daemon started with
//! `--enable-rpc`. The secret travels as the `token:<secret>` first parameter.

use crate::{remove_partial, BackendKind, DownloadBackend, DownloadError, JobHandle, JobState, JobStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teraleech_config::Aria2Config;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STATUS_KEYS: [&str; 8] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorMessage",
    "dir",
    "files",
];

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Subset of `aria2.tellStatus`; aria2 encodes every number as a string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aria2Status {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total_length: String,
    #[serde(default)]
    pub completed_length: String,
    #[serde(default)]
    pub download_speed: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub files: Vec<Aria2File>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Aria2File {
    #[serde(default)]
    pub path: String,
}

fn parse_len(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

impl Aria2Status {
    pub fn total(&self) -> u64 {
        parse_len(&self.total_length)
    }

    pub fn completed(&self) -> u64 {
        parse_len(&self.completed_length)
    }

    pub fn speed(&self) -> u64 {
        parse_len(&self.download_speed)
    }

    /// First file path, resolved against the download dir when relative.
    /// Always absolute.
    pub fn file_path(&self) -> Option<PathBuf> {
        let raw = self.files.first().map(|f| f.path.trim())?;
        if raw.is_empty() {
            return None;
        }
        let path = match self.dir.as_deref() {
            Some(dir) if !dir.is_empty() => Path::new(dir).join(raw),
            _ => PathBuf::from(raw),
        };
        absolutize(&path)
    }
}

fn absolutize(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        return Some(path.to_path_buf());
    }
    std::env::current_dir().ok().map(|cwd| cwd.join(path))
}

/// What `poll` should do with a `tellStatus` snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusVerdict {
    Report(JobStatus),
    Fail(String),
}

pub fn judge_status(status: &Aria2Status, waited: Duration, metadata_timeout: Duration) -> StatusVerdict {
    match status.status.as_str() {
        "complete" => StatusVerdict::Report(JobStatus {
            bytes_done: status.completed(),
            bytes_total: status.total(),
            speed: 0,
            eta: Some(Duration::ZERO),
            state: JobState::Complete,
        }),
        "error" | "removed" => StatusVerdict::Fail(
            status
                .error_message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("aria2 status {}", status.status)),
        ),
        _ if status.total() == 0 && waited >= metadata_timeout => {
            StatusVerdict::Fail("metadata timeout".to_string())
        }
        _ => StatusVerdict::Report(JobStatus::active(
            status.completed(),
            status.total(),
            status.speed(),
        )),
    }
}

pub struct Aria2Client {
    client: reqwest::Client,
    url: String,
    secret: String,
    next_id: AtomicU64,
}

impl Aria2Client {
    pub fn new(url: &str, secret: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            secret: secret.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    fn params(&self, params: Vec<Value>) -> Vec<Value> {
        if self.secret.is_empty() {
            return params;
        }
        let mut with_token = Vec::with_capacity(params.len() + 1);
        with_token.push(json!(format!("token:{}", self.secret)));
        with_token.extend(params);
        with_token
    }

    pub fn request_body(&self, method: &str, params: Vec<Value>) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": self.params(params),
        })
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, DownloadError> {
        let rpc_err = |message: String| DownloadError::Rpc {
            method: method.to_string(),
            message,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&self.request_body(method, params))
            .send()
            .await
            .map_err(|e| rpc_err(e.to_string()))?;
        let body: RpcResponse = response.json().await.map_err(|e| rpc_err(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(rpc_err(format!("{} (code {})", err.message, err.code)));
        }
        body.result
            .ok_or_else(|| rpc_err("response without result".to_string()))
    }

    pub async fn get_version(&self) -> Result<String, DownloadError> {
        let result = self.call("aria2.getVersion", vec![]).await?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    pub async fn apply_global_options(&self, config: &Aria2Config) -> Result<(), DownloadError> {
        let options = json!({
            "max-concurrent-downloads": config.max_concurrent_downloads.to_string(),
            "max-tries": config.max_tries.to_string(),
            "retry-wait": config.retry_wait.to_string(),
            "split": config.split.to_string(),
            "min-split-size": config.min_split_size,
            "max-connection-per-server": config.max_connection_per_server.to_string(),
            "continue": "true",
        });
        self.call("aria2.changeGlobalOption", vec![options]).await?;
        Ok(())
    }

    pub async fn add_uri(&self, url: &str, options: Value) -> Result<String, DownloadError> {
        let result = self
            .call("aria2.addUri", vec![json!([url]), options])
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DownloadError::Rpc {
                method: "aria2.addUri".to_string(),
                message: format!("unexpected gid: {}", result),
            })
    }

    pub async fn tell_status(&self, gid: &str) -> Result<Aria2Status, DownloadError> {
        let result = self
            .call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await?;
        serde_json::from_value(result).map_err(|e| DownloadError::Rpc {
            method: "aria2.tellStatus".to_string(),
            message: e.to_string(),
        })
    }

    pub async fn force_remove(&self, gid: &str) -> Result<(), DownloadError> {
        self.call("aria2.forceRemove", vec![json!(gid)]).await?;
        Ok(())
    }

    pub async fn remove_download_result(&self, gid: &str) -> Result<(), DownloadError> {
        self.call("aria2.removeDownloadResult", vec![json!(gid)])
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Aria2Job {
    started: Instant,
    completed_path: Option<PathBuf>,
}

pub struct Aria2Backend {
    client: Arc<Aria2Client>,
    max_tries: u32,
    retry_wait: u32,
    split: u32,
    min_split_size: String,
    max_connection_per_server: u32,
    metadata_timeout: Duration,
    jobs: Mutex<HashMap<String, Aria2Job>>,
}

impl Aria2Backend {
    pub fn new(client: Arc<Aria2Client>, config: &Aria2Config) -> Self {
        Self {
            client,
            max_tries: config.max_tries,
            retry_wait: config.retry_wait,
            split: config.split,
            min_split_size: config.min_split_size.clone(),
            max_connection_per_server: config.max_connection_per_server,
            metadata_timeout: config.metadata_timeout(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_uri_options(&self, dir: &Path, out: &str) -> Value {
        json!({
            "dir": dir.to_string_lossy(),
            "out": out,
            "max-tries": self.max_tries.to_string(),
            "retry-wait": self.retry_wait.to_string(),
            "continue": "true",
            "allow-overwrite": "true",
            "min-split-size": self.min_split_size,
            "split": self.split.to_string(),
            "max-connection-per-server": self.max_connection_per_server.to_string(),
        })
    }

    /// Drops the daemon-side record and whatever the job left on disk.
    async fn discard(&self, job: &JobHandle, reported_path: Option<PathBuf>) {
        if let Err(e) = self.client.force_remove(&job.id).await {
            debug!("aria2 forceRemove {}: {}", job.id, e);
        }
        if let Err(e) = self.client.remove_download_result(&job.id).await {
            debug!("aria2 removeDownloadResult {}: {}", job.id, e);
        }
        if let Some(path) = reported_path.filter(|p| p != &job.destination) {
            remove_partial(&path).await;
        }
        remove_partial(&job.destination).await;
        self.jobs.lock().await.remove(&job.id);
    }
}

#[async_trait::async_trait]
impl DownloadBackend for Aria2Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::Aria2
    }

    async fn start(&self, url: &str, destination: &Path) -> Result<JobHandle, DownloadError> {
        let parent = destination.parent().unwrap_or_else(|| Path::new("."));
        let dir = absolutize(parent).unwrap_or_else(|| parent.to_path_buf());
        let out = destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tokio::fs::create_dir_all(&dir).await?;

        let gid = self
            .client
            .add_uri(url, self.add_uri_options(&dir, &out))
            .await?;
        info!(gid = %gid, "aria2 job added for {}", out);

        self.jobs.lock().await.insert(
            gid.clone(),
            Aria2Job {
                started: Instant::now(),
                completed_path: None,
            },
        );

        Ok(JobHandle {
            id: gid,
            kind: BackendKind::Aria2,
            destination: destination.to_path_buf(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, DownloadError> {
        let started = self
            .jobs
            .lock()
            .await
            .get(&job.id)
            .map(|j| j.started)
            .ok_or_else(|| DownloadError::UnknownJob(job.id.clone()))?;

        let status = self.client.tell_status(&job.id).await?;
        match judge_status(&status, started.elapsed(), self.metadata_timeout) {
            StatusVerdict::Report(report) => {
                if report.state == JobState::Complete {
                    if let Some(entry) = self.jobs.lock().await.get_mut(&job.id) {
                        entry.completed_path = status.file_path();
                    }
                }
                Ok(report)
            }
            StatusVerdict::Fail(reason) => {
                warn!(gid = %job.id, "aria2 job failed: {}", reason);
                self.discard(job, status.file_path()).await;
                Ok(JobStatus {
                    bytes_done: 0,
                    bytes_total: status.total(),
                    speed: 0,
                    eta: None,
                    state: JobState::Failed(reason),
                })
            }
        }
    }

    async fn result(&self, job: &JobHandle) -> Result<PathBuf, DownloadError> {
        let cached = self
            .jobs
            .lock()
            .await
            .get(&job.id)
            .and_then(|j| j.completed_path.clone());
        if let Some(path) = cached {
            return Ok(path);
        }

        let status = self.client.tell_status(&job.id).await?;
        if status.status != "complete" {
            return Err(DownloadError::NotComplete(job.id.clone()));
        }
        Ok(status
            .file_path()
            .unwrap_or_else(|| job.destination.clone()))
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), DownloadError> {
        let reported = match self.client.tell_status(&job.id).await {
            Ok(status) => status.file_path(),
            Err(_) => None,
        };
        self.discard(job, reported).await;
        Ok(())
    }

    async fn release(&self, job: &JobHandle) -> Result<(), DownloadError> {
        self.jobs.lock().await.remove(&job.id);
        if let Err(e) = self.client.remove_download_result(&job.id).await {
            debug!("aria2 removeDownloadResult {}: {}", job.id, e);
        }
        Ok(())
    }
}
