//! Streaming HTTP backend
//!
//! Fetches a URL with `reqwest` in a spawned task, writing the body through a
//! buffered writer while progress counters are shared with `poll`.

use crate::{remove_partial, BackendKind, DownloadBackend, DownloadError, JobHandle, JobState, JobStatus};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teraleech_config::DownloadConfig;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct StreamJob {
    destination: PathBuf,
    started: Instant,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    state: RwLock<JobState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamJob {
    fn new(destination: PathBuf) -> Self {
        Self {
            destination,
            started: Instant::now(),
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            state: RwLock::new(JobState::Active),
            task: Mutex::new(None),
        }
    }

    async fn snapshot(&self) -> JobStatus {
        let done = self.bytes_done.load(Ordering::Relaxed);
        let total = self.bytes_total.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (done as f64 / elapsed) as u64
        } else {
            0
        };

        let state = self.state.read().await.clone();
        match state {
            JobState::Active => JobStatus::active(done, total, speed),
            other => JobStatus {
                bytes_done: done,
                bytes_total: total,
                speed,
                eta: None,
                state: other,
            },
        }
    }
}

pub struct StreamingBackend {
    client: reqwest::Client,
    chunk_size: usize,
    read_timeout: Duration,
    jobs: Mutex<HashMap<String, Arc<StreamJob>>>,
}

impl StreamingBackend {
    pub fn new(config: &DownloadConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            chunk_size: config.chunk_size.max(4096),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    async fn job(&self, id: &str) -> Result<Arc<StreamJob>, DownloadError> {
        self.jobs
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DownloadError::UnknownJob(id.to_string()))
    }
}

async fn transfer(
    client: reqwest::Client,
    url: String,
    job: Arc<StreamJob>,
    chunk_size: usize,
    read_timeout: Duration,
) -> Result<(), DownloadError> {
    let response = tokio::time::timeout(read_timeout, client.get(&url).send())
        .await
        .map_err(|_| DownloadError::Http("timed out waiting for response".to_string()))?
        .map_err(|e| DownloadError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Http(format!("HTTP status {}", status)));
    }
    job.bytes_total
        .store(response.content_length().unwrap_or(0), Ordering::Relaxed);

    if let Some(parent) = job.destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(&job.destination).await?;
    let mut writer = BufWriter::with_capacity(chunk_size, file);
    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::time::timeout(read_timeout, stream.next())
            .await
            .map_err(|_| {
                DownloadError::Http(format!("read timed out after {}s", read_timeout.as_secs()))
            })?;
        match next {
            Some(chunk) => {
                let chunk = chunk.map_err(|e| DownloadError::Http(e.to_string()))?;
                writer.write_all(&chunk).await?;
                job.bytes_done
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            None => break,
        }
    }

    writer.flush().await?;
    Ok(())
}

#[async_trait::async_trait]
impl DownloadBackend for StreamingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    async fn start(&self, url: &str, destination: &Path) -> Result<JobHandle, DownloadError> {
        let id = uuid::Uuid::new_v4().to_string();
        let job = Arc::new(StreamJob::new(destination.to_path_buf()));

        let task_job = job.clone();
        let client = self.client.clone();
        let url = url.to_string();
        let chunk_size = self.chunk_size;
        let read_timeout = self.read_timeout;
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let outcome = transfer(client, url, task_job.clone(), chunk_size, read_timeout).await;
            let state = match outcome {
                Ok(()) => {
                    info!(
                        job = %task_id,
                        bytes = task_job.bytes_done.load(Ordering::Relaxed),
                        "Streaming download complete"
                    );
                    JobState::Complete
                }
                Err(e) => {
                    warn!(job = %task_id, "Streaming download failed: {}", e);
                    JobState::Failed(e.to_string())
                }
            };
            *task_job.state.write().await = state;
        });

        *job.task.lock().await = Some(handle);
        self.jobs.lock().await.insert(id.clone(), job);

        Ok(JobHandle {
            id,
            kind: BackendKind::Streaming,
            destination: destination.to_path_buf(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, DownloadError> {
        Ok(self.job(&job.id).await?.snapshot().await)
    }

    async fn result(&self, job: &JobHandle) -> Result<PathBuf, DownloadError> {
        let entry = self.job(&job.id).await?;
        let state = entry.state.read().await.clone();
        match state {
            JobState::Complete => Ok(entry.destination.clone()),
            _ => Err(DownloadError::NotComplete(job.id.clone())),
        }
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), DownloadError> {
        let entry = self.jobs.lock().await.remove(&job.id);
        if let Some(entry) = entry {
            if let Some(task) = entry.task.lock().await.take() {
                task.abort();
                let _ = task.await;
            }
        }
        remove_partial(&job.destination).await;
        Ok(())
    }

    async fn release(&self, job: &JobHandle) -> Result<(), DownloadError> {
        let entry = self.jobs.lock().await.remove(&job.id);
        if let Some(entry) = entry {
            if let Some(task) = entry.task.lock().await.take() {
                task.abort();
                let _ = task.await;
            }
        }
        Ok(())
    }
}
