use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LOG_FILE_NAME: &str = "log.txt";

/// Directory holding everything that belongs to one job: its log and the
/// checked-out repository.
pub fn job_dir(work_dir: &Path, job_id: i64) -> PathBuf {
    work_dir.join("jobs").join(job_id.to_string())
}

pub fn job_log_path(work_dir: &Path, job_id: i64) -> PathBuf {
    job_dir(work_dir, job_id).join(LOG_FILE_NAME)
}

/// Read the full accumulated log of a job. Returns an empty string if the job
/// has not written anything yet.
pub async fn read_job_log(work_dir: &Path, job_id: i64) -> Result<String> {
    let path = job_log_path(work_dir, job_id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Append-only text consumer for a job's human-readable log.
///
/// Write failures are reported through `tracing` and never interrupt the
/// pipeline.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, level: LogLevel, message: &str, meta: Option<&serde_json::Value>);

    async fn info(&self, message: &str) {
        self.write(LogLevel::Info, message, None).await
    }

    async fn info_with(&self, message: &str, meta: serde_json::Value) {
        self.write(LogLevel::Info, message, Some(&meta)).await
    }

    async fn warn(&self, message: &str) {
        self.write(LogLevel::Warn, message, None).await
    }

    async fn error(&self, message: &str) {
        self.write(LogLevel::Error, message, None).await
    }
}

/// Format one log record. Multi-line messages keep their inner newlines; the
/// record always ends with exactly one.
pub fn format_record(
    timestamp: &str,
    level: LogLevel,
    message: &str,
    meta: Option<&serde_json::Value>,
) -> String {
    let message = message.trim_end_matches(['\n', '\r']);
    match meta {
        Some(meta) => format!("{} [{}] {} {}\n", timestamp, level.as_str(), message, meta),
        None => format!("{} [{}] {}\n", timestamp, level.as_str(), message),
    }
}

/// File-backed log at `<work_dir>/jobs/<id>/log.txt`.
pub struct JobLog {
    job_id: i64,
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JobLog {
    /// Open (creating the job directory if needed) the job's log for appending.
    pub async fn open(work_dir: &Path, job_id: i64) -> Result<Self> {
        let dir = job_dir(work_dir, job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create job directory {}", dir.display()))?;
        let path = dir.join(LOG_FILE_NAME);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open job log {}", path.display()))?;
        Ok(Self {
            job_id,
            path,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl LogSink for JobLog {
    async fn write(&self, level: LogLevel, message: &str, meta: Option<&serde_json::Value>) {
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let record = format_record(&timestamp, level, message, meta);
        tracing::debug!(job_id = self.job_id, level = level.as_str(), "{}", record.trim_end());

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(record.as_bytes()).await {
            tracing::warn!(job_id = self.job_id, path = %self.path.display(), "failed to append to job log: {}", e);
            return;
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(job_id = self.job_id, "failed to flush job log: {}", e);
        }
    }
}

/// Opens the log sink of a job.
#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn open(&self, job_id: i64) -> Result<Arc<dyn LogSink>>;
}

/// Provides [`JobLog`] files under a work directory.
pub struct FileLogs {
    work_dir: PathBuf,
}

impl FileLogs {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl LogProvider for FileLogs {
    async fn open(&self, job_id: i64) -> Result<Arc<dyn LogSink>> {
        Ok(Arc::new(JobLog::open(&self.work_dir, job_id).await?))
    }
}

/// Collects log records in memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryLog {
    pub records: std::sync::Mutex<Vec<(LogLevel, String)>>,
}

#[cfg(test)]
impl MemoryLog {
    pub fn text(&self) -> String {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn at(&self, level: LogLevel) -> String {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.as_str())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl LogSink for MemoryLog {
    async fn write(&self, level: LogLevel, message: &str, _meta: Option<&serde_json::Value>) {
        self.records.lock().unwrap().push((level, message.to_string()));
    }
}

/// In-memory logs keyed by job id.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryLogs {
    logs: std::sync::Mutex<std::collections::HashMap<i64, Arc<MemoryLog>>>,
}

#[cfg(test)]
impl MemoryLogs {
    pub fn log(&self, job_id: i64) -> Arc<MemoryLog> {
        self.logs.lock().unwrap().entry(job_id).or_default().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl LogProvider for MemoryLogs {
    async fn open(&self, job_id: i64) -> Result<Arc<dyn LogSink>> {
        Ok(self.log(job_id))
    }
}
