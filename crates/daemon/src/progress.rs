use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::{JobError, JobResult};

/// Extension of the per-job progress sidecar
pub const PROGRESS_EXTENSION: &str = "progress";

/// Status stored in a progress record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Started,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Timeout)
    }
}

/// Persisted progress snapshot for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub percent: u8,
    pub status: ProgressStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Encoder process id while it runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ProgressRecord {
    pub fn started(message: impl Into<String>) -> Self {
        Self::new(0, ProgressStatus::Started, message.into(), None)
    }

    pub fn processing(percent: u8, message: impl Into<String>) -> Self {
        Self::new(percent.min(100), ProgressStatus::Processing, message.into(), None)
    }

    pub fn completed() -> Self {
        Self::new(100, ProgressStatus::Completed, "completed".to_string(), None)
    }

    /// Terminal failing record; `Timeout` errors produce a `timeout` record
    pub fn from_error(percent: u8, err: &JobError) -> Self {
        let (status, message) = match err {
            JobError::Timeout => (ProgressStatus::Timeout, "processing timed out"),
            JobError::Cancelled => (ProgressStatus::Failed, "processing cancelled"),
            _ => (ProgressStatus::Failed, "processing failed"),
        };
        Self::new(percent.min(100), status, message.to_string(), Some(err.to_string()))
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    fn new(percent: u8, status: ProgressStatus, message: String, error: Option<String>) -> Self {
        Self {
            percent,
            status,
            message,
            error,
            timestamp: Utc::now(),
            pid: None,
        }
    }

    /// Time since this record was written
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }
}

/// Reject ids that could address files outside the store
pub fn validate_job_id(job_id: &str) -> JobResult<()> {
    let bad = job_id.is_empty()
        || job_id == "."
        || job_id == ".."
        || job_id.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(JobError::InvalidJobId { job_id: job_id.to_string() });
    }
    Ok(())
}

/// Directory of JSON progress sidecars, one per job
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the path to the progress sidecar for a job
    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", job_id, PROGRESS_EXTENSION))
    }

    /// Write a record atomically: temp file in the same directory, then rename
    pub async fn write(&self, job_id: &str, record: &ProgressRecord) -> JobResult<()> {
        validate_job_id(job_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(job_id);
        let tmp = self.dir.join(format!(
            "{}.{}.{}.tmp",
            job_id,
            PROGRESS_EXTENSION,
            uuid::Uuid::new_v4().simple()
        ));

        let body = serde_json::to_vec(record)?;
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read a record; `None` when no record exists
    pub async fn read(&self, job_id: &str) -> JobResult<Option<ProgressRecord>> {
        validate_job_id(job_id)?;
        match tokio::fs::read(self.record_path(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a record; returns whether one existed
    pub async fn delete(&self, job_id: &str) -> JobResult<bool> {
        validate_job_id(job_id)?;
        remove_if_exists(&self.record_path(job_id)).await
    }
}

/// Remove a file, treating "already gone" as success
pub(crate) async fn remove_if_exists(path: &Path) -> JobResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
