use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use crate::config::EnhanceConfig;
use crate::encoder::PROGRESS_CEILING;
use crate::error::{JobError, JobResult};
use crate::progress::{validate_job_id, ProgressRecord, ProgressStatus, ProgressStore};
use crate::validator::{OutputValidator, ValidationResult};

/// Percent reported when nothing is known yet
pub const INITIAL_PERCENT: u8 = 5;

/// Status reported to pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Timeout)
    }
}

/// Answer to a status poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobState,
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output location, only once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// Filesystem facts about the output path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStat {
    pub size: u64,
    /// Time since last modification
    pub age: Duration,
}

/// Everything the decision depends on, gathered up front
#[derive(Debug, Clone)]
pub struct StatusInputs {
    pub record: Option<ProgressRecord>,
    pub output: Option<OutputStat>,
    pub now: DateTime<Utc>,
    pub recency_window: Duration,
    pub record_stale_after: Duration,
}

/// Result of the pure status decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDecision {
    pub status: JobState,
    pub percent: u8,
    pub message: String,
    pub error: Option<String>,
}

impl StatusDecision {
    fn running(status: JobState, percent: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            percent: percent.min(PROGRESS_CEILING),
            message: message.into(),
            error: None,
        }
    }

    fn failed(percent: u8, error: String) -> Self {
        Self {
            status: JobState::Failed,
            percent,
            message: "processing failed".to_string(),
            error: Some(error),
        }
    }
}

impl StatusInputs {
    fn fresh_record(&self) -> Option<&ProgressRecord> {
        self.record
            .as_ref()
            .filter(|r| !r.status.is_terminal() && r.age(self.now) < self.record_stale_after)
    }

    fn terminal_record(&self) -> Option<&ProgressRecord> {
        self.record.as_ref().filter(|r| r.status.is_terminal())
    }

    /// Whether the decision has to look inside the output file
    pub fn needs_validation(&self) -> bool {
        self.terminal_record().is_none() && self.fresh_record().is_none() && self.output.is_some()
    }
}

/// Decide the reported status.
///
/// Precedence: a terminal record, then a fresh non-terminal record, then the
/// output file heuristics (valid, recently written, stale and invalid) and
/// finally "no output yet". `validation` is consulted only when
/// [`StatusInputs::needs_validation`] is true; `None` there counts as invalid.
///
/// Between the output being deleted on resubmit and the new encoder writing
/// its first record a poll can see "no file, no record" and report the
/// initial percent again. That window is accepted.
pub fn resolve_status(inputs: &StatusInputs, validation: Option<&ValidationResult>) -> StatusDecision {
    if let Some(record) = inputs.terminal_record() {
        return match record.status {
            ProgressStatus::Completed => match inputs.output {
                Some(stat) if stat.size > 0 => StatusDecision {
                    status: JobState::Completed,
                    percent: 100,
                    message: record.message.clone(),
                    error: None,
                },
                _ => StatusDecision::failed(record.percent, "output missing after completion".to_string()),
            },
            status => StatusDecision {
                status: if status == ProgressStatus::Timeout { JobState::Timeout } else { JobState::Failed },
                percent: record.percent,
                message: record.message.clone(),
                error: record.error.clone(),
            },
        };
    }

    if let Some(record) = inputs.fresh_record() {
        let state = match record.status {
            ProgressStatus::Started => JobState::Queued,
            _ => JobState::Processing,
        };
        return StatusDecision::running(state, record.percent, record.message.clone());
    }

    let record_percent = inputs.record.as_ref().map(|r| r.percent);

    match inputs.output {
        Some(stat) => {
            let valid = validation.filter(|v| v.ok).is_some();
            if valid {
                return StatusDecision {
                    status: JobState::Completed,
                    percent: 100,
                    message: "completed".to_string(),
                    error: None,
                };
            }
            if stat.age < inputs.recency_window {
                let percent = record_percent.unwrap_or_else(|| size_band_percent(stat.size));
                return StatusDecision::running(JobState::Processing, percent, "encoding");
            }
            let reason = validation
                .and_then(|v| v.reason.clone())
                .unwrap_or_else(|| "output could not be validated".to_string());
            StatusDecision::failed(record_percent.unwrap_or(0), JobError::OutputInvalid { reason }.to_string())
        }
        None => StatusDecision::running(
            JobState::Processing,
            record_percent.unwrap_or(INITIAL_PERCENT),
            "waiting for encoder output",
        ),
    }
}

/// Rough progress guess from how much output exists
pub fn size_band_percent(size: u64) -> u8 {
    const MIB: u64 = 1024 * 1024;
    match size {
        s if s < MIB => 30,
        s if s < 10 * MIB => 50,
        s if s < 50 * MIB => 70,
        _ => 85,
    }
}

/// Reconciles progress records with what is on disk
#[derive(Clone)]
pub struct StatusResolver {
    store: ProgressStore,
    validator: OutputValidator,
    processed_dir: PathBuf,
    recency_window: Duration,
    record_stale_after: Duration,
}

impl StatusResolver {
    pub fn new(cfg: &EnhanceConfig, store: ProgressStore, validator: OutputValidator) -> Self {
        Self {
            store,
            validator,
            processed_dir: cfg.processed_dir.clone(),
            recency_window: cfg.recency_window(),
            record_stale_after: cfg.record_stale_after(),
        }
    }

    pub async fn resolve(&self, job_id: &str) -> JobResult<JobStatusView> {
        validate_job_id(job_id)?;

        let record = match self.store.read(job_id).await {
            Ok(record) => record,
            Err(JobError::Serialization(e)) => {
                warn!("Job {}: unreadable progress record ignored: {}", job_id, e);
                None
            }
            Err(e) => return Err(e),
        };

        let output_path = self.processed_dir.join(job_id);
        let output = match tokio::fs::metadata(&output_path).await {
            Ok(meta) if meta.is_file() => Some(OutputStat {
                size: meta.len(),
                age: meta.modified().ok().and_then(|m| m.elapsed().ok()).unwrap_or_default(),
            }),
            _ => None,
        };

        let inputs = StatusInputs {
            record,
            output,
            now: Utc::now(),
            recency_window: self.recency_window,
            record_stale_after: self.record_stale_after,
        };

        let validation = if inputs.needs_validation() {
            Some(self.validator.validate(&output_path).await)
        } else {
            None
        };

        let decision = resolve_status(&inputs, validation.as_ref());
        debug!("Job {}: resolved {:?} {}%", job_id, decision.status, decision.percent);

        Ok(JobStatusView {
            job_id: job_id.to_string(),
            status: decision.status,
            percent: decision.percent,
            message: decision.message,
            error: decision.error,
            output: (decision.status == JobState::Completed).then_some(output_path),
        })
    }
}
