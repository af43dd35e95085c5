use std::path::PathBuf;

/// Errors produced while running an enhancement job.
///
/// `ProbeFailed` is recovered inside the job manager. Every other kind is
/// terminal for the job; its `Display` text is what status polls report in
/// the `error` field.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("input file not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("input file is empty: {}", path.display())]
    EmptyInput { path: PathBuf },

    #[error("failed to probe media: {message}")]
    ProbeFailed { message: String },

    #[error("encoder exited with code {exit_code}: {diagnostic}")]
    EncodeProcessFailed { exit_code: i32, diagnostic: String },

    #[error("output rejected: {reason}")]
    OutputInvalid { reason: String },

    #[error("encode exceeded time budget")]
    Timeout,

    #[error("job cancelled")]
    Cancelled,

    #[error("invalid job id: {job_id}")]
    InvalidJobId { job_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    /// Stable category name for this error
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::InputNotFound { .. } => "input_not_found",
            JobError::EmptyInput { .. } => "empty_input",
            JobError::ProbeFailed { .. } => "probe_failed",
            JobError::EncodeProcessFailed { .. } => "encode_process_failed",
            JobError::OutputInvalid { .. } => "output_invalid",
            JobError::Timeout => "timeout",
            JobError::Cancelled => "cancelled",
            JobError::InvalidJobId { .. } => "invalid_job_id",
            JobError::Io(_) => "io_error",
            JobError::Serialization(_) => "serialization_error",
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;
