use std::path::Path;
use std::sync::Arc;
use serde::Serialize;
use crate::ffprobe::MediaProber;

/// Outcome of validating a candidate output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self { ok: true, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { ok: false, reason: Some(reason.into()) }
    }
}

/// Checks that an encoder output is a usable media file
///
/// Checks run in order and stop at the first failure:
/// existence, non-zero size, minimum plausible size, and a parseable
/// container holding at least one video stream.
#[derive(Clone)]
pub struct OutputValidator {
    prober: Arc<dyn MediaProber>,
    min_bytes: u64,
}

impl OutputValidator {
    pub fn new(prober: Arc<dyn MediaProber>, min_bytes: u64) -> Self {
        Self { prober, min_bytes }
    }

    pub async fn validate(&self, path: &Path) -> ValidationResult {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return ValidationResult::fail("output path is not a regular file"),
            Err(_) => return ValidationResult::fail("output file does not exist"),
        };

        if let Some(result) = self.check_size(size) {
            return result;
        }

        match self.prober.probe(path).await {
            Ok(data) if data.video_stream().is_some() => ValidationResult::pass(),
            Ok(_) => ValidationResult::fail("output contains no video stream"),
            Err(e) => ValidationResult::fail(format!("output is not a readable media container: {:#}", e)),
        }
    }

    /// Size-only checks; `None` when the size is acceptable
    pub fn check_size(&self, size: u64) -> Option<ValidationResult> {
        if size == 0 {
            return Some(ValidationResult::fail("output file is empty"));
        }
        if size < self.min_bytes {
            return Some(ValidationResult::fail(format!(
                "output file is too small: {} bytes (minimum {})",
                size, self.min_bytes
            )));
        }
        None
    }
}
