pub mod config;
pub mod error;
pub mod ffprobe;
pub mod params;
pub mod encoder;
pub mod progress;
pub mod validator;
pub mod status;
pub mod job;
pub mod session;
pub mod retention;

#[cfg(test)]
mod testing;

pub use config::EnhanceConfig;
pub use error::{JobError, JobResult};
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, InputProbe};
pub use params::{EncodeOptions, EncodeParams, QualityTier, ResolutionMode, VideoCodec};
pub use job::{CancelOutcome, JobManager, OutputEntry, SubmitReceipt};
pub use status::{JobState, JobStatusView};
pub use session::{FileKind, SessionRegistry};
pub use retention::{disk_usage, DirUsage, RetentionSweeper, SweepReport};
