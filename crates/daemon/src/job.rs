use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::config::EnhanceConfig;
use crate::encoder::{Encoder, EncoderEvent, EncoderExit, EncodeRequest, FfmpegEncoder, PROGRESS_FLOOR};
use crate::error::{JobError, JobResult};
use crate::ffprobe::{FfprobeCli, InputProbe, MediaProber};
use crate::params::{estimate_duration, EncodeOptions, EncodeParams, ParamResolver};
use crate::progress::{remove_if_exists, validate_job_id, ProgressRecord, ProgressStore};
use crate::session::{FileKind, SessionRegistry};
use crate::status::{JobStatusView, StatusResolver};
use crate::validator::OutputValidator;

/// Suffix turning an input stem into a job id
pub const OUTPUT_SUFFIX: &str = "_enhanced.mp4";

/// Returned as soon as a job has been accepted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub output_path: PathBuf,
    pub resolved_params: EncodeParams,
    #[serde(rename = "estimated_duration_secs", serialize_with = "as_secs")]
    pub estimated_duration: Duration,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Container extensions reported by [`JobManager::list_outputs`]
const LISTED_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// A finished or in-progress output file in the processed directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEntry {
    pub job_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// What a cancel request found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// A running encode was stopped
    Stopped,
    /// Nothing was in flight; files were left untouched
    AlreadyIdle,
}

/// Job id for an input: `<stem>_enhanced.mp4`
pub fn job_id_for(input: &Path) -> JobResult<String> {
    let stem = input
        .file_stem()
        .ok_or_else(|| JobError::InputNotFound { path: input.to_path_buf() })?;
    let job_id = format!("{}{}", stem.to_string_lossy(), OUTPUT_SUFFIX);
    validate_job_id(&job_id)?;
    Ok(job_id)
}

/// Handle on a job running in this process
#[derive(Clone)]
struct LiveJob {
    run_id: Uuid,
    cancel: CancellationToken,
    /// Claimed by whichever of completion, timeout or cancel gets there first
    finalized: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl LiveJob {
    fn claim(&self) -> bool {
        claim(&self.finalized)
    }

    async fn finished(&self) {
        let mut done = self.done.clone();
        // a dropped sender means the task is gone too
        let _ = done.wait_for(|d| *d).await;
    }
}

fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
}

struct Inner {
    prober: Arc<dyn MediaProber>,
    encoder: Arc<dyn Encoder>,
    resolver: ParamResolver,
    store: ProgressStore,
    validator: OutputValidator,
    status: StatusResolver,
    sessions: Arc<SessionRegistry>,
    processed_dir: PathBuf,
    timeout: Duration,
    write_interval: Duration,
    live: Mutex<HashMap<String, LiveJob>>,
}

impl Inner {
    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveJob>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Accepts transcode jobs, runs them in the background and answers polls
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        cfg: &EnhanceConfig,
        prober: Arc<dyn MediaProber>,
        encoder: Arc<dyn Encoder>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let store = ProgressStore::new(&cfg.temp_dir);
        let validator = OutputValidator::new(prober.clone(), cfg.min_output_bytes);
        let status = StatusResolver::new(cfg, store.clone(), validator.clone());

        Self {
            inner: Arc::new(Inner {
                prober,
                encoder,
                resolver: ParamResolver::new(),
                store,
                validator,
                status,
                sessions,
                processed_dir: cfg.processed_dir.clone(),
                timeout: cfg.encode_timeout(),
                write_interval: cfg.progress_write_interval(),
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Manager using the ffprobe and ffmpeg binaries named in the config
    pub fn from_config(cfg: &EnhanceConfig, sessions: Arc<SessionRegistry>) -> Self {
        Self::new(
            cfg,
            Arc::new(FfprobeCli::from_config(cfg)),
            Arc::new(FfmpegEncoder::from_config(cfg)),
            sessions,
        )
    }

    /// Accept a job and start encoding in the background
    pub async fn submit(
        &self,
        input: &Path,
        options: EncodeOptions,
        session: Option<&str>,
    ) -> JobResult<SubmitReceipt> {
        let inner = &self.inner;

        let meta = match tokio::fs::metadata(input).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(JobError::InputNotFound { path: input.to_path_buf() }),
        };
        if meta.len() == 0 {
            return Err(JobError::EmptyInput { path: input.to_path_buf() });
        }

        let job_id = job_id_for(input)?;
        info!("Job {}: submitted {} ({})", job_id, input.display(), format_size(meta.len(), DECIMAL));

        let probe = match inner.prober.probe(input).await {
            Ok(data) => InputProbe::from_probe(&data),
            Err(e) => {
                let err = JobError::ProbeFailed { message: format!("{:#}", e) };
                warn!("Job {}: {}; using default input parameters", job_id, err);
                InputProbe::fallback()
            }
        };

        let params = inner.resolver.resolve(&probe, &options);
        let estimated_duration = estimate_duration(&probe, &options);

        // one live encode per output path
        self.stop_live(&job_id).await;

        tokio::fs::create_dir_all(&inner.processed_dir).await?;
        let output_path = inner.processed_dir.join(&job_id);
        if remove_if_exists(&output_path).await? {
            debug!("Job {}: removed previous output", job_id);
        }

        inner.store.write(&job_id, &ProgressRecord::started("queued")).await?;

        if let Some(session) = session {
            inner.sessions.register(session, input, FileKind::Input);
            inner.sessions.register(session, &output_path, FileKind::Output);
        }

        let request = EncodeRequest {
            input: input.to_path_buf(),
            output: output_path.clone(),
            params: params.clone(),
            duration_secs: probe.duration_secs,
        };
        self.spawn(job_id.clone(), request);

        info!("Job {}: queued, estimated {}s", job_id, estimated_duration.as_secs());

        Ok(SubmitReceipt {
            job_id,
            output_path,
            resolved_params: params,
            estimated_duration,
        })
    }

    fn spawn(&self, job_id: String, request: EncodeRequest) {
        let (done_tx, done_rx) = watch::channel(false);
        let live = LiveJob {
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            finalized: Arc::new(AtomicBool::new(false)),
            done: done_rx,
        };

        // registered before the task starts so it can always find and remove itself
        self.inner.live().insert(job_id.clone(), live.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_job(&inner, &job_id, request, &live).await;

            let mut table = inner.live();
            if table.get(&job_id).map(|j| j.run_id) == Some(live.run_id) {
                table.remove(&job_id);
            }
            drop(table);
            done_tx.send_replace(true);
        });
    }

    /// Stop a live job for this id without touching its files
    async fn stop_live(&self, job_id: &str) -> bool {
        let live = self.inner.live().get(job_id).cloned();
        let Some(live) = live else {
            return false;
        };

        let stopped = live.claim();
        if stopped {
            info!("🛑 Job {}: stopping running encode", job_id);
            live.cancel.cancel();
        }
        live.finished().await;
        stopped
    }

    /// Reconcile the record and the output file into a status
    pub async fn status(&self, job_id: &str) -> JobResult<JobStatusView> {
        self.inner.status.resolve(job_id).await
    }

    /// Stop a running job, delete its output and leave a cancelled record.
    ///
    /// Jobs started by another process are stopped through the pid in their
    /// record. A job that already finished keeps its output and record, so a
    /// repeated cancel changes nothing and reports `AlreadyIdle`.
    pub async fn cancel(&self, job_id: &str) -> JobResult<CancelOutcome> {
        validate_job_id(job_id)?;
        let inner = &self.inner;

        let stopped = self.stop_live(job_id).await || self.stop_elsewhere(job_id).await;
        if !stopped {
            debug!("Job {}: nothing in flight, cancel ignored", job_id);
            return Ok(CancelOutcome::AlreadyIdle);
        }

        let removed_output = remove_if_exists(&inner.processed_dir.join(job_id)).await?;
        inner.store.write(job_id, &ProgressRecord::from_error(0, &JobError::Cancelled)).await?;

        info!("🛑 Job {}: cancelled (output removed: {})", job_id, removed_output);
        Ok(CancelOutcome::Stopped)
    }

    /// Stop a job whose record says it is still running in some other process
    async fn stop_elsewhere(&self, job_id: &str) -> bool {
        let record = match self.inner.store.read(job_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Job {}: unreadable progress record: {}", job_id, e);
                None
            }
        };
        let Some(record) = record.filter(|r| !r.status.is_terminal()) else {
            return false;
        };
        if let Some(pid) = record.pid {
            kill_encoder_process(job_id, pid, &record);
        }
        true
    }

    /// Wait for a job running in this process to finish, then report its status
    pub async fn wait(&self, job_id: &str) -> JobResult<JobStatusView> {
        let live = self.inner.live().get(job_id).cloned();
        if let Some(live) = live {
            live.finished().await;
        }
        self.status(job_id).await
    }

    /// Ids with an encoder running in this process
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.live().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Video files currently in the processed directory, newest first
    pub async fn list_outputs(&self) -> JobResult<Vec<OutputEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.inner.processed_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let listed = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| LISTED_EXTENSIONS.iter().any(|l| l.eq_ignore_ascii_case(ext)));
            if !listed {
                continue;
            }

            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };
            let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());

            entries.push(OutputEntry {
                job_id: entry.file_name().to_string_lossy().to_string(),
                path,
                size: meta.len(),
                modified,
            });
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.job_id.cmp(&b.job_id)));
        debug!("Listed {} output(s) in {}", entries.len(), self.inner.processed_dir.display());
        Ok(entries)
    }

    /// Cancel every job running in this process
    pub async fn shutdown(&self) -> Vec<String> {
        let ids = self.active_jobs();
        for job_id in &ids {
            if let Err(e) = self.cancel(job_id).await {
                warn!("Job {}: cancel during shutdown failed: {}", job_id, e);
            }
        }
        ids
    }
}

/// Persists progress events, throttled and never going backwards
struct ProgressTracker {
    percent: u8,
    pid: Option<u32>,
    last_write: Option<Instant>,
    interval: Duration,
}

impl ProgressTracker {
    fn new(interval: Duration) -> Self {
        Self { percent: 0, pid: None, last_write: None, interval }
    }

    async fn observe(&mut self, inner: &Inner, job_id: &str, live: &LiveJob, event: EncoderEvent) {
        let message = match event {
            EncoderEvent::Spawned { pid } => {
                self.pid = pid;
                self.percent = self.percent.max(PROGRESS_FLOOR);
                self.last_write = None;
                "encoder started".to_string()
            }
            EncoderEvent::Progress(progress) => {
                self.percent = self.percent.max(progress.percent);
                progress.message
            }
        };

        let due = self.last_write.map_or(true, |t| t.elapsed() >= self.interval);
        if !due || live.finalized.load(Ordering::SeqCst) {
            return;
        }

        let record = ProgressRecord::processing(self.percent, message).with_pid(self.pid);
        match inner.store.write(job_id, &record).await {
            Ok(()) => self.last_write = Some(Instant::now()),
            Err(e) => warn!("Job {}: failed to write progress: {}", job_id, e),
        }
    }
}

async fn run_job(inner: &Inner, job_id: &str, request: EncodeRequest, live: &LiveJob) {
    let (events_tx, mut events) = mpsc::channel(64);
    let mut tracker = ProgressTracker::new(inner.write_interval);
    let mut timed_out = false;

    let result = {
        let run = inner.encoder.run(&request, events_tx, live.cancel.clone());
        tokio::pin!(run);
        let deadline = tokio::time::sleep(inner.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = &mut run => break result,
                Some(event) = events.recv() => {
                    tracker.observe(inner, job_id, live, event).await;
                }
                _ = &mut deadline, if !timed_out => {
                    warn!("⏱️  Job {}: exceeded {}s, killing encoder", job_id, inner.timeout.as_secs());
                    timed_out = true;
                    live.cancel.cancel();
                }
            }
        }
    };

    if !live.claim() {
        debug!("Job {}: finalized elsewhere", job_id);
        return;
    }

    let outcome = match result {
        Ok(exit) => judge_exit(inner, &request, &exit, timed_out).await,
        Err(e) => Err(JobError::EncodeProcessFailed { exit_code: -1, diagnostic: format!("{:#}", e) }),
    };

    match outcome {
        Ok(size) => {
            if let Err(e) = inner.store.write(job_id, &ProgressRecord::completed()).await {
                error!("Job {}: failed to write completion record: {}", job_id, e);
            }
            info!("✅ Job {}: completed, {} written to {}",
                  job_id, format_size(size, DECIMAL), request.output.display());
        }
        Err(err) => {
            // never leave a failed job's output behind
            if let Err(e) = remove_if_exists(&request.output).await {
                error!("Job {}: failed to remove partial output: {}", job_id, e);
            }
            if let Err(e) = inner.store.write(job_id, &ProgressRecord::from_error(tracker.percent, &err)).await {
                error!("Job {}: failed to write failure record: {}", job_id, e);
            }
            error!("❌ Job {}: {} ({})", job_id, err, err.kind());
        }
    }
}

/// Decide a finished encode's fate; `Ok` carries the verified output size
async fn judge_exit(inner: &Inner, request: &EncodeRequest, exit: &EncoderExit, timed_out: bool) -> JobResult<u64> {
    if timed_out {
        return Err(JobError::Timeout);
    }
    if !exit.is_candidate_success() {
        return Err(JobError::EncodeProcessFailed {
            exit_code: exit.exit_code.unwrap_or(-1),
            diagnostic: exit.diagnostic(),
        });
    }

    let validation = inner.validator.validate(&request.output).await;
    if !validation.ok {
        return Err(JobError::OutputInvalid {
            reason: validation.reason.unwrap_or_else(|| "unknown".to_string()),
        });
    }

    Ok(tokio::fs::metadata(&request.output).await?.len())
}

/// Kill an encoder started by another process, if that pid still belongs to it
fn kill_encoder_process(job_id: &str, pid: u32, record: &ProgressRecord) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

    let sys = System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()));
    let Some(process) = sys.process(Pid::from_u32(pid)) else {
        debug!("Job {}: encoder pid {} is no longer running", job_id, pid);
        return false;
    };

    // a process started after the record was written is a reused pid
    let record_secs = record.timestamp.timestamp().max(0) as u64;
    if process.start_time() > record_secs + 1 {
        warn!("Job {}: pid {} was reused by another process, not killing", job_id, pid);
        return false;
    }

    let killed = process.kill();
    if killed {
        info!("🛑 Job {}: killed encoder pid {}", job_id, pid);
    } else {
        warn!("Job {}: failed to kill encoder pid {}", job_id, pid);
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::CommandBuilder;
    use crate::params::{AudioPlan, QualityTier, ResolutionMode, VideoCodec};
    use crate::progress::ProgressStatus;
    use crate::status::JobState;
    use crate::testing::{FakeEncoder, FakeProber};

    struct Harness {
        _dir: tempfile::TempDir,
        cfg: EnhanceConfig,
        manager: JobManager,
        encoder: Arc<FakeEncoder>,
        sessions: Arc<SessionRegistry>,
    }

    impl Harness {
        fn new(prober: FakeProber, encoder: FakeEncoder) -> Self {
            Self::with_config(prober, encoder, |_| {})
        }

        fn with_config(prober: FakeProber, encoder: FakeEncoder, tweak: impl FnOnce(&mut EnhanceConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = EnhanceConfig::rooted_at(dir.path());
            cfg.progress_write_interval_ms = 0;
            tweak(&mut cfg);
            cfg.ensure_dirs().unwrap();

            let encoder = Arc::new(encoder);
            let sessions = Arc::new(SessionRegistry::new());
            let manager = JobManager::new(&cfg, Arc::new(prober), encoder.clone(), sessions.clone());
            Self { _dir: dir, cfg, manager, encoder, sessions }
        }

        fn input(&self, name: &str) -> PathBuf {
            let path = self.cfg.uploads_dir.join(name);
            std::fs::write(&path, vec![7u8; 4096]).unwrap();
            path
        }

        fn record_path(&self, job_id: &str) -> PathBuf {
            ProgressStore::new(&self.cfg.temp_dir).record_path(job_id)
        }
    }

    #[test]
    fn test_job_id_from_stem() {
        assert_eq!(job_id_for(Path::new("/up/holiday.mov")).unwrap(), "holiday_enhanced.mp4");
        assert_eq!(job_id_for(Path::new("a.b.mkv")).unwrap(), "a.b_enhanced.mp4");
    }

    #[tokio::test]
    async fn test_missing_input_never_starts_encoder() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        let err = h.manager
            .submit(&h.cfg.uploads_dir.join("ghost.mp4"), EncodeOptions::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::InputNotFound { .. }));
        assert_eq!(h.encoder.runs(), 0);
        assert!(!h.record_path("ghost_enhanced.mp4").exists());
        assert!(h.manager.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        let input = h.cfg.uploads_dir.join("empty.mp4");
        std::fs::write(&input, b"").unwrap();

        let err = h.manager.submit(&input, EncodeOptions::default(), None).await.unwrap_err();
        assert!(matches!(err, JobError::EmptyInput { .. }));
        assert_eq!(h.encoder.runs(), 0);
    }

    #[tokio::test]
    async fn test_high_quality_720p_end_to_end() {
        let h = Harness::new(
            FakeProber::video_with_audio(1280, 720, 30.0, "aac", 10.0),
            FakeEncoder::succeeding(256 * 1024),
        );
        let input = h.input("drive.mp4");
        let options = EncodeOptions { quality: QualityTier::High, ..Default::default() };

        let receipt = h.manager.submit(&input, options, None).await.unwrap();
        assert_eq!(receipt.job_id, "drive_enhanced.mp4");
        assert_eq!(receipt.resolved_params.crf, 20);
        assert!(receipt.resolved_params.width <= 1280 && receipt.resolved_params.height <= 720);
        assert!(receipt.resolved_params.fps <= 30.0);
        assert_eq!(receipt.estimated_duration, Duration::from_secs(15));

        let view = h.manager.wait(&receipt.job_id).await.unwrap();
        assert_eq!(view.status, JobState::Completed);
        assert_eq!(view.percent, 100);
        assert_eq!(view.output.as_deref(), Some(receipt.output_path.as_path()));

        let size = std::fs::metadata(&receipt.output_path).unwrap().len();
        assert!(size > 1024);

        // completed output re-validates independently
        let validator = OutputValidator::new(Arc::new(FakeProber::video(1280, 720, 30.0)), 1024);
        assert!(validator.validate(&receipt.output_path).await.ok);
        assert!(h.manager.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_no_audio_input_drops_audio() {
        let h = Harness::new(FakeProber::video(1920, 1080, 60.0), FakeEncoder::succeeding(8192));
        let input = h.input("silent.mov");
        let options = EncodeOptions {
            resolution: ResolutionMode::Hd720,
            quality: QualityTier::Low,
            codec: VideoCodec::H265,
        };

        let receipt = h.manager.submit(&input, options, None).await.unwrap();
        assert_eq!(receipt.resolved_params.audio, AudioPlan::Strip);
        h.manager.wait(&receipt.job_id).await.unwrap();

        let request = h.encoder.last_request().unwrap();
        let args = CommandBuilder::new().build_encode_command(&request.input, &request.output, &request.params);
        assert!(args.iter().any(|a| a == "-an"));
        assert!(!args.iter().any(|a| a == "-c:a"));
    }

    #[tokio::test]
    async fn test_zero_byte_output_with_clean_exit_fails() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(0));
        let receipt = h.manager.submit(&h.input("tiny.mp4"), EncodeOptions::default(), None).await.unwrap();

        let view = h.manager.wait(&receipt.job_id).await.unwrap();
        assert_eq!(view.status, JobState::Failed);
        assert_eq!(view.error.as_deref(), Some("output rejected: output file is empty"));
        assert!(!receipt.output_path.exists());
    }

    #[tokio::test]
    async fn test_unreadable_output_fails_and_is_removed() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(8192).unreadable());
        let receipt = h.manager.submit(&h.input("junk.mp4"), EncodeOptions::default(), None).await.unwrap();

        let view = h.manager.wait(&receipt.job_id).await.unwrap();
        assert_eq!(view.status, JobState::Failed);
        assert!(view.error.unwrap().starts_with("output rejected: output is not a readable media container"));
        assert!(!receipt.output_path.exists());
    }

    #[tokio::test]
    async fn test_encoder_failure_reports_exit_code_and_diagnostic() {
        let h = Harness::new(
            FakeProber::video(640, 480, 30.0),
            FakeEncoder::failing(1, "frame=  12\nclip.mov: Invalid data found when processing input"),
        );
        let receipt = h.manager.submit(&h.input("clip.mov"), EncodeOptions::default(), None).await.unwrap();

        let view = h.manager.wait(&receipt.job_id).await.unwrap();
        assert_eq!(view.status, JobState::Failed);
        assert_eq!(
            view.error.as_deref(),
            Some("encoder exited with code 1: clip.mov: Invalid data found when processing input")
        );
        assert!(!receipt.output_path.exists());
    }

    #[tokio::test]
    async fn test_unreadable_media_info_uses_defaults() {
        let h = Harness::new(FakeProber::failing(), FakeEncoder::succeeding(8192));
        let receipt = h.manager.submit(&h.input("odd.mkv"), EncodeOptions::default(), None).await.unwrap();

        let p = &receipt.resolved_params;
        assert_eq!((p.width, p.height, p.fps), (640, 480, 30.0));
        assert_eq!(p.audio, AudioPlan::Strip);
        assert_eq!(receipt.estimated_duration, Duration::from_secs(180));
        h.manager.wait(&receipt.job_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_kills_and_removes_output() {
        let h = Harness::with_config(
            FakeProber::video(640, 480, 30.0),
            FakeEncoder::hanging().with_steps(1, Duration::from_millis(1)),
            |cfg| cfg.encode_timeout_secs = 1,
        );
        let receipt = h.manager.submit(&h.input("long.mp4"), EncodeOptions::default(), None).await.unwrap();

        let view = tokio::time::timeout(Duration::from_secs(10), h.manager.wait(&receipt.job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.status, JobState::Timeout);
        assert_eq!(view.error.as_deref(), Some("encode exceeded time budget"));
        assert!(!receipt.output_path.exists());
        assert!(h.manager.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_double_cancel_is_a_noop() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::hanging());
        let receipt = h.manager.submit(&h.input("stop.mp4"), EncodeOptions::default(), None).await.unwrap();
        assert_eq!(h.manager.active_jobs(), vec![receipt.job_id.clone()]);

        let first = h.manager.cancel(&receipt.job_id).await.unwrap();
        let second = h.manager.cancel(&receipt.job_id).await.unwrap();

        assert_eq!(first, CancelOutcome::Stopped);
        assert_eq!(second, CancelOutcome::AlreadyIdle);
        assert!(!receipt.output_path.exists());
        assert!(h.manager.active_jobs().is_empty());

        let view = h.manager.status(&receipt.job_id).await.unwrap();
        assert_eq!(view.status, JobState::Failed);
        assert_eq!(view.error.as_deref(), Some("job cancelled"));

        let third = h.manager.cancel(&receipt.job_id).await.unwrap();
        assert_eq!(third, second);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_output() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        let receipt = h.manager.submit(&h.input("done.mp4"), EncodeOptions::default(), None).await.unwrap();
        h.manager.wait(&receipt.job_id).await;
        assert_eq!(h.manager.status(&receipt.job_id).await.unwrap().status, JobState::Completed);

        let outcome = h.manager.cancel(&receipt.job_id).await.unwrap();

        assert_eq!(outcome, CancelOutcome::AlreadyIdle);
        assert!(receipt.output_path.exists());
        let view = h.manager.status(&receipt.job_id).await.unwrap();
        assert_eq!(view.status, JobState::Completed);
        assert_eq!(view.percent, 100);
    }

    #[tokio::test]
    async fn test_cancel_of_unknown_job_touches_nothing() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        let stray = h.cfg.processed_dir.join("stray_enhanced.mp4");
        std::fs::write(&stray, vec![0u8; 4096]).unwrap();

        assert_eq!(h.manager.cancel("stray_enhanced.mp4").await.unwrap(), CancelOutcome::AlreadyIdle);
        assert!(stray.exists());
        assert!(!h.record_path("stray_enhanced.mp4").exists());
    }

    #[tokio::test]
    async fn test_cancel_of_job_owned_elsewhere_clears_artifacts() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        let store = ProgressStore::new(&h.cfg.temp_dir);
        store.write("remote_enhanced.mp4", &ProgressRecord::processing(40, "encoding")).await.unwrap();
        std::fs::write(h.cfg.processed_dir.join("remote_enhanced.mp4"), b"partial").unwrap();

        assert_eq!(h.manager.cancel("remote_enhanced.mp4").await.unwrap(), CancelOutcome::Stopped);
        let record = store.read("remote_enhanced.mp4").await.unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("job cancelled"));
        assert!(!h.cfg.processed_dir.join("remote_enhanced.mp4").exists());
        assert_eq!(h.manager.cancel("remote_enhanced.mp4").await.unwrap(), CancelOutcome::AlreadyIdle);
    }

    #[tokio::test]
    async fn test_list_outputs_filters_video_files() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        let receipt = h.manager.submit(&h.input("beach.mp4"), EncodeOptions::default(), None).await.unwrap();
        h.manager.wait(&receipt.job_id).await;

        std::fs::write(h.cfg.processed_dir.join("legacy.MOV"), vec![0u8; 10]).unwrap();
        std::fs::write(h.cfg.processed_dir.join("notes.txt"), b"skip").unwrap();
        std::fs::create_dir(h.cfg.processed_dir.join("folder.mkv")).unwrap();

        let outputs = h.manager.list_outputs().await.unwrap();
        let mut ids: Vec<_> = outputs.iter().map(|o| o.job_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["beach_enhanced.mp4", "legacy.MOV"]);

        let beach = outputs.iter().find(|o| o.job_id == "beach_enhanced.mp4").unwrap();
        assert_eq!(beach.path, receipt.output_path);
        assert_eq!(beach.size, 4096);
        assert!(outputs.windows(2).all(|w| w[0].modified >= w[1].modified));
    }

    #[tokio::test]
    async fn test_list_outputs_without_processed_dir() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        std::fs::remove_dir_all(&h.cfg.processed_dir).unwrap();
        assert!(h.manager.list_outputs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resubmit_replaces_live_job() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::hanging());
        let input = h.input("again.mp4");

        h.manager.submit(&input, EncodeOptions::default(), None).await.unwrap();
        let receipt = h.manager.submit(&input, EncodeOptions::default(), None).await.unwrap();

        for _ in 0..200 {
            if h.encoder.runs() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.encoder.runs(), 2);
        assert_eq!(h.manager.active_jobs(), vec![receipt.job_id.clone()]);

        assert_eq!(h.manager.cancel(&receipt.job_id).await.unwrap(), CancelOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_polled_percent_never_decreases() {
        let h = Harness::new(
            FakeProber::video_with_audio(1280, 720, 30.0, "opus", 10.0),
            FakeEncoder::succeeding(64 * 1024).with_steps(20, Duration::from_millis(5)),
        );
        let receipt = h.manager.submit(&h.input("poll.mp4"), EncodeOptions::default(), None).await.unwrap();

        let mut seen = Vec::new();
        loop {
            let view = h.manager.status(&receipt.job_id).await.unwrap();
            seen.push(view.percent);
            if view.status.is_terminal() {
                assert_eq!(view.status, JobState::Completed);
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "percent went backwards: {:?}", seen);
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_records_follow_lifecycle() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096).with_pid(4242));
        let receipt = h.manager.submit(&h.input("life.mp4"), EncodeOptions::default(), None).await.unwrap();
        h.manager.wait(&receipt.job_id).await.unwrap();

        let record = ProgressStore::new(&h.cfg.temp_dir).read(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Completed);
        assert_eq!(record.percent, 100);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_session_tracks_input_and_output() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::succeeding(4096));
        let input = h.input("mine.mp4");
        let receipt = h.manager.submit(&input, EncodeOptions::default(), Some("s-1")).await.unwrap();
        h.manager.wait(&receipt.job_id).await.unwrap();

        let files = h.sessions.files("s-1");
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.kind == FileKind::Input && f.path == input));

        let report = h.sessions.cleanup_session("s-1").await;
        assert_eq!(report.deleted.len(), 2);
        assert!(!input.exists() && !receipt.output_path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let h = Harness::new(FakeProber::video(640, 480, 30.0), FakeEncoder::hanging());
        h.manager.submit(&h.input("a.mp4"), EncodeOptions::default(), None).await.unwrap();
        h.manager.submit(&h.input("b.mp4"), EncodeOptions::default(), None).await.unwrap();
        assert_eq!(h.manager.active_jobs().len(), 2);

        let stopped = h.manager.shutdown().await;
        assert_eq!(stopped, vec!["a_enhanced.mp4".to_string(), "b_enhanced.mp4".to_string()]);
        assert!(h.manager.active_jobs().is_empty());
    }

    #[test]
    fn test_receipt_json() {
        let receipt = SubmitReceipt {
            job_id: "x_enhanced.mp4".into(),
            output_path: PathBuf::from("processed/x_enhanced.mp4"),
            resolved_params: EncodeParams {
                width: 640,
                height: 480,
                fps: 30.0,
                crf: 25,
                gop_size: 60,
                preset: "medium".into(),
                codec: VideoCodec::H264,
                audio: AudioPlan::Strip,
            },
            estimated_duration: Duration::from_secs(42),
        };
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["estimated_duration_secs"], 42);
        assert_eq!(json["resolved_params"]["audio"]["mode"], "strip");
        assert_eq!(json["resolved_params"]["codec"], "h264");
    }
}
