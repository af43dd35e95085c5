use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::config::EnhanceConfig;
use crate::params::{AudioPlan, EncodeParams, VideoCodec};

/// Lowest percent reported once the encoder is running
pub const PROGRESS_FLOOR: u8 = 15;
/// Highest percent reported before the output has been verified
pub const PROGRESS_CEILING: u8 = 95;

/// Lines of encoder stderr kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// One progress observation from a running encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub message: String,
}

/// Events an encoder emits while it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    /// The external process has been started
    Spawned { pid: Option<u32> },
    Progress(ProgressEvent),
}

/// Everything an encoder needs to produce one output
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub params: EncodeParams,
    /// Media duration, used to turn timestamps into percentages
    pub duration_secs: Option<f64>,
}

/// How the encoder process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderExit {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    /// The process was killed because the cancel token fired
    pub killed: bool,
}

impl EncoderExit {
    /// Exit code 0 without being killed; the output still needs validation
    pub fn is_candidate_success(&self) -> bool {
        !self.killed && self.exit_code == Some(0)
    }

    /// Last non-empty stderr line, or a generic description
    pub fn diagnostic(&self) -> String {
        self.stderr_tail
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "no diagnostic output".to_string())
    }
}

/// Runs an external transcode and reports progress
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Run to completion, or until `cancel` fires (the process is then killed).
    async fn run(
        &self,
        request: &EncodeRequest,
        events: mpsc::Sender<EncoderEvent>,
        cancel: CancellationToken,
    ) -> Result<EncoderExit>;
}

/// Command builder for generating ffmpeg command lines
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the full encode command for one job
    ///
    /// Progress is written as key=value blocks to stdout (`-progress pipe:1`),
    /// stderr only carries errors so its tail is a usable diagnostic.
    pub fn build_encode_command(&self, input: &Path, output: &Path, params: &EncodeParams) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        push(&["-y", "-hide_banner", "-nostats", "-v", "error", "-progress", "pipe:1"]);
        push(&["-i", &input.to_string_lossy()]);

        // First video stream, first audio stream when it is kept
        push(&["-map", "0:v:0"]);
        if params.audio != AudioPlan::Strip {
            push(&["-map", "0:a:0?"]);
        }

        push(&["-c:v", params.codec.ffmpeg_name()]);
        push(&["-crf", &params.crf.to_string()]);
        push(&["-preset", &params.preset]);
        push(&["-pix_fmt", "yuv420p"]);
        match params.codec {
            VideoCodec::H264 => push(&["-profile:v", "main", "-level", "4.0"]),
            // hvc1 tag so MP4 players recognise HEVC
            VideoCodec::H265 => push(&["-tag:v", "hvc1"]),
        }

        let gop = params.gop_size.to_string();
        push(&["-r", &format_fps(params.fps)]);
        push(&["-g", &gop, "-keyint_min", &gop, "-sc_threshold", "0"]);
        push(&["-vf", &format!("scale={}:{}:flags=lanczos", params.width, params.height)]);

        match &params.audio {
            AudioPlan::Strip => push(&["-an"]),
            AudioPlan::Copy => push(&["-c:a", "copy"]),
            AudioPlan::Transcode { codec, bitrate_kbps, sample_rate, channels } => {
                push(&["-c:a", codec]);
                push(&["-b:a", &format!("{}k", bitrate_kbps)]);
                push(&["-ar", &sample_rate.to_string()]);
                push(&["-ac", &channels.to_string()]);
            }
        }

        // moov atom up front for fast start of playback
        push(&["-movflags", "+faststart", "-avoid_negative_ts", "make_zero"]);
        push(&[&output.to_string_lossy()]);

        args
    }
}

/// "30", "29.97", "23.976"
pub fn format_fps(fps: f64) -> String {
    let s = format!("{:.3}", fps);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Map a completion fraction onto the running range `[PROGRESS_FLOOR, PROGRESS_CEILING]`
pub fn running_percent(fraction: f64) -> u8 {
    let span = (PROGRESS_CEILING - PROGRESS_FLOOR) as f64;
    let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
    let percent = PROGRESS_FLOOR as f64 + fraction * span;
    (percent.round() as u8).clamp(PROGRESS_FLOOR, PROGRESS_CEILING)
}

/// Accumulates `-progress` key=value lines into progress events
#[derive(Debug, Clone, Default)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    out_time_secs: Option<f64>,
    out_time: Option<String>,
    explicit_percent: Option<f64>,
}

impl ProgressParser {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self { duration_secs, ..Default::default() }
    }

    /// Feed one line; an event is produced at the end of every block
    pub fn feed(&mut self, line: &str) -> Option<ProgressEvent> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key {
            // both keys carry microseconds
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    if us >= 0 {
                        self.out_time_secs = Some(us as f64 / 1_000_000.0);
                    }
                }
            }
            "out_time" => {
                if value != "N/A" {
                    self.out_time = Some(value.to_string());
                }
            }
            "percent" => {
                self.explicit_percent = value.trim_end_matches('%').parse::<f64>().ok();
            }
            "progress" => return Some(self.event(value == "end")),
            _ => {}
        }
        None
    }

    fn event(&self, finished: bool) -> ProgressEvent {
        if finished {
            return ProgressEvent { percent: PROGRESS_CEILING, message: "finalizing output".to_string() };
        }

        let fraction = self
            .explicit_percent
            .map(|p| p / 100.0)
            .or_else(|| match (self.out_time_secs, self.duration_secs) {
                (Some(t), Some(d)) if d > 0.0 => Some(t / d),
                _ => None,
            });

        let message = match &self.out_time {
            Some(t) => format!("encoding ({})", t),
            None => "encoding".to_string(),
        };

        ProgressEvent {
            percent: fraction.map(running_percent).unwrap_or(PROGRESS_FLOOR),
            message,
        }
    }
}

/// `Encoder` backed by the ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_bin: PathBuf,
    builder: CommandBuilder,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>) -> Self {
        Self { ffmpeg_bin: ffmpeg_bin.into(), builder: CommandBuilder::new() }
    }

    pub fn from_config(cfg: &EnhanceConfig) -> Self {
        Self::new(cfg.ffmpeg_bin.clone())
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn run(
        &self,
        request: &EncodeRequest,
        events: mpsc::Sender<EncoderEvent>,
        cancel: CancellationToken,
    ) -> Result<EncoderExit> {
        let args = self.builder.build_encode_command(&request.input, &request.output, &request.params);
        debug!("Executing ffmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!(
                "Failed to spawn ffmpeg process at: {}. Ensure ffmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            ))?;

        let pid = child.id();
        info!("ffmpeg started (pid {:?}) for {}", pid, request.output.display());
        let _ = events.send(EncoderEvent::Spawned { pid }).await;

        let stdout = child.stdout.take()
            .ok_or_else(|| anyhow!("Failed to capture ffmpeg stdout"))?;
        let stderr = child.stderr.take()
            .ok_or_else(|| anyhow!("Failed to capture ffmpeg stderr"))?;

        let duration = request.duration_secs;
        let stdout_handle = tokio::spawn(async move {
            let mut parser = ProgressParser::new(duration);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = parser.feed(&line) {
                    // keep draining even if nobody listens any more
                    let _ = events.send(EncoderEvent::Progress(event)).await;
                }
            }
        });

        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status.context("Failed to wait for ffmpeg process")?),
            _ = cancel.cancelled() => None,
        };

        let (status, killed) = match waited {
            Some(status) => (status, false),
            None => {
                warn!("Cancelling ffmpeg (pid {:?}) for {}", pid, request.output.display());
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill ffmpeg process {:?}: {}", pid, e);
                }
                (child.wait().await.context("Failed to reap killed ffmpeg process")?, true)
            }
        };

        let _ = stdout_handle.await;
        let stderr_tail = stderr_handle.await.unwrap_or_default();

        debug!("ffmpeg exit status: {:?} (killed: {})", status.code(), killed);

        Ok(EncoderExit {
            exit_code: status.code(),
            stderr_tail,
            killed,
        })
    }
}
