use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use crate::config::EnhanceConfig;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub bit_rate: Option<String>,
    pub sample_rate: Option<String>,
    pub channels: Option<i32>,
    pub duration: Option<String>,
}

impl FFProbeData {
    /// First video stream, if any
    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// First audio stream, if any
    pub fn audio_stream(&self) -> Option<&FFProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some("audio"))
    }

    /// Container duration in seconds, falling back to the video stream duration
    pub fn duration_secs(&self) -> Option<f64> {
        self.format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .or_else(|| self.video_stream().and_then(|s| s.duration.as_deref()))
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// Parse the JSON document printed by `ffprobe -print_format json`
pub fn parse_probe_json(json_str: &str) -> Result<FFProbeData> {
    serde_json::from_str(json_str).context("Failed to parse ffprobe JSON")
}

/// Helper function to parse frame rate from string (e.g., "30/1", "29.97", "60")
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    let rate = match frame_rate_str.split_once('/') {
        Some((num_str, den_str)) => {
            let num = num_str.parse::<f64>().ok()?;
            let den = den_str.parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => frame_rate_str.parse::<f64>().ok()?,
    };

    // same plausible range for both spellings
    Some(rate).filter(|&f| f > 0.0 && f < 1000.0)
}

/// Reads media metadata from a file
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<FFProbeData>;
}

/// `MediaProber` backed by the ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeCli {
    ffprobe_bin: PathBuf,
}

impl FfprobeCli {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self { ffprobe_bin: ffprobe_bin.into() }
    }

    pub fn from_config(cfg: &EnhanceConfig) -> Self {
        Self::new(cfg.ffprobe_bin.clone())
    }
}

#[async_trait]
impl MediaProber for FfprobeCli {
    async fn probe(&self, file_path: &Path) -> Result<FFProbeData> {
        use log::debug;

        if !file_path.exists() {
            return Err(anyhow!("File does not exist: {}", file_path.display()));
        }

        debug!("Executing ffprobe for: {}", file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute ffprobe for: {}. Ensure ffprobe is installed and accessible at: {}",
                file_path.display(),
                self.ffprobe_bin.display()
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);

            return Err(anyhow!(
                "ffprobe failed (exit code {}) for {}: {}",
                exit_code,
                file_path.display(),
                stderr.trim()
            ));
        }

        let json_str = String::from_utf8(output.stdout)
            .context("ffprobe output is not valid UTF-8")?;

        parse_probe_json(&json_str)
            .with_context(|| format!("Failed to parse ffprobe output for: {}", file_path.display()))
    }
}

/// The input characteristics parameter resolution works from
#[derive(Debug, Clone, PartialEq)]
pub struct InputProbe {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub has_audio: bool,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub duration_secs: Option<f64>,
}

impl InputProbe {
    pub const DEFAULT_WIDTH: u32 = 640;
    pub const DEFAULT_HEIGHT: u32 = 480;
    pub const DEFAULT_FPS: f64 = 30.0;

    /// Conservative defaults used when probing fails
    pub fn fallback() -> Self {
        Self {
            width: Self::DEFAULT_WIDTH,
            height: Self::DEFAULT_HEIGHT,
            fps: Self::DEFAULT_FPS,
            has_audio: false,
            audio_codec: None,
            video_codec: None,
            duration_secs: None,
        }
    }

    /// Summarize ffprobe output; missing fields take the fallback values
    pub fn from_probe(data: &FFProbeData) -> Self {
        let video = data.video_stream();
        let audio = data.audio_stream();

        let positive = |v: Option<i32>| v.filter(|v| *v > 0).map(|v| v as u32);

        let fps = video
            .and_then(|s| s.r_frame_rate.as_deref().or(s.avg_frame_rate.as_deref()))
            .and_then(parse_frame_rate)
            .unwrap_or(Self::DEFAULT_FPS);

        Self {
            width: positive(video.and_then(|s| s.width)).unwrap_or(Self::DEFAULT_WIDTH),
            height: positive(video.and_then(|s| s.height)).unwrap_or(Self::DEFAULT_HEIGHT),
            fps,
            has_audio: audio.is_some(),
            audio_codec: audio.and_then(|s| s.codec_name.clone()),
            video_codec: video.and_then(|s| s.codec_name.clone()),
            duration_secs: data.duration_secs(),
        }
    }
}
