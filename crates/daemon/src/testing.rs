//! Scripted stand-ins for ffprobe and ffmpeg used by unit tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::encoder::{running_percent, Encoder, EncoderEvent, EncoderExit, EncodeRequest, ProgressEvent};
use crate::ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, MediaProber};

/// Files starting with this marker are reported as unreadable containers
const UNREADABLE_MARKER: &[u8] = b"NOT-A-CONTAINER";

#[derive(Debug, Clone)]
enum ProbeScript {
    Media(FFProbeData),
    Failing,
}

/// Prober returning canned stream data for any existing file
#[derive(Debug)]
pub struct FakeProber {
    script: ProbeScript,
    calls: AtomicUsize,
}

impl FakeProber {
    fn scripted(script: ProbeScript) -> Self {
        Self { script, calls: AtomicUsize::new(0) }
    }

    pub fn video(width: i32, height: i32, fps: f64) -> Self {
        Self::media(vec![video_stream(width, height, fps)], Some(10.0))
    }

    pub fn video_with_audio(width: i32, height: i32, fps: f64, audio_codec: &str, duration: f64) -> Self {
        Self::media(
            vec![video_stream(width, height, fps), audio_stream(audio_codec)],
            Some(duration),
        )
    }

    pub fn audio_only() -> Self {
        Self::media(vec![audio_stream("aac")], Some(10.0))
    }

    pub fn failing() -> Self {
        Self::scripted(ProbeScript::Failing)
    }

    fn media(streams: Vec<FFProbeStream>, duration: Option<f64>) -> Self {
        Self::scripted(ProbeScript::Media(FFProbeData {
            streams,
            format: Some(FFProbeFormat {
                format_name: Some("mov,mp4,m4a,3gp,3g2,mj2".to_string()),
                duration: duration.map(|d| format!("{:.6}", d)),
                size: None,
                bit_rate: None,
            }),
        }))
    }

    /// File contents this prober refuses to parse
    pub fn unreadable_payload(len: usize) -> Vec<u8> {
        let mut bytes = UNREADABLE_MARKER.to_vec();
        bytes.resize(len.max(UNREADABLE_MARKER.len()), b'#');
        bytes
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProber for FakeProber {
    async fn probe(&self, path: &Path) -> Result<FFProbeData> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let bytes = tokio::fs::read(path).await
            .map_err(|e| anyhow!("File does not exist: {} ({})", path.display(), e))?;
        if bytes.starts_with(UNREADABLE_MARKER) {
            return Err(anyhow!("Invalid data found when processing input"));
        }

        match &self.script {
            ProbeScript::Media(data) => Ok(data.clone()),
            ProbeScript::Failing => Err(anyhow!("ffprobe failed (exit code 1)")),
        }
    }
}

fn video_stream(width: i32, height: i32, fps: f64) -> FFProbeStream {
    FFProbeStream {
        index: 0,
        codec_type: Some("video".to_string()),
        codec_name: Some("h264".to_string()),
        width: Some(width),
        height: Some(height),
        avg_frame_rate: Some(format!("{}/1000", (fps * 1000.0).round() as i64)),
        r_frame_rate: Some(format!("{}/1000", (fps * 1000.0).round() as i64)),
        bit_rate: None,
        sample_rate: None,
        channels: None,
        duration: None,
    }
}

fn audio_stream(codec: &str) -> FFProbeStream {
    FFProbeStream {
        index: 1,
        codec_type: Some("audio".to_string()),
        codec_name: Some(codec.to_string()),
        width: None,
        height: None,
        avg_frame_rate: None,
        r_frame_rate: None,
        bit_rate: None,
        sample_rate: Some("48000".to_string()),
        channels: Some(2),
        duration: None,
    }
}

/// Encoder that writes a fixed number of bytes instead of transcoding
#[derive(Debug)]
pub struct FakeEncoder {
    output_bytes: usize,
    unreadable: bool,
    exit_code: i32,
    stderr: String,
    steps: u32,
    step_delay: Duration,
    hang: bool,
    pid: Option<u32>,
    runs: AtomicUsize,
    last_request: Mutex<Option<EncodeRequest>>,
}

impl FakeEncoder {
    /// Exits 0 after writing `output_bytes` of media
    pub fn succeeding(output_bytes: usize) -> Self {
        Self {
            output_bytes,
            unreadable: false,
            exit_code: 0,
            stderr: String::new(),
            steps: 4,
            step_delay: Duration::from_millis(5),
            hang: false,
            pid: None,
            runs: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Exits non-zero after writing a partial output
    pub fn failing(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stderr: stderr.to_string(),
            ..Self::succeeding(4096)
        }
    }

    /// Writes a partial output, then runs until cancelled
    pub fn hanging() -> Self {
        Self { hang: true, ..Self::succeeding(4096) }
    }

    /// Output that the fake prober cannot parse
    pub fn unreadable(mut self) -> Self {
        self.unreadable = true;
        self
    }

    pub fn with_steps(mut self, steps: u32, delay: Duration) -> Self {
        self.steps = steps;
        self.step_delay = delay;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<EncodeRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn payload(&self, len: usize) -> Vec<u8> {
        if self.unreadable {
            FakeProber::unreadable_payload(len)
        } else {
            vec![0u8; len]
        }
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn run(
        &self,
        request: &EncodeRequest,
        events: mpsc::Sender<EncoderEvent>,
        cancel: CancellationToken,
    ) -> Result<EncoderExit> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let _ = events.send(EncoderEvent::Spawned { pid: self.pid }).await;

        let killed = EncoderExit { exit_code: None, stderr_tail: String::new(), killed: true };

        for step in 1..=self.steps {
            tokio::select! {
                _ = tokio::time::sleep(self.step_delay) => {}
                _ = cancel.cancelled() => return Ok(killed),
            }
            let event = ProgressEvent {
                percent: running_percent(step as f64 / (self.steps + 1) as f64),
                message: format!("encoding step {}", step),
            };
            let _ = events.send(EncoderEvent::Progress(event)).await;
        }

        if self.hang {
            tokio::fs::write(&request.output, self.payload(self.output_bytes / 2)).await?;
            cancel.cancelled().await;
            return Ok(killed);
        }

        tokio::fs::write(&request.output, self.payload(self.output_bytes)).await?;
        Ok(EncoderExit {
            exit_code: Some(self.exit_code),
            stderr_tail: self.stderr.clone(),
            killed: false,
        })
    }
}
