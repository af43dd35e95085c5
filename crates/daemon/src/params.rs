use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::ffprobe::InputProbe;

/// Highest frame rate an enhanced output is encoded at
pub const MAX_OUTPUT_FPS: f64 = 30.0;

/// Audio codec the MP4 target container carries natively
pub const TARGET_AUDIO_CODEC: &str = "aac";

/// Requested output resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Keep the source resolution, enhance quality only
    #[default]
    Auto,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
}

impl ResolutionMode {
    /// Bounding box for explicit modes
    pub fn bounding_box(&self) -> Option<(u32, u32)> {
        match self {
            ResolutionMode::Auto => None,
            ResolutionMode::Hd720 => Some((1280, 720)),
            ResolutionMode::Hd1080 => Some((1920, 1080)),
        }
    }
}

/// Requested quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityTier {
    /// Constant-quality factor (lower = better quality, larger file)
    pub fn crf(&self) -> u8 {
        match self {
            QualityTier::Low => 28,
            QualityTier::Medium => 25,
            QualityTier::High => 20,
        }
    }

    /// Rough encode seconds per second of media
    fn speed_factor(&self) -> f64 {
        match self {
            QualityTier::Low => 0.5,
            QualityTier::Medium => 1.0,
            QualityTier::High => 1.5,
        }
    }
}

/// Requested video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    /// Encoder name as ffmpeg knows it
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
        }
    }
}

macro_rules! option_str {
    ($ty:ty, $what:literal, { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($variant),)+
                    other => Err(format!("unknown {} '{}'", $what, other)),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                $(if *self == $variant { return f.write_str($text); })+
                unreachable!()
            }
        }
    };
}

option_str!(ResolutionMode, "resolution", {
    "auto" => ResolutionMode::Auto,
    "720p" => ResolutionMode::Hd720,
    "1080p" => ResolutionMode::Hd1080,
});

option_str!(QualityTier, "quality", {
    "low" => QualityTier::Low,
    "medium" => QualityTier::Medium,
    "high" => QualityTier::High,
});

option_str!(VideoCodec, "codec", {
    "h264" => VideoCodec::H264,
    "h265" => VideoCodec::H265,
});

/// Options a client submits with a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    pub resolution: ResolutionMode,
    pub quality: QualityTier,
    pub codec: VideoCodec,
}

/// What to do with the audio track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AudioPlan {
    /// No audio stream in the source
    Strip,
    /// Source audio is already in the target codec
    Copy,
    /// Re-encode to the target codec
    Transcode {
        codec: String,
        bitrate_kbps: u32,
        sample_rate: u32,
        channels: u8,
    },
}

/// Fully resolved parameters for one encode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodeParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub crf: u8,
    pub gop_size: u32,
    pub preset: String,
    pub codec: VideoCodec,
    pub audio: AudioPlan,
}

/// Deterministic mapping from probed input + options to encode parameters
#[derive(Debug, Default, Clone, Copy)]
pub struct ParamResolver;

impl ParamResolver {
    pub fn new() -> Self {
        ParamResolver
    }

    /// Resolve parameters and log the decisions taken
    pub fn resolve(&self, probe: &InputProbe, options: &EncodeOptions) -> EncodeParams {
        let params = self.resolve_internal(probe, options);
        self.log_decisions(probe, options, &params);
        params
    }

    fn resolve_internal(&self, probe: &InputProbe, options: &EncodeOptions) -> EncodeParams {
        let (width, height) = target_dimensions(probe.width, probe.height, options.resolution);
        let fps = probe.fps.min(MAX_OUTPUT_FPS);
        let gop_size = ((fps.round() as u32) * 2).max(1);

        EncodeParams {
            width,
            height,
            fps,
            crf: options.quality.crf(),
            gop_size,
            preset: "medium".to_string(),
            codec: options.codec,
            audio: audio_plan(probe),
        }
    }

    fn log_decisions(&self, probe: &InputProbe, options: &EncodeOptions, params: &EncodeParams) {
        use log::info;

        info!("🎯 Resolution: {}x{} -> {}x{} (mode: {})",
              probe.width, probe.height, params.width, params.height, options.resolution);
        info!("🎯 CRF: {} (quality: {}), codec: {}", params.crf, options.quality, params.codec.ffmpeg_name());
        info!("🎞️  Frame rate: {:.3} -> {:.3} fps, GOP {}", probe.fps, params.fps, params.gop_size);
        match &params.audio {
            AudioPlan::Strip => info!("🔇 Audio: no source stream, stripping"),
            AudioPlan::Copy => info!("🔊 Audio: already {}, copying", TARGET_AUDIO_CODEC),
            AudioPlan::Transcode { codec, bitrate_kbps, .. } => info!(
                "🔊 Audio: {} -> {} at {}k",
                probe.audio_codec.as_deref().unwrap_or("unknown"),
                codec,
                bitrate_kbps
            ),
        }
    }
}

/// Scale into the requested box without ever exceeding the source
pub fn target_dimensions(src_w: u32, src_h: u32, mode: ResolutionMode) -> (u32, u32) {
    let (w, h) = match mode.bounding_box() {
        Some((box_w, box_h)) if src_w > box_w || src_h > box_h => {
            let (sw, sh) = (src_w as u64, src_h as u64);
            let (bw, bh) = (box_w as u64, box_h as u64);
            if sw * bh >= bw * sh {
                // width is the limiting side
                (bw, sh * bw / sw)
            } else {
                (sw * bh / sh, bh)
            }
        }
        _ => (src_w as u64, src_h as u64),
    };
    (even_floor(w as u32), even_floor(h as u32))
}

fn even_floor(v: u32) -> u32 {
    (v / 2 * 2).max(2)
}

fn audio_plan(probe: &InputProbe) -> AudioPlan {
    if !probe.has_audio {
        return AudioPlan::Strip;
    }
    match probe.audio_codec.as_deref() {
        Some(codec) if codec.eq_ignore_ascii_case(TARGET_AUDIO_CODEC) => AudioPlan::Copy,
        _ => AudioPlan::Transcode {
            codec: TARGET_AUDIO_CODEC.to_string(),
            bitrate_kbps: 128,
            sample_rate: 44_100,
            channels: 2,
        },
    }
}

/// Best guess at how long an encode will take
pub fn estimate_duration(probe: &InputProbe, options: &EncodeOptions) -> Duration {
    match probe.duration_secs {
        Some(secs) => Duration::from_secs_f64((secs * options.quality.speed_factor()).max(5.0)),
        None => Duration::from_secs(180),
    }
}
