//! Encoder types and configuration
//!
//! Presets, track settings, writer status and the output descriptor handed
//! back to the caller when a recording is finalized.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Output resolution presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
    #[serde(rename = "2k")]
    Qhd1440,
    #[serde(rename = "4k")]
    Uhd2160,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::Hd720,
        Resolution::Hd1080,
        Resolution::Qhd1440,
        Resolution::Uhd2160,
    ];

    /// Full-frame dimensions (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::Hd720 => (1280, 720),
            Resolution::Hd1080 => (1920, 1080),
            Resolution::Qhd1440 => (2560, 1440),
            Resolution::Uhd2160 => (3840, 2160),
        }
    }

    pub fn height(&self) -> u32 {
        self.dimensions().1
    }

    /// Video bitrate at 30fps, in bits per second
    pub fn base_bitrate(&self) -> u64 {
        match self {
            Resolution::Hd720 => 2_500_000,
            Resolution::Hd1080 => 5_000_000,
            Resolution::Qhd1440 => 8_000_000,
            Resolution::Uhd2160 => 15_000_000,
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Hd1080
    }
}

/// Frame rate presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum FrameRate {
    Fps15,
    Fps24,
    Fps30,
    Fps60,
}

impl FrameRate {
    pub const ALL: [FrameRate; 4] = [
        FrameRate::Fps15,
        FrameRate::Fps24,
        FrameRate::Fps30,
        FrameRate::Fps60,
    ];

    pub fn fps(&self) -> u32 {
        match self {
            FrameRate::Fps15 => 15,
            FrameRate::Fps24 => 24,
            FrameRate::Fps30 => 30,
            FrameRate::Fps60 => 60,
        }
    }

    /// Nominal spacing between frames
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps()
    }

    /// Frames between keyframes (one keyframe every two seconds)
    pub fn keyframe_interval(&self) -> u32 {
        self.fps() * 2
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        FrameRate::Fps30
    }
}

impl TryFrom<u32> for FrameRate {
    type Error = String;

    fn try_from(fps: u32) -> Result<Self, Self::Error> {
        FrameRate::ALL
            .into_iter()
            .find(|rate| rate.fps() == fps)
            .ok_or_else(|| format!("unsupported frame rate: {}", fps))
    }
}

impl From<FrameRate> for u32 {
    fn from(rate: FrameRate) -> u32 {
        rate.fps()
    }
}

/// Video bitrate for a preset pair: the base rate scaled linearly by `fps / 30`
pub fn video_bitrate(resolution: Resolution, frame_rate: FrameRate) -> u64 {
    resolution.base_bitrate() * frame_rate.fps() as u64 / 30
}

/// Video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

/// Audio codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
}

/// Video track settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bits per second
    pub bitrate: u64,
    /// Frames between keyframes
    pub keyframe_interval: u32,
}

/// Audio track settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per second
    pub bitrate: u32,
    /// Input is produced live and must not be buffered for look-ahead
    pub real_time: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            real_time: true,
        }
    }
}

/// Complete writer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderSettings {
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub video: VideoSettings,
    pub audio: Option<AudioSettings>,
}

impl EncoderSettings {
    pub fn new(resolution: Resolution, frame_rate: FrameRate, audio_enabled: bool) -> Self {
        let (width, height) = resolution.dimensions();
        Self {
            resolution,
            frame_rate,
            video: VideoSettings {
                codec: VideoCodec::H264,
                width,
                height,
                fps: frame_rate.fps(),
                bitrate: video_bitrate(resolution, frame_rate),
                keyframe_interval: frame_rate.keyframe_interval(),
            },
            audio: audio_enabled.then(AudioSettings::default),
        }
    }

    /// Use the frame size of a configured capture stream
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.video.width = width;
        self.video.height = height;
        self
    }
}

/// Container tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Video,
    Audio,
}

/// Container writer status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status", content = "reason")]
pub enum WriterStatus {
    NotStarted,
    Writing,
    Finished,
    Failed(String),
}

impl WriterStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, WriterStatus::Failed(_))
    }
}

/// A finalized recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDescriptor {
    pub path: PathBuf,
    pub duration_ms: u64,
    pub frame_count: u64,
    pub has_audio: bool,
}

impl OutputDescriptor {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Encoder errors
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Encoder configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("Unsupported settings: {0}")]
    UnsupportedSettings(String),

    #[error("Cannot add input: {0}")]
    CannotAddInput(String),

    #[error("Writer failed: {0}")]
    WriterFailed(String),

    #[error("Not encoding")]
    NotEncoding,

    #[error("Already encoding")]
    AlreadyEncoding,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
