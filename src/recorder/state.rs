//! Recording state management
//!
//! Defines the recording state machine, the recording configuration and
//! session tracking.

use crate::capture::{CaptureRect, ScreenRect};
use crate::encoder::{FrameRate, Resolution};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Components are being configured
    Starting,
    /// Frames are being written
    Recording,
    /// Forwarding is suspended; capture keeps running
    Paused,
    /// Draining and finalizing the container
    Stopping,
    /// The container was finalized
    Finished,
    /// The session failed; call `reset` or `start` again
    Error,
}

impl RecordingState {
    /// Recording or paused
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

/// What gets captured besides the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFlags {
    pub capture_system_audio: bool,
    pub capture_microphone: bool,
    pub show_cursor: bool,
}

impl RecordingFlags {
    pub fn audio_enabled(&self) -> bool {
        self.capture_system_audio || self.capture_microphone
    }
}

impl Default for RecordingFlags {
    fn default() -> Self {
        Self {
            capture_system_audio: false,
            capture_microphone: false,
            show_cursor: true,
        }
    }
}

/// Configuration for starting a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
    /// Region in screen coordinates (bottom-left origin); `None` records the whole display
    #[serde(default)]
    pub region: Option<ScreenRect>,

    #[serde(default)]
    pub resolution: Resolution,

    #[serde(default)]
    pub frame_rate: FrameRate,

    #[serde(flatten)]
    pub flags: RecordingFlags,

    /// Directory the output file is created in
    pub output_dir: PathBuf,

    /// Explicit output file, overriding the generated name
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl RecordingConfig {
    /// Full-display 1080p30 recording without audio
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            region: None,
            resolution: Resolution::default(),
            frame_rate: FrameRate::default(),
            flags: RecordingFlags::default(),
            output_dir: output_dir.into(),
            output_path: None,
        }
    }

    /// Where the container is written
    pub fn resolve_output_path(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join(output_file_name(Local::now())))
    }
}

/// `REC-<yyyyMMddHHmmss>.mp4`
pub fn output_file_name(now: DateTime<Local>) -> String {
    format!("REC-{}.mp4", now.format("%Y%m%d%H%M%S"))
}

/// One uninterrupted stretch of recording between pauses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    /// Segment index (0, 1, 2, ...)
    pub index: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RecordingSegment {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn end(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Wall-clock length, up to now for an open segment
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// The recording owned by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub id: Uuid,
    /// Captured region, top-left origin in display points
    pub region: Option<CaptureRect>,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub flags: RecordingFlags,
    pub state: RecordingState,
    /// When the session entered `Recording`; display only
    pub started_at: Option<DateTime<Utc>>,
    /// Fixed at `Starting`
    pub output_path: PathBuf,
    pub segments: Vec<RecordingSegment>,
}

impl RecordingSession {
    pub fn new(config: &RecordingConfig, output_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            region: None,
            resolution: config.resolution,
            frame_rate: config.frame_rate,
            flags: config.flags,
            state: RecordingState::Starting,
            started_at: None,
            output_path,
            segments: Vec::new(),
        }
    }

    /// Total time spent recording, excluding pauses
    pub fn recorded_ms(&self) -> u64 {
        self.segments.iter().map(RecordingSegment::duration_ms).sum()
    }
}
