//! In-process container writer
//!
//! Records every appended sample and writes a JSON summary of the container
//! instead of media. A [`MemoryWriterHandle`] lets tests toggle readiness,
//! inject failures and inspect what was written.

use super::types::{EncoderSettings, EncodingError, Track, WriterStatus};
use super::writer::{ContainerWriter, WriterFactory};
use crate::capture::SampleBuffer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Per-track summary written at finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub kind: Track,
    pub codec: String,
    pub samples: u64,
    /// Session-relative timestamps in milliseconds
    pub timestamps_ms: Vec<u64>,
    /// Timestamps of samples that start a GOP (video only)
    pub keyframes_ms: Vec<u64>,
}

/// Container summary written to the output path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u64,
    pub duration_ms: u64,
    pub tracks: Vec<TrackSummary>,
}

impl ContainerSummary {
    pub fn track(&self, kind: Track) -> Option<&TrackSummary> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Read a summary written by [`MemoryWriter`]
pub fn read_summary(path: &Path) -> Result<ContainerSummary, EncodingError> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map_err(|e| EncodingError::ConfigurationFailed(format!("invalid container summary: {}", e)))
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: bool,
    fail_with: Option<String>,
    empty_output: bool,
    finalize_delay: Option<Duration>,
    created: u32,
    anchor: Option<Duration>,
    video: Vec<(Duration, bool)>,
    audio: Vec<Duration>,
}

/// Control and inspection handle shared with every writer of a factory
#[derive(Debug, Clone)]
pub struct MemoryWriterHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWriterHandle {
    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    /// Make the next append fail with this reason
    pub fn fail_with(&self, reason: &str) {
        self.state.lock().fail_with = Some(reason.to_string());
    }

    /// Finalize without writing anything
    pub fn write_empty_output(&self, empty: bool) {
        self.state.lock().empty_output = empty;
    }

    pub fn set_finalize_delay(&self, delay: Duration) {
        self.state.lock().finalize_delay = Some(delay);
    }

    /// Writers created so far
    pub fn created(&self) -> u32 {
        self.state.lock().created
    }

    pub fn anchor(&self) -> Option<Duration> {
        self.state.lock().anchor
    }

    /// Video samples appended in the latest session
    pub fn written(&self) -> usize {
        self.state.lock().video.len()
    }

    pub fn video_pts(&self) -> Vec<Duration> {
        self.state.lock().video.iter().map(|(pts, _)| *pts).collect()
    }

    pub fn keyframe_pts(&self) -> Vec<Duration> {
        self.state
            .lock()
            .video
            .iter()
            .filter(|(_, key)| *key)
            .map(|(pts, _)| *pts)
            .collect()
    }

    pub fn audio_pts(&self) -> Vec<Duration> {
        self.state.lock().audio.clone()
    }
}

/// Factory for [`MemoryWriter`]s
pub struct MemoryWriterFactory {
    handle: MemoryWriterHandle,
}

impl MemoryWriterFactory {
    pub fn new() -> Self {
        Self {
            handle: MemoryWriterHandle {
                state: Arc::new(Mutex::new(MemoryState {
                    ready: true,
                    ..Default::default()
                })),
            },
        }
    }

    pub fn handle(&self) -> MemoryWriterHandle {
        self.handle.clone()
    }
}

impl Default for MemoryWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn create(
        &self,
        output: &Path,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn ContainerWriter>, EncodingError> {
        std::fs::File::create(output)?;

        let mut state = self.handle.state.lock();
        state.created += 1;
        state.anchor = None;
        state.video.clear();
        state.audio.clear();

        Ok(Box::new(MemoryWriter {
            state: self.handle.state.clone(),
            output: output.to_path_buf(),
            settings: settings.clone(),
            status: WriterStatus::NotStarted,
            inputs_finished: false,
        }))
    }
}

/// Writer that keeps samples in memory
pub struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
    output: PathBuf,
    settings: EncoderSettings,
    status: WriterStatus,
    inputs_finished: bool,
}

impl MemoryWriter {
    fn is_keyframe(&self, pts: Duration) -> bool {
        let slot = (pts.as_secs_f64() * self.settings.video.fps as f64).round() as u64;
        slot % self.settings.video.keyframe_interval as u64 == 0
    }

    fn summary(&self) -> ContainerSummary {
        let state = self.state.lock();
        let to_ms = |d: &Duration| d.as_millis() as u64;

        let mut tracks = vec![TrackSummary {
            kind: Track::Video,
            codec: "h264".to_string(),
            samples: state.video.len() as u64,
            timestamps_ms: state.video.iter().map(|(pts, _)| to_ms(pts)).collect(),
            keyframes_ms: state
                .video
                .iter()
                .filter(|(_, key)| *key)
                .map(|(pts, _)| to_ms(pts))
                .collect(),
        }];
        if self.settings.audio.is_some() {
            tracks.push(TrackSummary {
                kind: Track::Audio,
                codec: "aac".to_string(),
                samples: state.audio.len() as u64,
                timestamps_ms: state.audio.iter().map(to_ms).collect(),
                keyframes_ms: Vec::new(),
            });
        }

        let duration = state
            .video
            .last()
            .map(|(pts, _)| *pts + self.settings.frame_rate.frame_duration())
            .unwrap_or_default();

        ContainerSummary {
            width: self.settings.video.width,
            height: self.settings.video.height,
            fps: self.settings.video.fps,
            bitrate: self.settings.video.bitrate,
            duration_ms: (duration.as_secs_f64() * 1000.0).round() as u64,
            tracks,
        }
    }
}

impl ContainerWriter for MemoryWriter {
    fn status(&self) -> WriterStatus {
        self.status.clone()
    }

    fn is_ready(&self, _track: Track) -> bool {
        !self.inputs_finished && self.state.lock().ready
    }

    fn start_session(&mut self, anchor: Duration) -> Result<(), EncodingError> {
        if self.status != WriterStatus::NotStarted {
            return Err(EncodingError::WriterFailed("session already started".to_string()));
        }
        self.state.lock().anchor = Some(anchor);
        self.status = WriterStatus::Writing;
        Ok(())
    }

    fn append(&mut self, track: Track, pts: Duration, buffer: &SampleBuffer) -> Result<(), EncodingError> {
        if let Some(reason) = self.state.lock().fail_with.take() {
            self.status = WriterStatus::Failed(reason.clone());
            return Err(EncodingError::WriterFailed(reason));
        }

        match (track, buffer) {
            (Track::Video, SampleBuffer::Pixels(_)) => {
                let key = self.is_keyframe(pts);
                self.state.lock().video.push((pts, key));
            }
            (Track::Audio, SampleBuffer::Audio(_)) => self.state.lock().audio.push(pts),
            _ => {
                return Err(EncodingError::UnsupportedSettings(format!(
                    "{:?} track cannot take this buffer",
                    track
                )))
            }
        }
        Ok(())
    }

    fn mark_inputs_finished(&mut self) {
        self.inputs_finished = true;
    }

    fn finalize(&mut self) -> Result<(), EncodingError> {
        let delay = self.state.lock().finalize_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        if !self.state.lock().empty_output {
            let json = serde_json::to_string_pretty(&self.summary())
                .map_err(|e| EncodingError::WriterFailed(e.to_string()))?;
            std::fs::write(&self.output, json)?;
        }
        self.status = WriterStatus::Finished;
        Ok(())
    }

    fn abort(&mut self) {
        if self.output.exists() {
            let _ = std::fs::remove_file(&self.output);
        }
        self.status = WriterStatus::Failed("aborted".to_string());
    }
}
