//! Audio device taps
//!
//! A tap owns one device stream and pushes raw buffers into the audio
//! path's processing queue. Taps never block their callback context: when
//! the queue is full the buffer is dropped.

use super::AudioError;
use crate::capture::{MediaClock, TrackKind};
use crate::utils::ErrorCallback;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Which audio source a tap listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioSource {
    System,
    Microphone,
}

impl AudioSource {
    pub fn track_kind(&self) -> TrackKind {
        match self {
            AudioSource::System => TrackKind::SystemAudio,
            AudioSource::Microphone => TrackKind::Microphone,
        }
    }
}

impl std::fmt::Display for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioSource::System => write!(f, "system audio"),
            AudioSource::Microphone => write!(f, "microphone"),
        }
    }
}

/// Interleaved samples in the device's native format
#[derive(Debug, Clone)]
pub enum RawSamples {
    F32(Vec<f32>),
    I16(Vec<i16>),
    U16(Vec<u16>),
}

impl RawSamples {
    pub fn len(&self) -> usize {
        match self {
            RawSamples::F32(s) => s.len(),
            RawSamples::I16(s) => s.len(),
            RawSamples::U16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One device buffer
#[derive(Debug, Clone)]
pub struct RawAudio {
    pub source: AudioSource,
    /// Capture time of the first frame on the session media clock
    pub pts: Duration,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: RawSamples,
}

impl RawAudio {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// A device stream feeding the audio path
pub trait AudioTap: Send {
    fn source(&self) -> AudioSource;

    /// Acquire the device and start pushing buffers
    ///
    /// Errors that happen after a successful open (device unplugged) go
    /// through `on_error`.
    fn open(
        &mut self,
        clock: MediaClock,
        tx: mpsc::Sender<RawAudio>,
        on_error: ErrorCallback<AudioError>,
    ) -> Result<(), AudioError>;

    /// Release the device; the tap's sender is dropped once this returns
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Builds taps for the sources a recording enables
pub trait TapFactory: Send + Sync {
    fn create(&self, source: AudioSource) -> Result<Box<dyn AudioTap>, AudioError>;
}

/// Sine generator
#[derive(Debug, Clone, Copy)]
struct Tone {
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    amplitude: f32,
}

impl Tone {
    fn fill(&self, start_frame: u64, frames: usize) -> Vec<f32> {
        let channels = self.channels as usize;
        let step = std::f32::consts::TAU * self.frequency / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let phase = ((start_frame + i as u64) as f32 * step) % std::f32::consts::TAU;
            let value = phase.sin() * self.amplitude;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        samples
    }
}

/// Tone generator standing in for a device
pub struct SyntheticTap {
    source: AudioSource,
    tone: Tone,
    buffer_duration: Duration,
    deny_permission: bool,
    running: Arc<AtomicBool>,
    opens: Arc<AtomicU32>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SyntheticTap {
    pub fn new(source: AudioSource) -> Self {
        Self {
            source,
            tone: Tone {
                sample_rate: 48_000,
                channels: 2,
                frequency: 440.0,
                amplitude: 0.25,
            },
            buffer_duration: Duration::from_millis(10),
            deny_permission: false,
            running: Arc::new(AtomicBool::new(false)),
            opens: Arc::new(AtomicU32::new(0)),
            thread: None,
        }
    }

    pub fn with_format(mut self, sample_rate: u32, channels: u16) -> Self {
        self.tone.sample_rate = sample_rate;
        self.tone.channels = channels;
        self
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.tone.amplitude = amplitude;
        self
    }

    pub fn with_buffer_duration(mut self, duration: Duration) -> Self {
        self.buffer_duration = duration;
        self
    }

    /// Fail `open` as if the user refused microphone access
    pub fn deny_permission(mut self) -> Self {
        self.deny_permission = true;
        self
    }

    /// Counter incremented on every successful open
    pub fn open_counter(&self) -> Arc<AtomicU32> {
        self.opens.clone()
    }
}

impl AudioTap for SyntheticTap {
    fn source(&self) -> AudioSource {
        self.source
    }

    fn open(
        &mut self,
        clock: MediaClock,
        tx: mpsc::Sender<RawAudio>,
        _on_error: ErrorCallback<AudioError>,
    ) -> Result<(), AudioError> {
        if self.deny_permission && self.source == AudioSource::Microphone {
            return Err(AudioError::MicrophonePermissionDenied);
        }
        let tone = self.tone;
        if tone.sample_rate == 0 || tone.channels == 0 {
            return Err(AudioError::UnsupportedSettings(format!(
                "{}Hz/{}ch",
                tone.sample_rate, tone.channels
            )));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let frames = ((self.buffer_duration.as_secs_f64() * tone.sample_rate as f64).round() as usize).max(1);
        let running = self.running.clone();
        let interval = self.buffer_duration;
        let source = self.source;

        let thread = std::thread::Builder::new()
            .name(format!("synthetic-{}", source))
            .spawn(move || {
                let base = clock.now();
                let mut index: u64 = 0;
                while running.load(Ordering::SeqCst) {
                    let start_frame = index * frames as u64;
                    let buffer = RawAudio {
                        source,
                        pts: base + interval * index as u32,
                        sample_rate: tone.sample_rate,
                        channels: tone.channels,
                        samples: RawSamples::F32(tone.fill(start_frame, frames)),
                    };
                    if tx.try_send(buffer).is_err() && tx.is_closed() {
                        break;
                    }
                    index += 1;
                    std::thread::sleep(interval);
                }
            })
            .map_err(|e| AudioError::CannotAddInput(format!("Failed to start tone generator: {}", e)))?;

        self.thread = Some(thread);
        self.opens.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Synthetic {} tap opened", self.source);
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for SyntheticTap {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

/// Factory for [`SyntheticTap`]s
#[derive(Debug, Clone, Default)]
pub struct SyntheticTapFactory {
    pub deny_microphone: bool,
    /// Override the generated format, e.g. to exercise resampling
    pub format: Option<(u32, u16)>,
}

impl TapFactory for SyntheticTapFactory {
    fn create(&self, source: AudioSource) -> Result<Box<dyn AudioTap>, AudioError> {
        let mut tap = SyntheticTap::new(source);
        if let Some((rate, channels)) = self.format {
            tap = tap.with_format(rate, channels);
        }
        if self.deny_microphone {
            tap = tap.deny_permission();
        }
        Ok(Box::new(tap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ErrorCallback<AudioError> {
        Arc::new(|_| {})
    }

    #[test]
    fn test_synthetic_tap_produces_timed_buffers() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut tap = SyntheticTap::new(AudioSource::System).with_format(44_100, 1);
        tap.open(MediaClock::new(), tx, noop()).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        tap.close();

        let mut buffers = Vec::new();
        while let Ok(buffer) = rx.try_recv() {
            buffers.push(buffer);
        }
        assert!(buffers.len() >= 3);
        assert_eq!(buffers[0].frames(), 441);
        assert_eq!(buffers[1].pts - buffers[0].pts, Duration::from_millis(10));
        assert!(buffers.iter().all(|b| b.source == AudioSource::System && b.channels == 1));
    }

    #[test]
    fn test_denied_microphone() {
        let (tx, _rx) = mpsc::channel(4);
        let mut tap = SyntheticTap::new(AudioSource::Microphone).deny_permission();
        assert_eq!(
            tap.open(MediaClock::new(), tx, noop()),
            Err(AudioError::MicrophonePermissionDenied)
        );
        assert!(!tap.is_open());
    }

    #[test]
    fn test_second_open_does_not_reacquire() {
        let (tx, _rx) = mpsc::channel(64);
        let mut tap = SyntheticTap::new(AudioSource::Microphone);
        let opens = tap.open_counter();
        tap.open(MediaClock::new(), tx.clone(), noop()).unwrap();
        tap.open(MediaClock::new(), tx, noop()).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        tap.close();
        assert!(!tap.is_open());
    }
}
