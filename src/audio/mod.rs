//! Audio path
//!
//! Taps system audio and/or the microphone, publishes monitoring levels and,
//! once capture starts, tees mixed 48 kHz stereo buffers into the encoder.
//! Monitoring and capture share the same taps: upgrading to capture only
//! sets the forwarding target.

pub mod convert;
pub mod cpal_tap;
pub mod level;
pub mod mixer;
pub mod tap;

pub use cpal_tap::{CpalTap, CpalTapFactory};
pub use level::{rms_level, AudioLevels, LEVEL_GAIN};
pub use mixer::{Mixer, MIX_LATENCY};
pub use tap::{AudioSource, AudioTap, RawAudio, RawSamples, SyntheticTap, SyntheticTapFactory, TapFactory};

use crate::capture::{AudioBuffer, FrameSample, MediaClock, TrackKind};
use crate::encoder::SampleSink;
use crate::utils::ErrorCallback;
use convert::{to_f32, to_stereo, LinearResampler, OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Raw buffers queued between the taps and the processor
const TAP_QUEUE_CAPACITY: usize = 64;

/// Audio errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Microphone permission denied")]
    MicrophonePermissionDenied,

    #[error("Unsupported audio settings: {0}")]
    UnsupportedSettings(String),

    #[error("Cannot add audio input: {0}")]
    CannotAddInput(String),

    #[error("Audio device lost: {0}")]
    DeviceLost(String),
}

/// Per-source conversion state
struct SourceFormat {
    resampler: LinearResampler,
}

/// Converts, mixes and forwards tap buffers
struct Processor {
    mixer: Mixer,
    formats: HashMap<AudioSource, SourceFormat>,
    levels: Arc<watch::Sender<AudioLevels>>,
    forward: Arc<Mutex<Option<SampleSink>>>,
    kind: TrackKind,
}

impl Processor {
    fn handle(&mut self, raw: RawAudio) {
        let level = rms_level(&raw.samples);
        self.levels.send_modify(|levels| levels.set(raw.source, level));

        let stereo = to_stereo(&to_f32(&raw.samples), raw.channels);
        let format = self.formats.entry(raw.source).or_insert_with(|| SourceFormat {
            resampler: LinearResampler::new(raw.sample_rate, OUTPUT_SAMPLE_RATE),
        });
        if format.resampler.input_rate() != raw.sample_rate {
            tracing::info!("{} sample rate changed to {}Hz", raw.source, raw.sample_rate);
            format.resampler = LinearResampler::new(raw.sample_rate, OUTPUT_SAMPLE_RATE);
        }
        let resampled = format.resampler.process(&stereo);

        self.mixer.push(raw.source, raw.pts, &resampled);
        while let Some(mixed) = self.mixer.pull() {
            self.forward(mixed);
        }
    }

    fn forward(&self, (pts, samples): (std::time::Duration, Vec<f32>)) {
        if let Some(ref sink) = *self.forward.lock() {
            let buffer = AudioBuffer::new(OUTPUT_SAMPLE_RATE, OUTPUT_CHANNELS, samples);
            sink.push(FrameSample::audio(pts, self.kind, buffer));
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RawAudio>) {
        while let Some(raw) = rx.recv().await {
            self.handle(raw);
        }
        while let Some(mixed) = self.mixer.flush() {
            self.forward(mixed);
        }
        self.levels.send_replace(AudioLevels::default());
        tracing::debug!("Audio processor stopped");
    }
}

/// Owns the audio taps of one recording
pub struct AudioPath {
    taps: Vec<Box<dyn AudioTap>>,
    clock: MediaClock,
    levels: Arc<watch::Sender<AudioLevels>>,
    forward: Arc<Mutex<Option<SampleSink>>>,
    processor: Option<JoinHandle<()>>,
    on_error: Option<ErrorCallback<AudioError>>,
}

impl AudioPath {
    pub fn new(taps: Vec<Box<dyn AudioTap>>, clock: MediaClock) -> Self {
        let (levels, _) = watch::channel(AudioLevels::default());
        Self {
            taps,
            clock,
            levels: Arc::new(levels),
            forward: Arc::new(Mutex::new(None)),
            processor: None,
            on_error: None,
        }
    }

    /// Publish levels on an existing channel
    pub fn with_levels(mut self, levels: Arc<watch::Sender<AudioLevels>>) -> Self {
        self.levels = levels;
        self
    }

    /// Callback for device loss after the taps opened
    pub fn on_error(&mut self, callback: ErrorCallback<AudioError>) {
        self.on_error = Some(callback);
    }

    pub fn clock(&self) -> MediaClock {
        self.clock
    }

    pub fn sources(&self) -> Vec<AudioSource> {
        self.taps.iter().map(|t| t.source()).collect()
    }

    /// Open the taps and publish levels without recording
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring(&mut self) -> Result<(), AudioError> {
        if self.processor.is_some() {
            return Ok(());
        }
        if self.taps.is_empty() {
            return Err(AudioError::CannotAddInput("no audio source enabled".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AudioError::CannotAddInput("audio processing needs a tokio runtime".to_string()))?;

        let (tx, rx) = mpsc::channel(TAP_QUEUE_CAPACITY);
        let on_error = self
            .on_error
            .clone()
            .unwrap_or_else(|| Arc::new(|e| tracing::error!("Audio error: {}", e)));

        for i in 0..self.taps.len() {
            if let Err(e) = self.taps[i].open(self.clock, tx.clone(), on_error.clone()) {
                tracing::error!("Failed to open {} tap: {}", self.taps[i].source(), e);
                for tap in self.taps[..i].iter_mut() {
                    tap.close();
                }
                return Err(e);
            }
        }
        drop(tx);

        let sources = self.sources();
        let kind = if sources.contains(&AudioSource::Microphone) {
            TrackKind::Microphone
        } else {
            TrackKind::SystemAudio
        };
        let processor = Processor {
            mixer: Mixer::new(&sources),
            formats: HashMap::new(),
            levels: self.levels.clone(),
            forward: self.forward.clone(),
            kind,
        };
        self.processor = Some(runtime.spawn(processor.run(rx)));

        tracing::info!("Audio monitoring started: {:?}", sources);
        Ok(())
    }

    /// Tee buffers into the encoder, opening the taps first if needed
    pub fn start_capture(&mut self, sink: SampleSink) -> Result<(), AudioError> {
        self.start_monitoring()?;
        *self.forward.lock() = Some(sink);
        tracing::info!("Audio capture started");
        Ok(())
    }

    /// Close the taps and flush what is left into the encoder
    pub async fn stop(&mut self) {
        for tap in self.taps.iter_mut() {
            tap.close();
        }
        if let Some(processor) = self.processor.take() {
            if let Err(e) = processor.await {
                tracing::warn!("Audio processor ended abnormally: {}", e);
            }
        }
        *self.forward.lock() = None;
        tracing::info!("Audio path stopped");
    }

    pub fn levels(&self) -> watch::Receiver<AudioLevels> {
        self.levels.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.processor.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.forward.lock().is_some()
    }
}

impl Drop for AudioPath {
    fn drop(&mut self) {
        for tap in self.taps.iter_mut() {
            tap.close();
        }
        if let Some(processor) = self.processor.take() {
            processor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn path_with(taps: Vec<SyntheticTap>) -> AudioPath {
        AudioPath::new(
            taps.into_iter().map(|t| Box::new(t) as Box<dyn AudioTap>).collect(),
            MediaClock::new(),
        )
    }

    #[tokio::test]
    async fn test_monitoring_publishes_levels() {
        let mut path = path_with(vec![SyntheticTap::new(AudioSource::Microphone).with_amplitude(0.1)]);
        let mut levels = path.levels();
        path.start_monitoring().unwrap();

        tokio::time::timeout(Duration::from_secs(1), levels.changed())
            .await
            .unwrap()
            .unwrap();
        let mic = levels.borrow().microphone;
        // Sine RMS is amplitude / sqrt(2)
        assert!((mic - 0.1 / 2f32.sqrt() * LEVEL_GAIN).abs() < 0.02, "level {}", mic);
        assert_eq!(levels.borrow().system, 0.0);
        assert!(!path.is_capturing());

        path.stop().await;
        assert_eq!(levels.borrow().microphone, 0.0);
    }

    #[tokio::test]
    async fn test_capture_reuses_monitoring_taps() {
        let tap = SyntheticTap::new(AudioSource::Microphone);
        let opens = tap.open_counter();
        let mut path = path_with(vec![tap]);
        path.start_monitoring().unwrap();

        let (sink, mut rx) = SampleSink::channel(256);
        path.start_capture(sink).unwrap();
        assert!(path.is_capturing());
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        path.stop().await;

        let mut samples = Vec::new();
        while let Some(sample) = rx.try_recv() {
            samples.push(sample);
        }
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.kind == TrackKind::Microphone));
        let buffer = samples[0].audio_buffer().unwrap();
        assert_eq!((buffer.sample_rate, buffer.channels), (48_000, 2));
        assert!(samples.windows(2).all(|w| w[0].pts < w[1].pts));
    }

    #[tokio::test]
    async fn test_failed_tap_closes_opened_ones() {
        let system = SyntheticTap::new(AudioSource::System);
        let mut path = path_with(vec![system, SyntheticTap::new(AudioSource::Microphone).deny_permission()]);

        assert_eq!(path.start_monitoring(), Err(AudioError::MicrophonePermissionDenied));
        assert!(!path.is_monitoring());
        assert!(path.taps.iter().all(|t| !t.is_open()));
    }

    #[tokio::test]
    async fn test_mixed_sources_resampled() {
        let mut path = path_with(vec![
            SyntheticTap::new(AudioSource::System).with_format(44_100, 1),
            SyntheticTap::new(AudioSource::Microphone),
        ]);
        let (sink, mut rx) = SampleSink::channel(256);
        path.start_capture(sink).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        path.stop().await;

        let mut frames = 0;
        while let Some(sample) = rx.try_recv() {
            let buffer = sample.audio_buffer().unwrap();
            assert_eq!(buffer.sample_rate, 48_000);
            frames += buffer.frames();
        }
        assert!(frames > 0);
    }

    #[test]
    fn test_monitoring_without_runtime_fails() {
        let mut path = path_with(vec![SyntheticTap::new(AudioSource::System)]);
        assert!(matches!(path.start_monitoring(), Err(AudioError::CannotAddInput(_))));
    }
}
