//! Encoder front-end
//!
//! Starts encoder sessions, hands out sample sinks to producers and awaits
//! finalization. The container writer itself lives on the session thread.

use super::gate::ForwardGate;
use super::session::{EncoderSession, SessionShared};
use super::sink::{EncoderCommand, SampleSink};
use super::types::{
    EncoderSettings, EncodingError, FrameRate, OutputDescriptor, Resolution, WriterStatus,
};
use super::writer::WriterFactory;
use super::ProgressCallback;
use crate::capture::FrameSample;
use crate::utils::ErrorCallback;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Samples buffered between producers and the writer thread
const QUEUE_CAPACITY: usize = 16;

/// Upper bound on writer finalization
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveSession {
    commands: mpsc::Sender<EncoderCommand>,
    sink: SampleSink,
    gate: ForwardGate,
    settings: EncoderSettings,
    output: PathBuf,
    thread: std::thread::JoinHandle<()>,
}

/// Owns the output container for one recording at a time
pub struct Encoder {
    factory: Arc<dyn WriterFactory>,
    on_error: Option<ErrorCallback<EncodingError>>,
    on_progress: Option<ProgressCallback>,
    active: Option<ActiveSession>,
    shared: SessionShared,
    /// Writer thread left behind by a finalize timeout
    lingering: Option<std::thread::JoinHandle<()>>,
}

impl Encoder {
    pub fn new(factory: Arc<dyn WriterFactory>) -> Self {
        Self {
            factory,
            on_error: None,
            on_progress: None,
            active: None,
            shared: SessionShared::new(),
            lingering: None,
        }
    }

    /// Callback for asynchronous writer failures, fired at most once per session
    pub fn on_error(&mut self, callback: ErrorCallback<EncodingError>) {
        self.on_error = Some(callback);
    }

    /// Callback fired with the frame count once per second of written video
    pub fn on_progress(&mut self, callback: ProgressCallback) {
        self.on_progress = Some(callback);
    }

    /// Start a session with preset-sized video
    pub fn start_encoding(
        &mut self,
        output: &Path,
        resolution: Resolution,
        frame_rate: FrameRate,
        audio_enabled: bool,
    ) -> Result<(), EncodingError> {
        self.start_with_settings(output, EncoderSettings::new(resolution, frame_rate, audio_enabled))
    }

    /// Start a session with explicit settings
    pub fn start_with_settings(
        &mut self,
        output: &Path,
        settings: EncoderSettings,
    ) -> Result<(), EncodingError> {
        if let Some(active) = self.active.take() {
            if !self.shared.status.lock().is_failed() {
                self.active = Some(active);
                return Err(EncodingError::AlreadyEncoding);
            }
            // A failed session is inert; replace it
            active.sink.close();
            let _ = active.commands.try_send(EncoderCommand::Abort);
        }

        if settings.video.width % 2 != 0 || settings.video.height % 2 != 0 {
            return Err(EncodingError::UnsupportedSettings(format!(
                "frame size {}x{} must be even",
                settings.video.width, settings.video.height
            )));
        }
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = self.factory.create(output, &settings)?;
        let (commands, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shared = SessionShared::new();
        let gate = ForwardGate::new(settings.frame_rate);

        let session = EncoderSession::new(
            writer,
            settings.clone(),
            output.to_path_buf(),
            gate.clone(),
            shared.clone(),
            self.on_error.clone(),
            self.on_progress.clone(),
        );
        let thread = session.spawn(rx)?;

        tracing::info!(
            "Encoding started: {}x{} @ {}fps, {} bps, keyframe every {} frames, audio: {}, output: {:?}",
            settings.video.width,
            settings.video.height,
            settings.video.fps,
            settings.video.bitrate,
            settings.video.keyframe_interval,
            settings.audio.is_some(),
            output
        );

        self.shared = shared;
        self.active = Some(ActiveSession {
            sink: SampleSink::new(commands.clone()),
            commands,
            gate,
            settings,
            output: output.to_path_buf(),
            thread,
        });
        Ok(())
    }

    /// Sink for video producers
    pub fn video_sink(&self) -> Result<SampleSink, EncodingError> {
        self.active
            .as_ref()
            .map(|a| a.sink.clone())
            .ok_or(EncodingError::NotEncoding)
    }

    /// Sink for audio producers
    pub fn audio_sink(&self) -> Result<SampleSink, EncodingError> {
        let active = self.active.as_ref().ok_or(EncodingError::NotEncoding)?;
        if active.settings.audio.is_none() {
            return Err(EncodingError::CannotAddInput(
                "audio track not enabled for this session".to_string(),
            ));
        }
        Ok(active.sink.clone())
    }

    /// Pause/resume gate of the active session
    pub fn gate(&self) -> Option<ForwardGate> {
        self.active.as_ref().map(|a| a.gate.clone())
    }

    /// Queue a video frame; returns false if it was dropped
    pub fn append_video(&self, sample: FrameSample) -> bool {
        match self.active {
            Some(ref active) if !sample.kind.is_audio() => active.sink.push(sample),
            _ => false,
        }
    }

    /// Queue an audio buffer; returns false if it was dropped
    pub fn append_audio(&self, sample: FrameSample) -> bool {
        match self.active {
            Some(ref active) if sample.kind.is_audio() && active.settings.audio.is_some() => {
                active.sink.push(sample)
            }
            _ => false,
        }
    }

    /// Close inputs and finalize the container
    ///
    /// Expiry of [`FINALIZE_TIMEOUT`] is reported as `ConfigurationFailed`.
    pub async fn finish_encoding(&mut self) -> Result<OutputDescriptor, EncodingError> {
        let active = self.active.take().ok_or(EncodingError::NotEncoding)?;
        active.sink.close();

        let (reply, result) = oneshot::channel();
        active
            .commands
            .send(EncoderCommand::Finish(reply))
            .await
            .map_err(|_| EncodingError::WriterFailed("writer thread exited".to_string()))?;

        match tokio::time::timeout(FINALIZE_TIMEOUT, result).await {
            Ok(Ok(result)) => {
                let _ = tokio::task::spawn_blocking(move || active.thread.join()).await;
                result
            }
            Ok(Err(_)) => Err(EncodingError::WriterFailed("writer thread exited".to_string())),
            Err(_) => {
                tracing::error!("Finalize did not complete within {:?}", FINALIZE_TIMEOUT);
                // The writer thread discards whatever it produces once finalize returns
                self.shared.abandoned.store(true, Ordering::SeqCst);
                remove_output(&active.output);
                self.lingering = Some(active.thread);
                Err(EncodingError::ConfigurationFailed(format!(
                    "finalize timed out after {:?}",
                    FINALIZE_TIMEOUT
                )))
            }
        }
    }

    /// Discard the active session and its output
    pub async fn abort(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.sink.close();
        active.gate.close();

        if active.commands.send(EncoderCommand::Abort).await.is_ok() {
            let _ = tokio::task::spawn_blocking(move || active.thread.join()).await;
        }
        remove_output(&active.output);
    }

    /// Whether a timed-out writer thread is still finalizing
    pub fn has_lingering_writer(&mut self) -> bool {
        match self.lingering.take() {
            Some(thread) if thread.is_finished() => {
                let _ = thread.join();
                false
            }
            Some(thread) => {
                self.lingering = Some(thread);
                true
            }
            None => false,
        }
    }

    /// Whether a session is accepting samples
    pub fn is_encoding(&self) -> bool {
        self.active.is_some() && !self.shared.status.lock().is_failed()
    }

    /// Video frames written in the current or last session
    pub fn frames_written(&self) -> u64 {
        self.shared.frames.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WriterStatus {
        self.shared.status.lock().clone()
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.output.as_path())
    }
}

fn remove_output(output: &Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            tracing::warn!("Failed to remove partial output {:?}: {}", output, e);
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.sink.close();
            let _ = active.commands.try_send(EncoderCommand::Abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioBuffer, PixelBuffer, TrackKind};
    use crate::encoder::memory::{read_summary, MemoryWriterFactory};
    use parking_lot::Mutex;
    use tempfile::tempdir;

    fn frame(ms: u64) -> FrameSample {
        FrameSample::video(Duration::from_millis(ms), PixelBuffer::solid(16, 16, [1, 2, 3, 255]))
    }

    fn audio(ms: u64) -> FrameSample {
        FrameSample::audio(
            Duration::from_millis(ms),
            TrackKind::Microphone,
            AudioBuffer::new(48_000, 2, vec![0.0; 960]),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_anchor_is_first_video_frame() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let factory = MemoryWriterFactory::new();
        let handle = factory.handle();
        let mut encoder = Encoder::new(Arc::new(factory));
        encoder
            .start_encoding(&output, Resolution::Hd720, FrameRate::Fps30, true)
            .unwrap();

        // Audio before the first frame has nothing to anchor to
        assert!(encoder.append_audio(audio(900)));
        for i in 0..3 {
            assert!(encoder.append_video(frame(1000 + i * 33)));
            settle().await;
        }
        assert!(encoder.append_audio(audio(1010)));
        settle().await;

        let descriptor = encoder.finish_encoding().await.unwrap();
        assert_eq!(descriptor.frame_count, 3);
        assert!(descriptor.has_audio);

        assert_eq!(handle.anchor(), Some(Duration::from_millis(1000)));
        assert_eq!(
            handle.video_pts(),
            vec![Duration::ZERO, Duration::from_millis(33), Duration::from_millis(66)]
        );
        assert_eq!(handle.audio_pts(), vec![Duration::from_millis(10)]);

        let summary = read_summary(&output).unwrap();
        assert_eq!(summary.tracks.len(), 2);
    }

    #[tokio::test]
    async fn test_unready_track_drops_silently() {
        let dir = tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let handle = factory.handle();
        let errors = Arc::new(Mutex::new(0));
        let mut encoder = Encoder::new(Arc::new(factory));
        let counter = errors.clone();
        encoder.on_error(Arc::new(move |_| *counter.lock() += 1));
        encoder
            .start_encoding(&dir.path().join("out.mp4"), Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();

        encoder.append_video(frame(0));
        settle().await;
        handle.set_ready(false);
        encoder.append_video(frame(33));
        settle().await;
        handle.set_ready(true);
        encoder.append_video(frame(66));
        settle().await;

        let descriptor = encoder.finish_encoding().await.unwrap();
        assert_eq!(descriptor.frame_count, 2);
        assert_eq!(*errors.lock(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_timestamp_is_dropped() {
        let dir = tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let mut encoder = Encoder::new(Arc::new(factory));
        encoder
            .start_encoding(&dir.path().join("out.mp4"), Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();

        encoder.append_video(frame(0));
        encoder.append_video(frame(33));
        encoder.append_video(frame(33));
        settle().await;

        assert_eq!(encoder.finish_encoding().await.unwrap().frame_count, 2);
    }

    #[tokio::test]
    async fn test_append_after_failure_is_noop() {
        let dir = tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let handle = factory.handle();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut encoder = Encoder::new(Arc::new(factory));
        let sink = errors.clone();
        encoder.on_error(Arc::new(move |e| sink.lock().push(e.to_string())));
        encoder
            .start_encoding(&dir.path().join("out.mp4"), Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();

        encoder.append_video(frame(0));
        settle().await;
        handle.fail_with("disk full");
        encoder.append_video(frame(33));
        settle().await;
        let frames = encoder.frames_written();

        encoder.append_video(frame(66));
        encoder.append_video(frame(99));
        settle().await;

        assert_eq!(encoder.frames_written(), frames);
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("disk full"));
        assert!(encoder.status().is_failed());
        assert!(matches!(
            encoder.finish_encoding().await,
            Err(EncodingError::WriterFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_output_is_configuration_failure() {
        let dir = tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        factory.handle().write_empty_output(true);
        let mut encoder = Encoder::new(Arc::new(factory));
        encoder
            .start_encoding(&dir.path().join("out.mp4"), Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();
        encoder.append_video(frame(0));
        settle().await;

        assert!(matches!(
            encoder.finish_encoding().await,
            Err(EncodingError::ConfigurationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_without_video_fails() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let mut encoder = Encoder::new(Arc::new(MemoryWriterFactory::new()));
        encoder
            .start_encoding(&output, Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();
        assert!(matches!(
            encoder.finish_encoding().await,
            Err(EncodingError::ConfigurationFailed(_))
        ));
        assert!(!output.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_finalize_timeout_discards_output() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let factory = MemoryWriterFactory::new();
        factory.handle().set_finalize_delay(FINALIZE_TIMEOUT + Duration::from_millis(500));
        let mut encoder = Encoder::new(Arc::new(factory));
        encoder
            .start_encoding(&output, Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();
        encoder.append_video(frame(0));
        settle().await;

        let err = encoder.finish_encoding().await.unwrap_err();
        assert!(matches!(err, EncodingError::ConfigurationFailed(ref m) if m.contains("timed out")));
        assert!(!output.exists());
        assert!(encoder.has_lingering_writer());

        // The late finalize must not leave a container behind
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!output.exists());
        assert!(!encoder.has_lingering_writer());
        assert!(encoder.status().is_failed());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = tempdir().unwrap();
        let mut encoder = Encoder::new(Arc::new(MemoryWriterFactory::new()));
        encoder
            .start_encoding(&dir.path().join("a.mp4"), Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();
        assert!(matches!(
            encoder.start_encoding(&dir.path().join("b.mp4"), Resolution::Hd720, FrameRate::Fps30, false),
            Err(EncodingError::AlreadyEncoding)
        ));
        assert!(matches!(encoder.audio_sink(), Err(EncodingError::CannotAddInput(_))));
    }

    #[tokio::test]
    async fn test_abort_removes_output() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let mut encoder = Encoder::new(Arc::new(MemoryWriterFactory::new()));
        encoder
            .start_encoding(&output, Resolution::Hd720, FrameRate::Fps30, false)
            .unwrap();
        assert!(output.exists());

        encoder.abort().await;
        assert!(!output.exists());
        assert!(!encoder.is_encoding());
    }
}
