//! Encoder session
//!
//! One session per `start_encoding`. The session owns the container writer
//! on a dedicated thread and consumes a single bounded queue, so video and
//! audio appends are serialized without locking the writer.

use super::gate::{Admission, ForwardGate};
use super::sink::EncoderCommand;
use super::types::{EncoderSettings, EncodingError, OutputDescriptor, Track, WriterStatus};
use super::writer::ContainerWriter;
use super::ProgressCallback;
use crate::capture::{FrameSample, TrackKind};
use crate::utils::ErrorCallback;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Wait for stragglers after the finish command before finalizing
const DRAIN_GRACE: Duration = Duration::from_millis(50);

/// State the encoder front-end reads while the session runs
#[derive(Clone)]
pub(crate) struct SessionShared {
    pub status: Arc<Mutex<WriterStatus>>,
    pub frames: Arc<AtomicU64>,
    /// Set when nobody waits for the finalize result any more
    pub abandoned: Arc<AtomicBool>,
}

impl SessionShared {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Mutex::new(WriterStatus::NotStarted)),
            frames: Arc::new(AtomicU64::new(0)),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub(crate) struct EncoderSession {
    writer: Box<dyn ContainerWriter>,
    settings: EncoderSettings,
    output: PathBuf,
    gate: ForwardGate,
    shared: SessionShared,
    on_error: Option<ErrorCallback<EncodingError>>,
    on_progress: Option<ProgressCallback>,
    /// Source timestamp of the first accepted video frame
    anchor: Option<Duration>,
    last_source_pts: HashMap<TrackKind, Duration>,
    last_output_pts: HashMap<Track, Duration>,
    dropped: u64,
    failure_reported: bool,
}

impl EncoderSession {
    pub fn new(
        writer: Box<dyn ContainerWriter>,
        settings: EncoderSettings,
        output: PathBuf,
        gate: ForwardGate,
        shared: SessionShared,
        on_error: Option<ErrorCallback<EncodingError>>,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            writer,
            settings,
            output,
            gate,
            shared,
            on_error,
            on_progress,
            anchor: None,
            last_source_pts: HashMap::new(),
            last_output_pts: HashMap::new(),
            dropped: 0,
            failure_reported: false,
        }
    }

    /// Run the session on a dedicated thread
    pub fn spawn(
        self,
        rx: mpsc::Receiver<EncoderCommand>,
    ) -> Result<std::thread::JoinHandle<()>, EncodingError> {
        std::thread::Builder::new()
            .name("encoder-writer".to_string())
            .spawn(move || self.run(rx))
            .map_err(EncodingError::Io)
    }

    fn run(mut self, mut rx: mpsc::Receiver<EncoderCommand>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                EncoderCommand::Sample(sample) => self.handle_sample(sample),
                EncoderCommand::Finish(reply) => {
                    self.finish(&mut rx, reply);
                    return;
                }
                EncoderCommand::Abort => {
                    self.abort();
                    return;
                }
            }
        }

        // Every sender is gone without a finish
        tracing::warn!("Encoder queue closed without finish, discarding output");
        self.abort();
    }

    fn status(&self) -> WriterStatus {
        self.shared.status.lock().clone()
    }

    fn set_status(&self, status: WriterStatus) {
        *self.shared.status.lock() = status;
    }

    fn drop_sample(&mut self, sample: &FrameSample, reason: &str) {
        self.dropped += 1;
        if self.dropped == 1 || self.dropped % 100 == 0 {
            tracing::debug!(
                "Dropped {} sample at {:?}: {} ({} dropped)",
                sample.kind,
                sample.pts,
                reason,
                self.dropped
            );
        }
    }

    fn handle_sample(&mut self, sample: FrameSample) {
        if matches!(self.status(), WriterStatus::Failed(_) | WriterStatus::Finished) {
            return;
        }

        let track = if sample.kind.is_audio() {
            if self.settings.audio.is_none() {
                return self.drop_sample(&sample, "audio disabled");
            }
            Track::Audio
        } else {
            Track::Video
        };

        if let Some(&last) = self.last_source_pts.get(&sample.kind) {
            if sample.pts <= last {
                return self.drop_sample(&sample, "duplicate or regressing timestamp");
            }
        }
        self.last_source_pts.insert(sample.kind, sample.pts);

        if !self.writer.is_ready(track) {
            return self.drop_sample(&sample, "track not ready");
        }

        let anchor = match (self.anchor, track) {
            (Some(anchor), _) => anchor,
            (None, Track::Video) => {
                if let Err(e) = self.writer.start_session(sample.pts) {
                    return self.fail(e);
                }
                tracing::info!("Write session opened at anchor {:?}", sample.pts);
                self.anchor = Some(sample.pts);
                self.set_status(WriterStatus::Writing);
                sample.pts
            }
            (None, Track::Audio) => return self.drop_sample(&sample, "before anchor"),
        };

        let Some(rel) = sample.pts.checked_sub(anchor) else {
            return self.drop_sample(&sample, "before anchor");
        };

        let admission = match track {
            Track::Video => self.gate.admit_video(rel),
            Track::Audio => self.gate.admit_audio(rel),
        };
        let Admission::Forward(out) = admission else {
            return self.drop_sample(&sample, "paused");
        };

        if let Some(&last) = self.last_output_pts.get(&track) {
            if out <= last {
                return self.drop_sample(&sample, "output timestamp would regress");
            }
        }

        if let Err(e) = self.writer.append(track, out, &sample.buffer) {
            return self.fail(e);
        }
        if let WriterStatus::Failed(reason) = self.writer.status() {
            return self.fail(EncodingError::WriterFailed(reason));
        }
        self.last_output_pts.insert(track, out);

        if track == Track::Video {
            let frames = self.shared.frames.fetch_add(1, Ordering::SeqCst) + 1;
            if frames % self.settings.frame_rate.fps() as u64 == 0 {
                if let Some(ref on_progress) = self.on_progress {
                    on_progress(frames);
                }
            }
        }
    }

    /// Enter `Failed` and report once
    fn fail(&mut self, error: EncodingError) {
        let reason = match error {
            EncodingError::WriterFailed(reason) => reason,
            other => other.to_string(),
        };
        tracing::error!("Container writer failed: {}", reason);
        self.set_status(WriterStatus::Failed(reason.clone()));

        if !self.failure_reported {
            self.failure_reported = true;
            if let Some(ref on_error) = self.on_error {
                on_error(EncodingError::WriterFailed(reason));
            }
        }
    }

    fn drain(&mut self, rx: &mut mpsc::Receiver<EncoderCommand>) {
        let deadline = Instant::now() + DRAIN_GRACE;
        loop {
            match rx.try_recv() {
                Ok(EncoderCommand::Sample(sample)) => self.handle_sample(sample),
                Ok(EncoderCommand::Finish(reply)) => {
                    let _ = reply.send(Err(EncodingError::NotEncoding));
                }
                Ok(EncoderCommand::Abort) => {}
                Err(mpsc::error::TryRecvError::Empty) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => break,
            }
        }
    }

    fn finish(
        &mut self,
        rx: &mut mpsc::Receiver<EncoderCommand>,
        reply: oneshot::Sender<Result<OutputDescriptor, EncodingError>>,
    ) {
        self.drain(rx);
        let result = self.finalize();
        if self.shared.abandoned.load(Ordering::SeqCst) {
            tracing::warn!("Finalize completed after the caller gave up, discarding output");
            self.abort();
        } else if result.is_err() {
            self.writer.abort();
        }
        if reply.send(result).is_err() {
            tracing::warn!("Finish requested but nobody is waiting for the result");
        }
    }

    fn finalize(&mut self) -> Result<OutputDescriptor, EncodingError> {
        if let WriterStatus::Failed(reason) = self.status() {
            return Err(EncodingError::WriterFailed(reason));
        }
        let Some(last_video) = self.last_output_pts.get(&Track::Video).copied() else {
            self.set_status(WriterStatus::Failed("no video frames".to_string()));
            return Err(EncodingError::ConfigurationFailed(
                "no video frames were written".to_string(),
            ));
        };

        self.writer.mark_inputs_finished();
        if let Err(e) = self.writer.finalize() {
            self.set_status(WriterStatus::Failed(e.to_string()));
            return Err(e);
        }

        let size = std::fs::metadata(&self.output).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            self.set_status(WriterStatus::Failed("empty output".to_string()));
            return Err(EncodingError::ConfigurationFailed(format!(
                "output file {:?} is missing or empty",
                self.output
            )));
        }

        self.set_status(WriterStatus::Finished);
        let duration = last_video + self.settings.frame_rate.frame_duration();
        let descriptor = OutputDescriptor {
            path: self.output.clone(),
            duration_ms: (duration.as_secs_f64() * 1000.0).round() as u64,
            frame_count: self.shared.frames.load(Ordering::SeqCst),
            has_audio: self.settings.audio.is_some(),
        };

        tracing::info!(
            "Encoding finished: {} frames, {}ms, {} bytes, {} samples dropped, output: {:?}",
            descriptor.frame_count,
            descriptor.duration_ms,
            size,
            self.dropped,
            descriptor.path
        );
        Ok(descriptor)
    }

    fn abort(&mut self) {
        self.writer.abort();
        if !self.status().is_failed() {
            self.set_status(WriterStatus::Failed("aborted".to_string()));
        }
        tracing::info!("Encoding aborted, output discarded");
    }
}
