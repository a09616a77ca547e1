//! FFmpeg container writer
//!
//! Video is piped as raw BGRA to an `ffmpeg` child encoding H.264 at a
//! constant frame rate. Audio is spooled as interleaved f32le PCM and muxed
//! into an AAC track when the container is finalized.

use super::types::{EncoderSettings, EncodingError, Track, WriterStatus};
use super::writer::{ContainerWriter, WriterFactory};
use crate::capture::{AudioBuffer, PixelBuffer, SampleBuffer};
use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Frames queued between the writer and ffmpeg's stdin
const FEED_CAPACITY: usize = 4;

/// Longest audio gap filled with silence
const MAX_SILENCE_SECS: u64 = 2;

/// Creates [`FfmpegWriter`]s
pub struct FfmpegWriterFactory {
    binary: PathBuf,
}

impl FfmpegWriterFactory {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }

    /// Use a specific ffmpeg binary
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Check that ffmpeg can be executed
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

impl Default for FfmpegWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn create(
        &self,
        output: &Path,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn ContainerWriter>, EncodingError> {
        if !self.is_available() {
            return Err(EncodingError::ConfigurationFailed(
                "FFmpeg not found. Please install FFmpeg and add it to PATH.".to_string(),
            ));
        }
        Ok(Box::new(FfmpegWriter::spawn(&self.binary, output, settings)?))
    }
}

/// Constant-frame-rate slot of a session-relative timestamp
fn slot_for(pts: Duration, fps: u32) -> u64 {
    (pts.as_secs_f64() * fps as f64).round() as u64
}

/// Copies of the previous frame to send before the frame for `slot`
///
/// Every slot gets exactly one frame, however long the gap, so ffmpeg's frame
/// index `n` stays equal to the slot the forwarding gate places GOP
/// boundaries on. `None` when the slot was already filled.
fn repeats_before(next_slot: u64, slot: u64) -> Option<u64> {
    slot.checked_sub(next_slot)
}

/// Arguments for the H.264 encoding child
fn video_args(settings: &EncoderSettings, target: &Path) -> Vec<String> {
    let video = &settings.video;
    let gop = video.keyframe_interval.to_string();

    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pixel_format".to_string(),
        "bgra".to_string(),
        "-video_size".to_string(),
        format!("{}x{}", video.width, video.height),
        "-framerate".to_string(),
        video.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-b:v".to_string(),
        video.bitrate.to_string(),
        "-maxrate".to_string(),
        video.bitrate.to_string(),
        "-bufsize".to_string(),
        (video.bitrate * 2).to_string(),
        "-g".to_string(),
        gop.clone(),
        "-keyint_min".to_string(),
        gop.clone(),
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-force_key_frames".to_string(),
        format!("expr:eq(mod(n,{}),0)", gop),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        target.to_string_lossy().to_string(),
    ]
}

/// Arguments for muxing the encoded video with the spooled PCM
fn mux_args(settings: &EncoderSettings, video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    let Some(ref audio_settings) = settings.audio else {
        return Vec::new();
    };

    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-f".to_string(),
        "f32le".to_string(),
        "-ar".to_string(),
        audio_settings.sample_rate.to_string(),
        "-ac".to_string(),
        audio_settings.channels.to_string(),
        "-i".to_string(),
        audio.to_string_lossy().to_string(),
        "-map".to_string(),
        "0:v".to_string(),
        "-map".to_string(),
        "1:a".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        format!("{}k", audio_settings.bitrate / 1000),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// PCM spool placed on the audio timeline by timestamp
struct AudioSpool {
    file: BufWriter<NamedTempFile>,
    sample_rate: u32,
    channels: u16,
    frames: u64,
}

impl AudioSpool {
    /// Frames to skip from the head of a buffer and silence to insert before it
    fn placement(&self, pts: Duration) -> (u64, u64) {
        let expected = (pts.as_secs_f64() * self.sample_rate as f64).round() as u64;
        if expected >= self.frames {
            let silence = (expected - self.frames).min(MAX_SILENCE_SECS * self.sample_rate as u64);
            (0, silence)
        } else {
            (self.frames - expected, 0)
        }
    }

    fn write(&mut self, pts: Duration, buffer: &AudioBuffer) -> Result<(), EncodingError> {
        if buffer.sample_rate != self.sample_rate || buffer.channels != self.channels {
            return Err(EncodingError::UnsupportedSettings(format!(
                "audio must be {}Hz/{}ch, got {}Hz/{}ch",
                self.sample_rate, self.channels, buffer.sample_rate, buffer.channels
            )));
        }

        let (skip, silence) = self.placement(pts);
        let channels = self.channels as usize;

        for _ in 0..silence * channels as u64 {
            self.file.write_all(&0f32.to_le_bytes())?;
        }
        self.frames += silence;

        let skip = (skip as usize).min(buffer.frames());
        for sample in &buffer.samples()[skip * channels..] {
            self.file.write_all(&sample.to_le_bytes())?;
        }
        self.frames += (buffer.frames() - skip) as u64;
        Ok(())
    }
}

/// H.264/AAC MP4 writer backed by ffmpeg
pub struct FfmpegWriter {
    binary: PathBuf,
    settings: EncoderSettings,
    output: PathBuf,
    status: WriterStatus,
    child: Option<Child>,
    feed: Option<SyncSender<PixelBuffer>>,
    feeder: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
    feed_error: Arc<Mutex<Option<String>>>,
    /// Video-only intermediate when an audio track is muxed in afterwards
    video_tmp: Option<NamedTempFile>,
    audio: Option<AudioSpool>,
    next_slot: u64,
    last_frame: Option<PixelBuffer>,
}

impl FfmpegWriter {
    fn spawn(binary: &Path, output: &Path, settings: &EncoderSettings) -> Result<Self, EncodingError> {
        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let (video_tmp, audio) = match settings.audio {
            Some(ref audio) => {
                let video_tmp = tempfile::Builder::new()
                    .prefix(".rec-video-")
                    .suffix(".mp4")
                    .tempfile_in(dir)?;
                let pcm = tempfile::Builder::new()
                    .prefix(".rec-audio-")
                    .suffix(".pcm")
                    .tempfile_in(dir)?;
                let spool = AudioSpool {
                    file: BufWriter::new(pcm),
                    sample_rate: audio.sample_rate,
                    channels: audio.channels,
                    frames: 0,
                };
                (Some(video_tmp), Some(spool))
            }
            None => (None, None),
        };

        let target = video_tmp
            .as_ref()
            .map(|t| t.path().to_path_buf())
            .unwrap_or_else(|| output.to_path_buf());

        let mut child = Command::new(binary)
            .args(video_args(settings, &target))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncodingError::ConfigurationFailed(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncodingError::ConfigurationFailed("Failed to capture FFmpeg stdin".to_string()))?;

        let pending = Arc::new(AtomicUsize::new(0));
        let feed_error = Arc::new(Mutex::new(None));
        let (feed, frames) = sync_channel::<PixelBuffer>(FEED_CAPACITY);
        let feeder = spawn_feeder(stdin, frames, pending.clone(), feed_error.clone())?;

        tracing::info!(
            "Started FFmpeg encoder: {}x{} @ {}fps, output: {:?}",
            settings.video.width,
            settings.video.height,
            settings.video.fps,
            output
        );

        Ok(Self {
            binary: binary.to_path_buf(),
            settings: settings.clone(),
            output: output.to_path_buf(),
            status: WriterStatus::NotStarted,
            child: Some(child),
            feed: Some(feed),
            feeder: Some(feeder),
            pending,
            feed_error,
            video_tmp,
            audio,
            next_slot: 0,
            last_frame: None,
        })
    }

    fn send_frame(&mut self, frame: PixelBuffer) -> Result<(), EncodingError> {
        let feed = self.feed.as_ref().ok_or(EncodingError::NotEncoding)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        feed.send(frame).map_err(|_| {
            let reason = self
                .feed_error
                .lock()
                .clone()
                .unwrap_or_else(|| "FFmpeg input closed".to_string());
            EncodingError::WriterFailed(reason)
        })
    }

    fn append_video(&mut self, pts: Duration, pixels: &PixelBuffer) -> Result<(), EncodingError> {
        let slot = slot_for(pts, self.settings.video.fps);
        let Some(gap) = repeats_before(self.next_slot, slot) else {
            // Ahead of the constant-rate timeline
            return Ok(());
        };

        let (width, height) = (self.settings.video.width, self.settings.video.height);
        let frame = pixels.scaled(width, height);

        if gap > 0 {
            if let Some(previous) = self.last_frame.clone() {
                for _ in 0..gap {
                    self.send_frame(previous.clone())?;
                }
            }
        }

        self.send_frame(frame.clone())?;
        self.last_frame = Some(frame);
        self.next_slot = slot + 1;
        Ok(())
    }

    fn run_mux(&mut self) -> Result<(), EncodingError> {
        let (Some(video_tmp), Some(spool)) = (self.video_tmp.as_ref(), self.audio.take()) else {
            return Ok(());
        };

        let pcm = spool
            .file
            .into_inner()
            .map_err(|e| EncodingError::Io(e.into_error()))?;

        let output = Command::new(&self.binary)
            .args(mux_args(&self.settings, video_tmp.path(), pcm.path(), &self.output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| EncodingError::WriterFailed(format!("Failed to start FFmpeg mux: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncodingError::WriterFailed(format!("FFmpeg mux failed: {}", stderr.trim())));
        }
        Ok(())
    }
}

fn spawn_feeder(
    mut stdin: ChildStdin,
    frames: std::sync::mpsc::Receiver<PixelBuffer>,
    pending: Arc<AtomicUsize>,
    feed_error: Arc<Mutex<Option<String>>>,
) -> Result<JoinHandle<()>, EncodingError> {
    std::thread::Builder::new()
        .name("ffmpeg-feeder".to_string())
        .spawn(move || {
            for frame in frames {
                let result = stdin.write_all(&frame.packed());
                pending.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = result {
                    tracing::error!("Failed to write frame to FFmpeg: {}", e);
                    *feed_error.lock() = Some(format!("Failed to write frame: {}", e));
                    return;
                }
            }
            // Dropping stdin signals EOF to ffmpeg
        })
        .map_err(EncodingError::Io)
}

impl ContainerWriter for FfmpegWriter {
    fn status(&self) -> WriterStatus {
        if let Some(reason) = self.feed_error.lock().clone() {
            return WriterStatus::Failed(reason);
        }
        self.status.clone()
    }

    fn is_ready(&self, track: Track) -> bool {
        match track {
            Track::Video => self.feed.is_some() && self.pending.load(Ordering::SeqCst) < FEED_CAPACITY,
            Track::Audio => self.audio.is_some(),
        }
    }

    fn start_session(&mut self, _anchor: Duration) -> Result<(), EncodingError> {
        if self.status != WriterStatus::NotStarted {
            return Err(EncodingError::WriterFailed("session already started".to_string()));
        }
        self.status = WriterStatus::Writing;
        Ok(())
    }

    fn append(&mut self, track: Track, pts: Duration, buffer: &SampleBuffer) -> Result<(), EncodingError> {
        let result = match (track, buffer) {
            (Track::Video, SampleBuffer::Pixels(pixels)) => self.append_video(pts, pixels),
            (Track::Audio, SampleBuffer::Audio(audio)) => match self.audio.as_mut() {
                Some(spool) => spool.write(pts, audio),
                None => Err(EncodingError::CannotAddInput("no audio track".to_string())),
            },
            _ => Err(EncodingError::UnsupportedSettings(format!(
                "{:?} track cannot take this buffer",
                track
            ))),
        };

        if let Err(ref e) = result {
            self.status = WriterStatus::Failed(e.to_string());
        }
        result
    }

    fn mark_inputs_finished(&mut self) {
        self.feed = None;
    }

    fn finalize(&mut self) -> Result<(), EncodingError> {
        self.feed = None;
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }

        let child = self.child.take().ok_or(EncodingError::NotEncoding)?;
        let output = child
            .wait_with_output()
            .map_err(|e| EncodingError::WriterFailed(format!("Failed to wait for FFmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = format!("FFmpeg exited with {}: {}", output.status, stderr.trim());
            self.status = WriterStatus::Failed(reason.clone());
            return Err(EncodingError::WriterFailed(reason));
        }

        if let Err(e) = self.run_mux() {
            self.status = WriterStatus::Failed(e.to_string());
            return Err(e);
        }

        self.status = WriterStatus::Finished;
        tracing::info!("FFmpeg finished, output: {:?}", self.output);
        Ok(())
    }

    fn abort(&mut self) {
        self.feed = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        self.audio = None;
        self.video_tmp = None;
        if self.output.exists() {
            let _ = std::fs::remove_file(&self.output);
        }
        self.status = WriterStatus::Failed("aborted".to_string());
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        self.feed = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
