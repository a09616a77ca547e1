//! Media samples
//!
//! Values handed from producers (screen capture, audio taps) to the encoder.
//! Buffers are reference-counted and immutable, so a sample can be moved into
//! the encoder without copying and cannot be mutated after handoff.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Track a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackKind {
    Video,
    SystemAudio,
    Microphone,
}

impl TrackKind {
    pub fn is_audio(&self) -> bool {
        !matches!(self, TrackKind::Video)
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::SystemAudio => write!(f, "system-audio"),
            TrackKind::Microphone => write!(f, "microphone"),
        }
    }
}

/// Monotonic media clock shared by every producer of a session
///
/// Presentation timestamps are offsets from the clock origin. They never
/// come from wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    origin: Instant,
}

impl MediaClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Current media time
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Media time of an instant observed by a producer
    pub fn at(&self, instant: Instant) -> Duration {
        instant.saturating_duration_since(self.origin)
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

/// BGRA pixel buffer
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// Bytes per row (may include padding)
    pub stride: u32,
    data: Arc<[u8]>,
}

impl PixelBuffer {
    /// Create a tightly packed buffer
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self::with_stride(width, height, width * 4, data)
    }

    pub fn with_stride(width: u32, height: u32, stride: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride,
            data: data.into(),
        }
    }

    /// Buffer filled with a single BGRA color
    pub fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let data = bgra
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::new(width, height, data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the packed frame in bytes
    pub fn frame_size(&self) -> usize {
        (self.width * self.height * 4) as usize
    }

    /// Pixel rows without stride padding
    pub fn packed(&self) -> Cow<'_, [u8]> {
        let row = (self.width * 4) as usize;
        if self.stride as usize == row {
            let end = self.frame_size().min(self.data.len());
            return Cow::Borrowed(&self.data[..end]);
        }

        let mut out = Vec::with_capacity(self.frame_size());
        for y in 0..self.height as usize {
            let start = y * self.stride as usize;
            match self.data.get(start..start + row) {
                Some(line) => out.extend_from_slice(line),
                None => break,
            }
        }
        Cow::Owned(out)
    }

    /// Nearest-neighbour rescale to the given dimensions
    pub fn scaled(&self, width: u32, height: u32) -> PixelBuffer {
        if width == self.width && height == self.height {
            return self.clone();
        }

        let src = self.packed();
        let mut out = vec![0u8; (width * height * 4) as usize];
        if self.width == 0 || self.height == 0 {
            return PixelBuffer::new(width, height, out);
        }

        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as usize;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as usize;
                let s = (sy * self.width as usize + sx) * 4;
                let d = ((y * width + x) * 4) as usize;
                if let Some(px) = src.get(s..s + 4) {
                    out[d..d + 4].copy_from_slice(px);
                }
            }
        }

        PixelBuffer::new(width, height, out)
    }
}

/// Interleaved 32-bit float audio
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    samples: Arc<[f32]>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

/// Payload of a sample
#[derive(Debug, Clone)]
pub enum SampleBuffer {
    Pixels(PixelBuffer),
    Audio(AudioBuffer),
}

/// A timestamped sample on its way to the encoder
#[derive(Debug, Clone)]
pub struct FrameSample {
    /// Presentation timestamp in the media-clock domain
    pub pts: Duration,
    pub kind: TrackKind,
    pub buffer: SampleBuffer,
}

impl FrameSample {
    pub fn video(pts: Duration, pixels: PixelBuffer) -> Self {
        Self {
            pts,
            kind: TrackKind::Video,
            buffer: SampleBuffer::Pixels(pixels),
        }
    }

    pub fn audio(pts: Duration, kind: TrackKind, audio: AudioBuffer) -> Self {
        Self {
            pts,
            kind,
            buffer: SampleBuffer::Audio(audio),
        }
    }

    pub fn pixels(&self) -> Option<&PixelBuffer> {
        match &self.buffer {
            SampleBuffer::Pixels(p) => Some(p),
            SampleBuffer::Audio(_) => None,
        }
    }

    pub fn audio_buffer(&self) -> Option<&AudioBuffer> {
        match &self.buffer {
            SampleBuffer::Audio(a) => Some(a),
            SampleBuffer::Pixels(_) => None,
        }
    }
}
