//! Synthetic capture source
//!
//! Produces a test pattern at a fixed frame interval with deterministic
//! presentation timestamps. Used by tests and headless environments.

use super::frame::{FrameSample, MediaClock, PixelBuffer};
use super::region::plan_stream;
use super::traits::{
    CaptureError, CaptureRequest, CaptureResult, CaptureSource, CaptureStats, DisplayInfo,
    StreamHandle,
};
use crate::encoder::SampleSink;
use crate::utils::ErrorCallback;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const CURSOR_SIZE: u32 = 12;

struct Wiring {
    stream: StreamHandle,
    clock: MediaClock,
    sink: SampleSink,
    on_error: ErrorCallback<CaptureError>,
}

/// Test-pattern capture source
pub struct SyntheticCaptureSource {
    id: String,
    display: DisplayInfo,
    frame_interval: Option<Duration>,
    frame_limit: Option<u64>,
    fail_after: Option<u64>,
    permission_denied: bool,
    wiring: Option<Wiring>,
    running: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    last_pts: Arc<Mutex<Option<Duration>>>,
    task: Option<JoinHandle<()>>,
}

impl SyntheticCaptureSource {
    pub fn new(display: DisplayInfo) -> Self {
        Self {
            id: format!("synthetic-{}", display.id),
            display,
            frame_interval: None,
            frame_limit: None,
            fail_after: None,
            permission_denied: false,
            wiring: None,
            running: Arc::new(AtomicBool::new(false)),
            delivered: Arc::new(AtomicU64::new(0)),
            last_pts: Arc::new(Mutex::new(None)),
            task: None,
        }
    }

    /// Override the spacing between frames (defaults to the stream frame rate)
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Stop producing after this many frames
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Terminate the stream through the error callback after this many frames
    pub fn fail_after_frames(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Refuse configuration as if screen recording were not authorized
    pub fn deny_permission(mut self) -> Self {
        self.permission_denied = true;
        self
    }

    /// Frames delivered since the last start
    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticCaptureSource {
    fn default() -> Self {
        Self::new(DisplayInfo::fallback())
    }
}

/// Vertical color bars, shifted per phase so consecutive frames differ
fn pattern(width: u32, height: u32, phase: u32, cursor: bool) -> PixelBuffer {
    const BARS: [[u8; 4]; 4] = [
        [255, 255, 255, 255],
        [0, 255, 255, 255],
        [255, 255, 0, 255],
        [0, 0, 255, 255],
    ];

    let bar_width = (width / BARS.len() as u32).max(1);
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let bar = ((x / bar_width + phase) as usize) % BARS.len();
            let in_cursor = cursor && x < CURSOR_SIZE && y < CURSOR_SIZE && x <= y;
            if in_cursor {
                data.extend_from_slice(&[0, 0, 0, 255]);
            } else {
                data.extend_from_slice(&BARS[bar]);
            }
        }
    }
    PixelBuffer::new(width, height, data)
}

#[async_trait]
impl CaptureSource for SyntheticCaptureSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn display(&self) -> &DisplayInfo {
        &self.display
    }

    fn configure(
        &mut self,
        request: &CaptureRequest,
        clock: MediaClock,
        sink: SampleSink,
        on_error: ErrorCallback<CaptureError>,
    ) -> CaptureResult<StreamHandle> {
        if self.permission_denied {
            return Err(CaptureError::PermissionDenied);
        }
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyCapturing);
        }

        let stream = plan_stream(&self.display, request);
        tracing::debug!(
            "Synthetic capture configured: {}x{} @ {}fps",
            stream.output_width,
            stream.output_height,
            stream.frame_rate.fps()
        );

        self.wiring = Some(Wiring {
            stream: stream.clone(),
            clock,
            sink,
            on_error,
        });
        Ok(stream)
    }

    async fn start(&mut self) -> CaptureResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyCapturing);
        }
        let wiring = self
            .wiring
            .as_ref()
            .ok_or_else(|| CaptureError::ConfigurationFailed("stream not configured".to_string()))?;

        let (width, height) = (wiring.stream.output_width, wiring.stream.output_height);
        let cursor = wiring.stream.show_cursor;
        let frames = [pattern(width, height, 0, cursor), pattern(width, height, 1, cursor)];
        let interval = self
            .frame_interval
            .unwrap_or_else(|| wiring.stream.frame_rate.frame_duration());

        self.running.store(true, Ordering::SeqCst);
        self.delivered.store(0, Ordering::SeqCst);

        let running = self.running.clone();
        let delivered = self.delivered.clone();
        let last_pts = self.last_pts.clone();
        let clock = wiring.clock;
        let sink = wiring.sink.clone();
        let on_error = wiring.on_error.clone();
        let frame_limit = self.frame_limit;
        let fail_after = self.fail_after;

        let task = tokio::spawn(async move {
            let base = clock.now();
            let mut ticker = tokio::time::interval(interval);
            let mut index = 0u64;

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if frame_limit.is_some_and(|limit| index >= limit) {
                    break;
                }
                if fail_after.is_some_and(|limit| index >= limit) {
                    tracing::error!("Synthetic capture stream terminated after {} frames", index);
                    running.store(false, Ordering::SeqCst);
                    on_error(CaptureError::StreamTerminated(
                        "synthetic stream failure".to_string(),
                    ));
                    break;
                }

                let pts = base + interval * index as u32;
                let frame = frames[(index / 15 % 2) as usize].clone();
                sink.push(FrameSample::video(pts, frame));
                *last_pts.lock() = Some(pts);
                delivered.fetch_add(1, Ordering::SeqCst);
                index += 1;
            }
        });

        self.task = Some(task);
        tracing::info!("Synthetic capture started for display {}", self.display.id);
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<CaptureStats> {
        let Some(task) = self.task.take() else {
            return Err(CaptureError::NotCapturing);
        };

        self.running.store(false, Ordering::SeqCst);
        task.abort();
        let _ = task.await;

        let stats = CaptureStats {
            frames_delivered: self.delivered.load(Ordering::SeqCst),
            frames_dropped: self.wiring.as_ref().map(|w| w.sink.dropped()).unwrap_or(0),
            last_pts: *self.last_pts.lock(),
        };
        tracing::info!(
            "Synthetic capture stopped. Delivered {} frames",
            stats.frames_delivered
        );
        Ok(stats)
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{FrameRate, Resolution};

    fn request() -> CaptureRequest {
        CaptureRequest {
            region: None,
            resolution: Resolution::Hd720,
            frame_rate: FrameRate::Fps30,
            show_cursor: true,
        }
    }

    #[tokio::test]
    async fn test_frames_have_fixed_spacing() {
        let mut source = SyntheticCaptureSource::default()
            .with_frame_interval(Duration::from_millis(5))
            .with_frame_limit(4);
        let (sink, mut rx) = SampleSink::channel(16);
        source
            .configure(&request(), MediaClock::new(), sink, Arc::new(|_| {}))
            .unwrap();
        source.start().await.unwrap();

        let mut pts = Vec::new();
        for _ in 0..4 {
            pts.push(rx.recv().await.unwrap().pts);
        }
        let stats = source.stop().await.unwrap();

        assert_eq!(stats.frames_delivered, 4);
        for pair in pts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn test_stream_failure_goes_through_callback() {
        let mut source = SyntheticCaptureSource::default()
            .with_frame_interval(Duration::from_millis(2))
            .fail_after_frames(3);
        let (sink, _rx) = SampleSink::channel(16);
        let (tx, mut errors) = tokio::sync::mpsc::unbounded_channel();
        source
            .configure(
                &request(),
                MediaClock::new(),
                sink,
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();

        assert!(source.start().await.is_ok());
        let err = errors.recv().await.unwrap();
        assert!(matches!(err, CaptureError::StreamTerminated(_)));
        assert_eq!(source.stop().await.unwrap().frames_delivered, 3);
    }

    #[tokio::test]
    async fn test_denied_permission_fails_configure() {
        let mut source = SyntheticCaptureSource::default().deny_permission();
        let (sink, _rx) = SampleSink::channel(1);
        let result = source.configure(&request(), MediaClock::new(), sink, Arc::new(|_| {}));
        assert_eq!(result.unwrap_err(), CaptureError::PermissionDenied);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_not_capturing() {
        let mut source = SyntheticCaptureSource::default();
        assert_eq!(source.stop().await.unwrap_err(), CaptureError::NotCapturing);
    }

    #[test]
    fn test_cursor_marker_is_drawn() {
        let frame = pattern(64, 64, 0, true);
        assert_eq!(&frame.data()[0..4], &[0, 0, 0, 255]);
        let plain = pattern(64, 64, 0, false);
        assert_eq!(&plain.data()[0..4], &[255, 255, 255, 255]);
    }
}
