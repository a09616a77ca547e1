//! Polling screen capture
//!
//! Drives a platform [`FrameGrabber`] at the configured frame rate on a
//! dedicated thread and pushes the scaled frames into the encoder sink.

use super::frame::{FrameSample, MediaClock};
use super::region::plan_stream;
use super::traits::{
    CaptureError, CaptureRequest, CaptureResult, CaptureSource, CaptureStats, DisplayInfo,
    StreamHandle,
};
use super::PixelBuffer;
use crate::encoder::SampleSink;
use crate::utils::ErrorCallback;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Consecutive grab failures tolerated before the stream is declared dead
const MAX_GRAB_FAILURES: u32 = 30;

/// Grabs one frame of a display region
pub trait FrameGrabber: Send + 'static {
    /// Prepare for grabbing the configured stream
    ///
    /// Fails with `PermissionDenied` when the platform refuses capture.
    fn open(&mut self, stream: &StreamHandle) -> CaptureResult<()>;

    /// Grab the current contents of the configured region
    fn grab(&mut self) -> CaptureResult<PixelBuffer>;
}

struct Wiring {
    stream: StreamHandle,
    clock: MediaClock,
    sink: SampleSink,
    on_error: ErrorCallback<CaptureError>,
}

/// Capture source backed by a polling grabber
pub struct ScreenCaptureSource<G: FrameGrabber> {
    id: String,
    display: DisplayInfo,
    grabber: Arc<Mutex<G>>,
    wiring: Option<Wiring>,
    running: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    last_pts: Arc<Mutex<Option<Duration>>>,
    worker: Option<JoinHandle<()>>,
}

impl<G: FrameGrabber> ScreenCaptureSource<G> {
    pub fn new(display: DisplayInfo, grabber: G) -> Self {
        Self {
            id: format!("display-{}", display.id),
            display,
            grabber: Arc::new(Mutex::new(grabber)),
            wiring: None,
            running: Arc::new(AtomicBool::new(false)),
            delivered: Arc::new(AtomicU64::new(0)),
            last_pts: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }
}

#[async_trait]
impl<G: FrameGrabber> CaptureSource for ScreenCaptureSource<G> {
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
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::AlreadyCapturing);
        }
        let stream = plan_stream(&self.display, request);
        self.grabber.lock().open(&stream)?;

        tracing::info!(
            "Display capture configured for display {} ({}x{} -> {}x{} @ {}fps)",
            self.display.id,
            stream.region.width,
            stream.region.height,
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

        self.running.store(true, Ordering::SeqCst);
        self.delivered.store(0, Ordering::SeqCst);

        let running = self.running.clone();
        let delivered = self.delivered.clone();
        let last_pts = self.last_pts.clone();
        let grabber = self.grabber.clone();
        let clock = wiring.clock;
        let sink = wiring.sink.clone();
        let on_error = wiring.on_error.clone();
        let (width, height) = (wiring.stream.output_width, wiring.stream.output_height);
        let interval = wiring.stream.frame_rate.frame_duration();

        let worker = std::thread::Builder::new()
            .name(format!("{}-capture", self.id))
            .spawn(move || {
                let mut failures = 0u32;

                while running.load(Ordering::SeqCst) {
                    let tick = Instant::now();

                    match grabber.lock().grab() {
                        Ok(frame) => {
                            failures = 0;
                            let pts = clock.at(tick);
                            sink.push(FrameSample::video(pts, frame.scaled(width, height)));
                            delivered.fetch_add(1, Ordering::Relaxed);
                            *last_pts.lock() = Some(pts);
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::debug!("Frame grab failed ({}): {}", failures, e);
                            if failures >= MAX_GRAB_FAILURES {
                                tracing::error!("Display capture lost after {} failed grabs", failures);
                                running.store(false, Ordering::SeqCst);
                                on_error(CaptureError::StreamTerminated(e.to_string()));
                                break;
                            }
                        }
                    }

                    let elapsed = tick.elapsed();
                    if elapsed < interval {
                        std::thread::sleep(interval - elapsed);
                    }
                }
            })
            .map_err(|e| CaptureError::ConfigurationFailed(format!("capture thread: {}", e)))?;

        self.worker = Some(worker);
        tracing::info!("Display capture started for display {}", self.display.id);
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<CaptureStats> {
        let Some(worker) = self.worker.take() else {
            return Err(CaptureError::NotCapturing);
        };

        self.running.store(false, Ordering::SeqCst);
        let _ = tokio::task::spawn_blocking(move || worker.join()).await;

        let stats = CaptureStats {
            frames_delivered: self.delivered.load(Ordering::SeqCst),
            frames_dropped: self.wiring.as_ref().map(|w| w.sink.dropped()).unwrap_or(0),
            last_pts: *self.last_pts.lock(),
        };

        tracing::info!(
            "Display capture stopped. Delivered {} frames",
            stats.frames_delivered
        );
        Ok(stats)
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl<G: FrameGrabber> Drop for ScreenCaptureSource<G> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
