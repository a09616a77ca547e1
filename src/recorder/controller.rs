//! Recording controller
//!
//! Owns the recording lifecycle: configures capture, audio and the encoder
//! for one session at a time, drives pause/resume through the encoder's
//! forwarding gate, and finalizes the container on stop. Failures reported
//! asynchronously by subsystems are queued as faults, tagged with the
//! session they belong to, and applied by [`RecordingController::poll_faults`]
//! (or by [`supervise`]).

use super::permissions::{PermissionService, StaticPermissions, SystemPermissions};
use super::state::{RecordingConfig, RecordingSegment, RecordingSession, RecordingState};
use crate::audio::{
    AudioError, AudioLevels, AudioPath, AudioSource, CpalTapFactory, SyntheticTapFactory, TapFactory,
};
use crate::capture::region::plan_stream;
use crate::capture::{
    default_capture_source, CaptureError, CaptureRequest, CaptureSource, MediaClock,
    SyntheticCaptureSource,
};
use crate::encoder::{
    EncoderSettings, Encoder, EncodingError, FfmpegWriterFactory, MemoryWriterFactory, OutputDescriptor,
    WriterFactory,
};
use crate::utils::error::{ErrorResponse, RecorderError, RecorderResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Events emitted during recording
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum RecordingEvent {
    Started,
    /// Video frames written so far
    Progress { frame_count: u64 },
    Paused,
    Resumed,
    Finished(OutputDescriptor),
    Error(ErrorResponse),
}

/// Collaborators injected into the controller
pub struct RecorderServices {
    pub capture: Box<dyn CaptureSource>,
    pub taps: Arc<dyn TapFactory>,
    pub writers: Arc<dyn WriterFactory>,
    pub permissions: Arc<dyn PermissionService>,
}

impl RecorderServices {
    /// Platform capture, cpal audio and the ffmpeg writer
    pub fn system(display_id: Option<u32>) -> RecorderResult<Self> {
        Ok(Self {
            capture: default_capture_source(display_id)?,
            taps: Arc::new(CpalTapFactory),
            writers: Arc::new(FfmpegWriterFactory::new()),
            permissions: Arc::new(SystemPermissions),
        })
    }

    /// Test pattern, tone generators and the in-memory writer
    pub fn synthetic() -> Self {
        Self {
            capture: Box::new(SyntheticCaptureSource::default()),
            taps: Arc::new(SyntheticTapFactory::default()),
            writers: Arc::new(MemoryWriterFactory::new()),
            permissions: Arc::new(StaticPermissions::granted()),
        }
    }
}

/// A failure reported by a subsystem outside a controller call
struct Fault {
    /// `None` for faults from pre-roll monitoring, which belong to whatever session is current
    session: Option<Uuid>,
    error: RecorderError,
}

/// Sends faults into the controller's queue and wakes the supervisor
#[derive(Clone)]
struct FaultReporter {
    tx: mpsc::UnboundedSender<Fault>,
    signal: Arc<Notify>,
}

impl FaultReporter {
    fn report(&self, session: Option<Uuid>, error: RecorderError) {
        if self.tx.send(Fault { session, error }).is_ok() {
            self.signal.notify_one();
        }
    }

    fn callback<E>(&self, session: Option<Uuid>) -> Arc<dyn Fn(E) + Send + Sync>
    where
        E: Into<RecorderError> + 'static,
    {
        let reporter = self.clone();
        Arc::new(move |error: E| reporter.report(session, error.into()))
    }
}

/// Wall-clock bookkeeping for elapsed-time display
#[derive(Debug, Default)]
struct Timing {
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl Timing {
    fn paused(&self) -> Duration {
        self.paused_total + self.paused_at.map(|t| t.elapsed()).unwrap_or_default()
    }
}

/// Drives one recording session at a time
pub struct RecordingController {
    capture: Box<dyn CaptureSource>,
    taps: Arc<dyn TapFactory>,
    permissions: Arc<dyn PermissionService>,
    encoder: Encoder,
    audio: Option<AudioPath>,
    state: RecordingState,
    session: Option<RecordingSession>,
    timing: Timing,
    events: broadcast::Sender<RecordingEvent>,
    levels: Arc<watch::Sender<AudioLevels>>,
    faults: FaultReporter,
    fault_rx: mpsc::UnboundedReceiver<Fault>,
    /// Session whose failure has already been reported
    reported: Option<Uuid>,
}

impl RecordingController {
    pub fn new(services: RecorderServices) -> Self {
        let (events, _) = broadcast::channel(100);
        let (levels, _) = watch::channel(AudioLevels::default());
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let mut encoder = Encoder::new(services.writers);
        let progress = events.clone();
        encoder.on_progress(Arc::new(move |frame_count| {
            let _ = progress.send(RecordingEvent::Progress { frame_count });
        }));

        Self {
            capture: services.capture,
            taps: services.taps,
            permissions: services.permissions,
            encoder,
            audio: None,
            state: RecordingState::Idle,
            session: None,
            timing: Timing::default(),
            events,
            levels: Arc::new(levels),
            faults: FaultReporter {
                tx: fault_tx,
                signal: Arc::new(Notify::new()),
            },
            fault_rx,
            reported: None,
        }
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<RecordingSession> {
        self.session.clone()
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    /// Audio levels, kept across sessions
    pub fn levels(&self) -> watch::Receiver<AudioLevels> {
        self.levels.subscribe()
    }

    /// Wall-clock time since recording started, pauses included
    pub fn elapsed(&self) -> Duration {
        self.timing.started.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Time spent paused in the current session
    pub fn paused_duration(&self) -> Duration {
        self.timing.paused()
    }

    /// Woken whenever a subsystem reports a fault
    pub fn fault_signal(&self) -> Arc<Notify> {
        self.faults.signal.clone()
    }

    fn transition(&mut self, to: RecordingState) {
        tracing::info!("Recording state: {:?} -> {:?}", self.state, to);
        self.state = to;
        if let Some(ref mut session) = self.session {
            session.state = to;
        }
    }

    fn emit(&self, event: RecordingEvent) {
        let _ = self.events.send(event);
    }

    fn audio_sources(config: &RecordingConfig) -> Vec<AudioSource> {
        let mut sources = Vec::new();
        if config.flags.capture_system_audio {
            sources.push(AudioSource::System);
        }
        if config.flags.capture_microphone {
            sources.push(AudioSource::Microphone);
        }
        sources
    }

    fn build_audio(&self, sources: &[AudioSource], clock: MediaClock) -> Result<AudioPath, AudioError> {
        let taps = sources
            .iter()
            .map(|&source| self.taps.create(source))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AudioPath::new(taps, clock).with_levels(self.levels.clone()))
    }

    fn check_microphone(&self, sources: &[AudioSource]) -> Result<(), AudioError> {
        if sources.contains(&AudioSource::Microphone) && !self.permissions.microphone().is_granted() {
            self.permissions.request_microphone();
            return Err(AudioError::MicrophonePermissionDenied);
        }
        Ok(())
    }

    /// Show audio levels before recording
    ///
    /// The taps opened here are reused by the next `start` with the same
    /// audio flags.
    pub async fn start_monitoring(&mut self, config: &RecordingConfig) -> RecorderResult<()> {
        if self.state != RecordingState::Idle {
            return Err(RecorderError::InvalidState {
                operation: "monitor",
                state: self.state,
            });
        }
        let sources = Self::audio_sources(config);
        self.check_microphone(&sources)?;

        if let Some(ref audio) = self.audio {
            if audio.sources() == sources && audio.is_monitoring() {
                return Ok(());
            }
        }
        self.stop_monitoring().await;

        let mut audio = self.build_audio(&sources, MediaClock::new())?;
        audio.on_error(self.faults.callback(None));
        audio.start_monitoring()?;
        self.audio = Some(audio);
        Ok(())
    }

    /// Release pre-roll monitoring taps
    pub async fn stop_monitoring(&mut self) {
        if self.state.is_active() {
            return;
        }
        if let Some(mut audio) = self.audio.take() {
            audio.stop().await;
        }
    }

    /// Start recording
    pub async fn start(&mut self, config: RecordingConfig) -> RecorderResult<RecordingSession> {
        match self.state {
            RecordingState::Idle => {}
            RecordingState::Error => self.reset(),
            RecordingState::Recording | RecordingState::Paused => {
                return Err(RecorderError::AlreadyRecording)
            }
            state => {
                return Err(RecorderError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        let output_path = config.resolve_output_path();
        self.session = Some(RecordingSession::new(&config, output_path.clone()));
        self.timing = Timing::default();
        self.transition(RecordingState::Starting);
        tracing::info!("Starting recording to: {:?}", output_path);

        match self.start_components(&config, &output_path).await {
            Ok(()) => {
                if let Some(ref mut session) = self.session {
                    session.started_at = Some(chrono::Utc::now());
                    session.segments.push(RecordingSegment::new(0));
                }
                self.timing.started = Some(Instant::now());
                self.transition(RecordingState::Recording);
                self.emit(RecordingEvent::Started);
                tracing::info!("Recording started");
                self.session.clone().ok_or(RecorderError::NotCapturing)
            }
            Err(error) => {
                tracing::error!("Failed to start recording: {}", error);
                // Aborting the encoder discards the partial container
                self.teardown().await;
                self.fail(&error);
                Err(error)
            }
        }
    }

    async fn start_components(&mut self, config: &RecordingConfig, output_path: &Path) -> RecorderResult<()> {
        let session_id = self.session.as_ref().map(|s| s.id);

        if !self.permissions.screen_recording().is_granted() {
            self.permissions.request_screen_recording();
            return Err(CaptureError::PermissionDenied.into());
        }
        let sources = Self::audio_sources(config);
        self.check_microphone(&sources)?;

        // Reuse pre-roll taps when they match
        if self.audio.as_ref().is_some_and(|a| a.sources() != sources) {
            self.stop_monitoring_unchecked().await;
        }
        let clock = self.audio.as_ref().map(|a| a.clock()).unwrap_or_else(MediaClock::new);

        let request = CaptureRequest {
            region: config.region,
            resolution: config.resolution,
            frame_rate: config.frame_rate,
            show_cursor: config.flags.show_cursor,
        };
        let plan = plan_stream(self.capture.display(), &request);
        if let Some(ref mut session) = self.session {
            session.region = Some(plan.region);
        }

        let settings = EncoderSettings::new(config.resolution, config.frame_rate, !sources.is_empty())
            .with_frame_size(plan.output_width, plan.output_height);
        self.encoder.on_error(self.faults.callback::<EncodingError>(session_id));
        self.encoder.start_with_settings(output_path, settings)?;

        let stream = self.capture.configure(
            &request,
            clock,
            self.encoder.video_sink()?,
            self.faults.callback::<CaptureError>(session_id),
        )?;
        tracing::info!(
            "Capture configured: display {}, region {:?}, {}x{} @ {}fps{}",
            stream.display_id,
            stream.region,
            stream.output_width,
            stream.output_height,
            stream.frame_rate.fps(),
            if stream.clamped { " (clamped)" } else { "" }
        );

        if !sources.is_empty() {
            let mut audio = match self.audio.take() {
                Some(audio) => audio,
                None => {
                    let mut audio = self.build_audio(&sources, clock)?;
                    audio.on_error(self.faults.callback::<AudioError>(session_id));
                    audio
                }
            };
            let started = self
                .encoder
                .audio_sink()
                .map_err(RecorderError::from)
                .and_then(|sink| audio.start_capture(sink).map_err(RecorderError::from));
            self.audio = Some(audio);
            started?;
        }

        self.capture.start().await?;
        Ok(())
    }

    async fn stop_monitoring_unchecked(&mut self) {
        if let Some(mut audio) = self.audio.take() {
            audio.stop().await;
        }
    }

    /// Stop every component and discard the container
    async fn teardown(&mut self) {
        match self.capture.stop().await {
            Ok(_) | Err(CaptureError::NotCapturing) => {}
            Err(e) => tracing::warn!("Failed to stop capture: {}", e),
        }
        self.stop_monitoring_unchecked().await;
        self.encoder.abort().await;
        self.timing.paused_at = None;
    }

    /// Enter `Error` and report once per session
    fn fail(&mut self, error: &RecorderError) {
        self.transition(RecordingState::Error);
        if let Some(ref mut session) = self.session {
            if let Some(segment) = session.segments.last_mut() {
                segment.end();
            }
        }
        let session_id = self.session.as_ref().map(|s| s.id);
        if session_id.is_some() && self.reported == session_id {
            return;
        }
        self.reported = session_id;
        self.emit(RecordingEvent::Error(ErrorResponse::from(error)));
    }

    /// Suspend forwarding at the next keyframe boundary
    pub async fn pause(&mut self) -> RecorderResult<()> {
        if self.state != RecordingState::Recording {
            return Err(RecorderError::InvalidState {
                operation: "pause",
                state: self.state,
            });
        }

        tracing::info!("Pausing recording");
        if let Some(gate) = self.encoder.gate() {
            gate.request_pause();
        }
        if let Some(segment) = self.session.as_mut().and_then(|s| s.segments.last_mut()) {
            segment.end();
        }
        self.timing.paused_at = Some(Instant::now());
        self.transition(RecordingState::Paused);
        self.emit(RecordingEvent::Paused);
        Ok(())
    }

    /// Resume forwarding
    pub async fn resume(&mut self) -> RecorderResult<()> {
        if self.state != RecordingState::Paused {
            return Err(RecorderError::InvalidState {
                operation: "resume",
                state: self.state,
            });
        }

        tracing::info!("Resuming recording");
        if let Some(gate) = self.encoder.gate() {
            gate.resume();
        }
        if let Some(paused_at) = self.timing.paused_at.take() {
            self.timing.paused_total += paused_at.elapsed();
        }
        if let Some(ref mut session) = self.session {
            let index = session.segments.len();
            session.segments.push(RecordingSegment::new(index));
        }
        self.transition(RecordingState::Recording);
        self.emit(RecordingEvent::Resumed);
        Ok(())
    }

    /// Stop recording and finalize the container
    ///
    /// Returns `NotCapturing` without touching any state unless recording
    /// or paused.
    pub async fn stop(&mut self) -> RecorderResult<OutputDescriptor> {
        if !self.state.is_active() {
            return Err(RecorderError::NotCapturing);
        }

        tracing::info!("Stopping recording");
        if let Some(paused_at) = self.timing.paused_at.take() {
            self.timing.paused_total += paused_at.elapsed();
        }
        if let Some(segment) = self.session.as_mut().and_then(|s| s.segments.last_mut()) {
            segment.end();
        }
        self.transition(RecordingState::Stopping);

        match self.capture.stop().await {
            Ok(stats) => tracing::info!(
                "Capture stopped: {} frames delivered, {} dropped",
                stats.frames_delivered,
                stats.frames_dropped
            ),
            Err(e) => tracing::warn!("Failed to stop capture: {}", e),
        }
        self.stop_monitoring_unchecked().await;

        match self.encoder.finish_encoding().await {
            Ok(output) => {
                self.transition(RecordingState::Finished);
                self.emit(RecordingEvent::Finished(output.clone()));
                tracing::info!(
                    "Recording stopped. Duration: {}ms, {} frames, paused {:?}",
                    output.duration_ms,
                    output.frame_count,
                    self.timing.paused_total
                );

                self.session = None;
                self.transition(RecordingState::Idle);
                Ok(output)
            }
            Err(e) => {
                let error = RecorderError::from(e);
                tracing::error!("Failed to finalize recording: {}", error);
                self.teardown().await;
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Clear a failed session
    pub fn reset(&mut self) {
        if self.state != RecordingState::Error {
            return;
        }
        while self.fault_rx.try_recv().is_ok() {}
        self.session = None;
        self.timing = Timing::default();
        self.transition(RecordingState::Idle);
    }

    /// Apply queued faults from subsystems
    ///
    /// The first fault of the active session tears it down and moves the
    /// controller to `Error`; later faults for the same session and faults
    /// for finished sessions are discarded. Returns the applied fault.
    pub async fn poll_faults(&mut self) -> Option<RecorderError> {
        let mut applied = None;
        while let Ok(fault) = self.fault_rx.try_recv() {
            let current = self.session.as_ref().map(|s| s.id);
            let belongs = match (fault.session, current) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(id), Some(current)) => id == current,
            };
            if !belongs || !self.state.is_active() || self.reported == current || applied.is_some() {
                tracing::debug!("Discarding fault: {}", fault.error);
                continue;
            }
            applied = Some(fault.error);
        }

        let error = applied?;
        tracing::error!("Recording failed: {}", error);
        self.teardown().await;
        self.fail(&error);
        Some(error)
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        // Lets a supervisor notice the controller is gone
        self.faults.signal.notify_one();
    }
}

/// Apply faults to a shared controller as they are reported
///
/// The task ends once the controller is dropped.
pub fn supervise(controller: Arc<Mutex<RecordingController>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal = controller.lock().await.fault_signal();
        let weak = Arc::downgrade(&controller);
        drop(controller);

        loop {
            signal.notified().await;
            let Some(controller) = weak.upgrade() else {
                break;
            };
            let mut controller = controller.lock().await;
            if let Some(error) = controller.poll_faults().await {
                tracing::warn!("Supervisor stopped recording after fault: {}", error);
            }
        }
        tracing::debug!("Recording supervisor exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DisplayInfo;
    use crate::encoder::{read_summary, FrameRate, MemoryWriterHandle, Resolution, Track};
    use crate::recorder::PermissionStatus;
    use tempfile::tempdir;

    fn services(capture: SyntheticCaptureSource) -> (RecorderServices, MemoryWriterHandle) {
        let writers = MemoryWriterFactory::new();
        let handle = writers.handle();
        let services = RecorderServices {
            capture: Box::new(capture),
            taps: Arc::new(SyntheticTapFactory::default()),
            writers: Arc::new(writers),
            permissions: Arc::new(StaticPermissions::granted()),
        };
        (services, handle)
    }

    fn capture() -> SyntheticCaptureSource {
        SyntheticCaptureSource::new(DisplayInfo::fallback()).with_frame_interval(Duration::from_millis(10))
    }

    /// Yield long enough for the synthetic source to deliver frames
    async fn frames_arrive() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn config(dir: &std::path::Path) -> RecordingConfig {
        let mut config = RecordingConfig::new(dir);
        config.resolution = Resolution::Hd720;
        config.frame_rate = FrameRate::Fps30;
        config
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempdir().unwrap();
        let (services, handle) = services(capture());
        let mut controller = RecordingController::new(services);
        let mut events = controller.subscribe();

        let session = controller.start(config(dir.path())).await.unwrap();
        assert_eq!(controller.state(), RecordingState::Recording);
        assert_eq!(session.state, RecordingState::Recording);
        assert!(session.started_at.is_some());
        assert_eq!(session.segments.len(), 1);
        assert!(matches!(events.recv().await.unwrap(), RecordingEvent::Started));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let output = controller.stop().await.unwrap();
        assert_eq!(controller.state(), RecordingState::Idle);
        assert!(controller.session().is_none());
        assert!(output.frame_count > 0);
        assert!(!output.has_audio);
        assert!(output.path.starts_with(dir.path()));
        assert_eq!(handle.created(), 1);

        let summary = read_summary(&output.path).unwrap();
        assert_eq!(summary.tracks.len(), 1);
        assert!(summary.track(Track::Video).is_some());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_rejected() {
        let (services, _) = services(capture());
        let mut controller = RecordingController::new(services);
        let mut events = controller.subscribe();

        assert!(matches!(controller.stop().await, Err(RecorderError::NotCapturing)));
        assert_eq!(controller.state(), RecordingState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = tempdir().unwrap();
        let (services, handle) = services(capture());
        let mut controller = RecordingController::new(services);

        controller.start(config(dir.path())).await.unwrap();
        let mut second = config(dir.path());
        second.output_path = Some(dir.path().join("second.mp4"));
        assert!(matches!(
            controller.start(second).await,
            Err(RecorderError::AlreadyRecording)
        ));
        assert_eq!(controller.state(), RecordingState::Recording);
        assert_eq!(handle.created(), 1);
        assert!(!dir.path().join("second.mp4").exists());

        frames_arrive().await;
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_state_rules() {
        let dir = tempdir().unwrap();
        let (services, _) = services(capture());
        let mut controller = RecordingController::new(services);

        assert!(matches!(
            controller.pause().await,
            Err(RecorderError::InvalidState { operation: "pause", .. })
        ));

        controller.start(config(dir.path())).await.unwrap();
        assert!(controller.resume().await.is_err());
        controller.pause().await.unwrap();
        assert_eq!(controller.state(), RecordingState::Paused);
        assert!(controller.pause().await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.resume().await.unwrap();
        assert_eq!(controller.state(), RecordingState::Recording);
        assert!(controller.paused_duration() >= Duration::from_millis(50));
        assert!(controller.elapsed() >= controller.paused_duration());

        let session = controller.session().unwrap();
        assert_eq!(session.segments.len(), 2);
        assert!(session.segments[0].ended_at.is_some());

        frames_arrive().await;
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_paused_finalizes() {
        let dir = tempdir().unwrap();
        let (services, _) = services(capture());
        let mut controller = RecordingController::new(services);

        controller.start(config(dir.path())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.pause().await.unwrap();
        let output = controller.stop().await.unwrap();
        assert!(output.frame_count > 0);
        assert_eq!(controller.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_screen_permission_denied() {
        let dir = tempdir().unwrap();
        let permissions = Arc::new(StaticPermissions::new(
            PermissionStatus::Denied,
            PermissionStatus::Granted,
        ));
        let (mut services, handle) = services(capture());
        services.permissions = permissions.clone();
        let mut controller = RecordingController::new(services);
        let mut events = controller.subscribe();

        let mut denied = config(dir.path());
        denied.output_path = Some(dir.path().join("denied.mp4"));
        let err = controller.start(denied).await.unwrap_err();

        assert!(matches!(err, RecorderError::Capture(CaptureError::PermissionDenied)));
        assert_eq!(controller.state(), RecordingState::Error);
        assert_eq!(permissions.requests(), 1);
        assert_eq!(handle.created(), 0);
        assert!(!dir.path().join("denied.mp4").exists());
        match events.recv().await.unwrap() {
            RecordingEvent::Error(response) => assert_eq!(response.code, err.code()),
            other => panic!("unexpected event {:?}", other),
        }

        // A new start is accepted from Error
        controller.permissions = Arc::new(StaticPermissions::granted());
        controller.start(config(dir.path())).await.unwrap();
        frames_arrive().await;
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_microphone_permission_denied_removes_output() {
        let dir = tempdir().unwrap();
        let (mut services, _) = services(capture());
        services.taps = Arc::new(SyntheticTapFactory {
            deny_microphone: true,
            format: None,
        });
        let mut controller = RecordingController::new(services);

        let mut with_mic = config(dir.path());
        with_mic.flags.capture_microphone = true;
        with_mic.output_path = Some(dir.path().join("mic.mp4"));
        let err = controller.start(with_mic).await.unwrap_err();

        assert!(matches!(err, RecorderError::Audio(AudioError::MicrophonePermissionDenied)));
        assert_eq!(controller.state(), RecordingState::Error);
        assert!(!dir.path().join("mic.mp4").exists());
    }

    #[tokio::test]
    async fn test_capture_failure_reported_once() {
        let dir = tempdir().unwrap();
        let (services, _) = services(capture().fail_after_frames(3));
        let mut controller = RecordingController::new(services);
        let mut events = controller.subscribe();

        controller.start(config(dir.path())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let fault = controller.poll_faults().await;
        assert!(matches!(fault, Some(RecorderError::Capture(CaptureError::StreamTerminated(_)))));
        assert_eq!(controller.state(), RecordingState::Error);
        assert!(controller.poll_faults().await.is_none());

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RecordingEvent::Error(_)) {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);

        assert!(matches!(controller.stop().await, Err(RecorderError::NotCapturing)));
        controller.reset();
        assert_eq!(controller.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_supervisor_applies_writer_failure() {
        let dir = tempdir().unwrap();
        let (services, handle) = services(capture());
        let controller = Arc::new(Mutex::new(RecordingController::new(services)));
        let mut events = controller.lock().await.subscribe();
        let supervisor = supervise(controller.clone());

        controller.lock().await.start(config(dir.path())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.fail_with("disk full");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(controller.lock().await.state(), RecordingState::Error);
        let mut errors = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RecordingEvent::Error(response) = event {
                errors.push(response);
            }
        }
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "WRITER_FAILED");

        drop(controller);
        tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitoring_taps_reused_for_recording() {
        let dir = tempdir().unwrap();
        let (services, _) = services(capture());
        let mut controller = RecordingController::new(services);
        let mut levels = controller.levels();

        let mut with_mic = config(dir.path());
        with_mic.flags.capture_microphone = true;
        controller.start_monitoring(&with_mic).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), levels.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(levels.borrow().microphone > 0.0);

        controller.start(with_mic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let output = controller.stop().await.unwrap();
        assert!(output.has_audio);

        let summary = read_summary(&output.path).unwrap();
        assert_eq!(summary.tracks.len(), 2);
        assert!(summary.track(Track::Audio).is_some_and(|t| t.samples > 0));
    }

    #[tokio::test]
    async fn test_stop_without_frames_fails_and_discards_output() {
        let dir = tempdir().unwrap();
        let (services, _) = services(capture().with_frame_limit(0));
        let mut controller = RecordingController::new(services);
        let mut events = controller.subscribe();

        let mut empty = config(dir.path());
        empty.output_path = Some(dir.path().join("empty.mp4"));
        controller.start(empty).await.unwrap();
        frames_arrive().await;

        let err = controller.stop().await.unwrap_err();
        assert!(matches!(err, RecorderError::Encoding(EncodingError::ConfigurationFailed(_))));
        assert_eq!(controller.state(), RecordingState::Error);
        assert!(!dir.path().join("empty.mp4").exists());

        let errors = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, RecordingEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_finalize_timeout_fails_and_discards_output() {
        let dir = tempdir().unwrap();
        let (services, handle) = services(capture());
        handle.set_finalize_delay(crate::encoder::FINALIZE_TIMEOUT + Duration::from_millis(500));
        let mut controller = RecordingController::new(services);

        let mut slow = config(dir.path());
        slow.output_path = Some(dir.path().join("slow.mp4"));
        controller.start(slow).await.unwrap();
        frames_arrive().await;

        let err = controller.stop().await.unwrap_err();
        assert!(matches!(err, RecorderError::Encoding(EncodingError::ConfigurationFailed(_))));
        assert_eq!(controller.state(), RecordingState::Error);
        assert!(!dir.path().join("slow.mp4").exists());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!dir.path().join("slow.mp4").exists());
    }
}
