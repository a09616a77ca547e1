//! End-to-end recordings through the controller with synthetic devices

use screen_recorder::audio::SyntheticTapFactory;
use screen_recorder::capture::{DisplayInfo, ScreenRect, SyntheticCaptureSource};
use screen_recorder::encoder::{
    probe_output, read_summary, FfmpegWriterFactory, FrameRate, MemoryWriterFactory,
    MemoryWriterHandle, Resolution, Track,
};
use screen_recorder::recorder::{PermissionStatus, StaticPermissions};
use screen_recorder::{
    RecorderError, RecorderServices, RecordingConfig, RecordingController, RecordingEvent,
    RecordingState,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn controller(capture: SyntheticCaptureSource) -> (RecordingController, MemoryWriterHandle) {
    let writers = MemoryWriterFactory::new();
    let handle = writers.handle();
    let services = RecorderServices {
        capture: Box::new(capture),
        taps: Arc::new(SyntheticTapFactory::default()),
        writers: Arc::new(writers),
        permissions: Arc::new(StaticPermissions::granted()),
    };
    (RecordingController::new(services), handle)
}

fn config(dir: &Path, resolution: Resolution, frame_rate: FrameRate) -> RecordingConfig {
    let mut config = RecordingConfig::new(dir);
    config.resolution = resolution;
    config.frame_rate = frame_rate;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_second_recording_with_microphone() -> anyhow::Result<()> {
    screen_recorder::init_logging();
    let dir = tempdir()?;
    let capture = SyntheticCaptureSource::new(DisplayInfo::fallback())
        .with_frame_interval(Duration::from_millis(33))
        .with_frame_limit(90);
    let (mut controller, _) = controller(capture);

    let mut config = config(dir.path(), Resolution::Hd1080, FrameRate::Fps30);
    config.flags.capture_microphone = true;
    controller.start(config).await?;
    tokio::time::sleep(Duration::from_millis(3200)).await;
    let output = controller.stop().await?;

    assert!(output.has_audio);
    assert!((2800..=3200).contains(&output.duration_ms), "duration {}ms", output.duration_ms);
    assert!((85..=90).contains(&output.frame_count), "{} frames", output.frame_count);

    let summary = read_summary(&output.path)?;
    assert_eq!(summary.tracks.len(), 2);
    assert_eq!((summary.width, summary.height, summary.fps), (1920, 1080, 30));
    let video = summary.track(Track::Video).unwrap();
    assert_eq!(video.timestamps_ms[0], 0);
    assert!(video.timestamps_ms.windows(2).all(|w| w[0] < w[1]));
    assert!(summary.track(Track::Audio).is_some_and(|t| t.samples > 0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_excludes_time_and_resumes_on_keyframe() {
    let dir = tempdir().unwrap();
    let capture =
        SyntheticCaptureSource::new(DisplayInfo::fallback()).with_frame_interval(Duration::from_millis(33));
    let (mut controller, handle) = controller(capture);

    controller
        .start(config(dir.path(), Resolution::Hd720, FrameRate::Fps30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    controller.pause().await.unwrap();
    // Takes effect at the 2s GOP boundary; about one second is then excluded
    tokio::time::sleep(Duration::from_millis(2500)).await;
    controller.resume().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let output = controller.stop().await.unwrap();

    let pts = handle.video_pts();
    assert!(pts.windows(2).all(|w| w[0] < w[1]));
    assert!(output.duration_ms < 3000, "duration {}ms", output.duration_ms);

    // The first resumed frame takes the withheld GOP-boundary slot
    let keyframes = handle.keyframe_pts();
    let resumed = keyframes
        .iter()
        .find(|k| k.as_millis().abs_diff(2000) < 20)
        .copied()
        .expect("keyframe at the resume point");
    assert!(pts.iter().any(|p| *p > resumed));
    let gap = pts.windows(2).map(|w| w[1] - w[0]).max().unwrap();
    assert!(gap < Duration::from_millis(100), "gap {:?}", gap);
}

#[tokio::test]
async fn test_stop_when_idle_changes_nothing() {
    let (mut controller, handle) = controller(SyntheticCaptureSource::default());
    let mut events = controller.subscribe();

    assert!(matches!(controller.stop().await, Err(RecorderError::NotCapturing)));
    assert_eq!(controller.state(), RecordingState::Idle);
    assert!(controller.session().is_none());
    assert_eq!(handle.created(), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_writer_failure_reports_single_error() {
    let dir = tempdir().unwrap();
    let capture =
        SyntheticCaptureSource::new(DisplayInfo::fallback()).with_frame_interval(Duration::from_millis(10));
    let (mut controller, handle) = controller(capture);
    let mut events = controller.subscribe();

    controller
        .start(config(dir.path(), Resolution::Hd720, FrameRate::Fps30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.fail_with("disk full");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let written = handle.written();
    let fault = controller.poll_faults().await.expect("writer fault");
    assert_eq!(fault.code(), "WRITER_FAILED");
    assert_eq!(controller.state(), RecordingState::Error);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.written(), written);
    assert!(controller.poll_faults().await.is_none());

    let errors = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, RecordingEvent::Error(_)))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_failed_start_leaves_no_output() {
    let dir = tempdir().unwrap();
    let writers = MemoryWriterFactory::new();
    let services = RecorderServices {
        capture: Box::new(SyntheticCaptureSource::default().deny_permission()),
        taps: Arc::new(SyntheticTapFactory::default()),
        writers: Arc::new(writers),
        permissions: Arc::new(StaticPermissions::new(
            PermissionStatus::Granted,
            PermissionStatus::Granted,
        )),
    };
    let mut controller = RecordingController::new(services);

    let mut config = config(dir.path(), Resolution::Hd1080, FrameRate::Fps30);
    config.output_path = Some(dir.path().join("refused.mp4"));
    let err = controller.start(config).await.unwrap_err();

    assert_eq!(err.code(), "PERMISSION_DENIED");
    assert_eq!(controller.state(), RecordingState::Error);
    assert!(!dir.path().join("refused.mp4").exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_every_preset_combination() {
    let dir = tempdir().unwrap();
    let region = ScreenRect::new(100.0, 100.0, 640.0, 360.0);

    for (i, resolution) in Resolution::ALL.into_iter().enumerate() {
        for frame_rate in FrameRate::ALL {
            let capture = SyntheticCaptureSource::new(DisplayInfo::fallback())
                .with_frame_interval(Duration::from_millis(10))
                .with_frame_limit(5);
            let (mut controller, _) = controller(capture);

            let mut config = config(dir.path(), resolution, frame_rate);
            config.region = Some(region);
            config.flags.capture_system_audio = i % 2 == 1;
            config.output_path = Some(dir.path().join(format!("{:?}-{}.mp4", resolution, frame_rate.fps())));

            controller.start(config).await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            let output = controller.stop().await.unwrap();

            let summary = read_summary(&output.path).unwrap();
            let expected_tracks = if i % 2 == 1 { 2 } else { 1 };
            assert_eq!(summary.tracks.len(), expected_tracks, "{:?}@{}", resolution, frame_rate.fps());
            assert_eq!(summary.height, resolution.height());
            assert_eq!(summary.fps, frame_rate.fps());
            assert_eq!(output.frame_count, 5);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ffmpeg_recording() -> anyhow::Result<()> {
    let writers = FfmpegWriterFactory::new();
    if !writers.is_available() {
        eprintln!("ffmpeg not installed, skipping");
        return Ok(());
    }

    let dir = tempdir()?;
    let services = RecorderServices {
        capture: Box::new(
            SyntheticCaptureSource::new(DisplayInfo::fallback())
                .with_frame_interval(Duration::from_millis(33))
                .with_frame_limit(30),
        ),
        taps: Arc::new(SyntheticTapFactory::default()),
        writers: Arc::new(writers),
        permissions: Arc::new(StaticPermissions::granted()),
    };
    let mut controller = RecordingController::new(services);

    let mut config = config(dir.path(), Resolution::Hd720, FrameRate::Fps30);
    config.flags.capture_microphone = true;
    controller.start(config).await?;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let output = controller.stop().await?;

    let info = probe_output(&output.path).await?;
    assert_eq!(info.video_streams, 1);
    assert_eq!(info.audio_streams, 1);
    assert_eq!(info.video_codec.as_deref(), Some("h264"));
    assert_eq!(info.audio_codec.as_deref(), Some("aac"));
    assert!(info.duration >= Duration::from_millis(800));
    Ok(())
}
