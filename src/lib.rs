//! Screen Recorder - the real-time recording core.
//!
//! This crate captures screen frames and system/microphone audio, feeds them
//! to a single serialized container writer (H.264 + AAC in MP4), and exposes a
//! pause/resume/stop lifecycle through [`RecordingController`].
//!
//! UI concerns (region selection, settings persistence, permission prompts,
//! hotkeys) live outside this crate and talk to the controller through
//! [`RecordingConfig`], [`RecordingEvent`] and [`OutputDescriptor`].

pub mod audio;
pub mod capture;
pub mod encoder;
pub mod recorder;
pub mod utils;

pub use audio::{AudioError, AudioLevels, AudioPath, AudioSource};
pub use capture::{CaptureError, CaptureSource, DisplayInfo, ScreenRect};
pub use encoder::{
    Encoder, EncodingError, FrameRate, OutputDescriptor, Resolution, SampleSink,
};
pub use recorder::{
    RecorderServices, RecordingConfig, RecordingController, RecordingEvent, RecordingSession,
    RecordingState,
};
pub use utils::error::{ErrorCategory, ErrorResponse, RecorderError, RecorderResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
///
/// Reads the filter from `RUST_LOG`, defaulting to `screen_recorder=debug`.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screen_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    tracing::debug!("Screen Recorder v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
