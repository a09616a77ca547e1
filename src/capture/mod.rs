//! Screen capture
//!
//! The capture source contract, region normalization, media samples and the
//! platform frame grabbers.

pub mod cursor;
pub mod frame;
pub mod polling;
pub mod region;
pub mod synthetic;
pub mod traits;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

pub use frame::{AudioBuffer, FrameSample, MediaClock, PixelBuffer, SampleBuffer, TrackKind};
pub use polling::{FrameGrabber, ScreenCaptureSource};
pub use region::{normalize_region, output_size, CaptureRect, RegionPlan, ScreenRect, MIN_REGION_SIZE};
pub use synthetic::SyntheticCaptureSource;
pub use traits::{
    default_capture_source, list_displays, CaptureError, CaptureRequest, CaptureResult,
    CaptureSource, CaptureStats, DisplayInfo, StreamHandle,
};

// Re-export permission functions from traits (which delegates to platform)
pub use traits::{has_screen_recording_permission, request_screen_recording_permission};
