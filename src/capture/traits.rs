//! Capture trait definitions
//!
//! Platform-agnostic contract for screen capture sources.

use super::frame::MediaClock;
use super::region::{CaptureRect, ScreenRect};
use crate::encoder::{FrameRate, Resolution, SampleSink};
use crate::utils::ErrorCallback;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Information about a display/screen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Unique display ID
    pub id: u32,

    /// Display name
    pub name: String,

    /// Origin in the global desktop space
    pub x: i32,
    pub y: i32,

    /// Width in points
    pub width: u32,

    /// Height in points
    pub height: u32,

    /// Scale factor (e.g., 2.0 for Retina)
    pub scale_factor: f64,

    /// Whether this is the primary display
    pub is_primary: bool,

    /// Refresh rate in Hz (if available)
    pub refresh_rate: Option<u32>,
}

impl DisplayInfo {
    /// Primary display placeholder used when enumeration is unavailable
    pub fn fallback() -> Self {
        Self {
            id: 0,
            name: "Primary Display".to_string(),
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            scale_factor: 1.0,
            is_primary: true,
            refresh_rate: Some(60),
        }
    }
}

/// What the caller wants captured
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    /// Region in bottom-left-origin screen coordinates; `None` captures the whole display
    pub region: Option<ScreenRect>,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub show_cursor: bool,
}

/// Configured capture stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHandle {
    pub id: Uuid,
    pub display_id: u32,
    /// Normalized region, top-left origin, in display points
    pub region: CaptureRect,
    pub output_width: u32,
    pub output_height: u32,
    pub frame_rate: FrameRate,
    pub show_cursor: bool,
    /// Whether the requested region had to be adjusted
    pub clamped: bool,
}

/// Counters returned when a stream stops
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    /// Presentation timestamp of the last delivered frame
    pub last_pts: Option<Duration>,
}

/// Errors from capture sources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Screen recording permission denied")]
    PermissionDenied,

    #[error("Capture configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("Screen capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Capture stream terminated: {0}")]
    StreamTerminated(String),

    #[error("Not capturing")]
    NotCapturing,

    #[error("Already capturing")]
    AlreadyCapturing,
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// A live source of video frames
///
/// `configure` fixes the stream geometry and wires the sink frames are pushed
/// into; `start`/`stop` control delivery. Asynchronous stream termination is
/// reported through the error callback handed to `configure`, never returned
/// from `start`.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Source identifier
    fn id(&self) -> &str;

    /// Display this source captures
    fn display(&self) -> &DisplayInfo;

    /// Validate the request and prepare the stream
    fn configure(
        &mut self,
        request: &CaptureRequest,
        clock: MediaClock,
        sink: SampleSink,
        on_error: ErrorCallback<CaptureError>,
    ) -> CaptureResult<StreamHandle>;

    /// Begin delivering frames
    async fn start(&mut self) -> CaptureResult<()>;

    /// Stop delivering frames
    ///
    /// Returns `NotCapturing` if the source was never started.
    async fn stop(&mut self) -> CaptureResult<CaptureStats>;

    /// Check if frames are being delivered
    fn is_capturing(&self) -> bool;
}

/// Check if screen recording permission is granted
pub fn has_screen_recording_permission() -> bool {
    #[cfg(target_os = "macos")]
    {
        super::macos::permissions::has_screen_recording_permission()
    }

    #[cfg(target_os = "windows")]
    {
        // Windows doesn't require explicit permission for screen capture
        true
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        false
    }
}

/// Request screen recording permission
///
/// Fire-and-forget: the system shows its own prompt and the answer applies to
/// the next check.
pub fn request_screen_recording_permission() -> bool {
    #[cfg(target_os = "macos")]
    {
        super::macos::permissions::request_screen_recording_permission()
    }

    #[cfg(target_os = "windows")]
    {
        true
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        false
    }
}

/// List the displays available for capture
pub fn list_displays() -> Vec<DisplayInfo> {
    #[cfg(target_os = "macos")]
    {
        super::macos::get_displays()
    }

    #[cfg(target_os = "windows")]
    {
        super::windows::get_displays()
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Vec::new()
    }
}

/// Build the platform capture source for a display
pub fn default_capture_source(display_id: Option<u32>) -> CaptureResult<Box<dyn CaptureSource>> {
    let displays = list_displays();
    if displays.is_empty() {
        return Err(CaptureError::CaptureUnavailable(format!(
            "no screen capture backend for {}",
            std::env::consts::OS
        )));
    }

    let display = match display_id {
        Some(id) => displays.into_iter().find(|d| d.id == id).ok_or_else(|| {
            CaptureError::ConfigurationFailed(format!("display {} not found", id))
        })?,
        None => {
            let primary = displays.iter().position(|d| d.is_primary).unwrap_or(0);
            displays.into_iter().nth(primary).ok_or_else(|| {
                CaptureError::ConfigurationFailed("no displays available".to_string())
            })?
        }
    };

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(super::polling::ScreenCaptureSource::new(
            display.clone(),
            super::macos::DisplayGrabber::new(display),
        )))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(super::polling::ScreenCaptureSource::new(
            display.clone(),
            super::windows::GdiGrabber::new(display),
        )))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Err(CaptureError::CaptureUnavailable(format!(
            "display {} cannot be captured on {}",
            display.id,
            std::env::consts::OS
        )))
    }
}
