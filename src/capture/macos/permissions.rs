//! macOS permission handling
//!
//! Screen recording and microphone authorization checks.

use core_graphics::access::ScreenCaptureAccess;

/// Check if screen recording permission is granted
pub fn has_screen_recording_permission() -> bool {
    ScreenCaptureAccess::preflight()
}

/// Request screen recording permission
///
/// Returns true if permission was already granted. The system shows its own
/// dialog otherwise and the answer only applies to later checks.
pub fn request_screen_recording_permission() -> bool {
    ScreenCaptureAccess::request()
}

/// Open System Settings at the Microphone privacy pane
pub fn open_microphone_preferences() {
    let url = "x-apple.systempreferences:com.apple.preference.security?Privacy_Microphone";
    if let Ok(output) = std::process::Command::new("open").arg(url).output() {
        if !output.status.success() {
            tracing::warn!("Failed to open Microphone preferences");
        }
    }
}
