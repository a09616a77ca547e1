//! Permission checks
//!
//! The controller never prompts and waits: it asks the service for the
//! current status, fires a request when access is missing, and fails fast.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Authorization status of a protected resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    NotDetermined,
}

impl PermissionStatus {
    pub fn is_granted(&self) -> bool {
        *self == PermissionStatus::Granted
    }
}

/// Source of screen and microphone authorization
pub trait PermissionService: Send + Sync {
    fn screen_recording(&self) -> PermissionStatus;

    fn microphone(&self) -> PermissionStatus;

    /// Ask the OS for screen recording access without waiting for the answer
    fn request_screen_recording(&self);

    /// Ask the OS for microphone access without waiting for the answer
    fn request_microphone(&self);
}

/// Permissions as reported by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPermissions;

impl PermissionService for SystemPermissions {
    fn screen_recording(&self) -> PermissionStatus {
        if crate::capture::has_screen_recording_permission() {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        }
    }

    fn microphone(&self) -> PermissionStatus {
        // The OS prompts on first device open; a refusal surfaces as an open error
        PermissionStatus::Granted
    }

    fn request_screen_recording(&self) {
        let spawned = std::thread::Builder::new()
            .name("permission-request".to_string())
            .spawn(|| {
                let granted = crate::capture::request_screen_recording_permission();
                tracing::info!("Screen recording permission request returned: {}", granted);
            });
        if let Err(e) = spawned {
            tracing::warn!("Failed to request screen recording permission: {}", e);
        }
    }

    fn request_microphone(&self) {
        #[cfg(target_os = "macos")]
        crate::capture::macos::open_microphone_preferences();

        #[cfg(not(target_os = "macos"))]
        tracing::info!("Microphone access is managed by the system sound settings");
    }
}

/// Fixed answers, for tests and headless runs
#[derive(Debug, Default)]
pub struct StaticPermissions {
    screen: Option<PermissionStatus>,
    microphone: Option<PermissionStatus>,
    requests: AtomicU32,
}

impl StaticPermissions {
    pub fn new(screen: PermissionStatus, microphone: PermissionStatus) -> Self {
        Self {
            screen: Some(screen),
            microphone: Some(microphone),
            requests: AtomicU32::new(0),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted, PermissionStatus::Granted)
    }

    /// Requests fired so far
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PermissionService for StaticPermissions {
    fn screen_recording(&self) -> PermissionStatus {
        self.screen.unwrap_or(PermissionStatus::Granted)
    }

    fn microphone(&self) -> PermissionStatus {
        self.microphone.unwrap_or(PermissionStatus::Granted)
    }

    fn request_screen_recording(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn request_microphone(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}
