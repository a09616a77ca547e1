//! Recording lifecycle
//!
//! - `RecordingController` drives capture, audio and the encoder through one
//!   session at a time
//! - `PermissionService` abstracts the OS permission checks
//! - Session, configuration and state types

pub mod controller;
pub mod permissions;
pub mod state;

pub use controller::{supervise, RecorderServices, RecordingController, RecordingEvent};
pub use permissions::{PermissionService, PermissionStatus, StaticPermissions, SystemPermissions};
pub use state::{
    output_file_name, RecordingConfig, RecordingFlags, RecordingSegment, RecordingSession,
    RecordingState,
};
