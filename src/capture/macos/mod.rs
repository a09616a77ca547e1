//! macOS capture implementations
//!
//! Uses Core Graphics for display enumeration and frame grabbing.

pub mod permissions;
pub mod screen;

pub use permissions::*;
pub use screen::*;
