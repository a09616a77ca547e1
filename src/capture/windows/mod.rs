//! Windows capture implementations
//!
//! Uses GDI for display enumeration and frame grabbing.

pub mod screen;

pub use screen::*;
