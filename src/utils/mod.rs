//! Shared utilities
//!
//! Error taxonomy shared by the recording subsystems.

pub mod error;

pub use error::{ErrorCallback, ErrorCategory, ErrorResponse, RecorderError, RecorderResult};
