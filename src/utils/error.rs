//! Error types and handling
//!
//! The controller-level error type, its classification, and the serializable
//! response handed to the UI layer.

use crate::audio::AudioError;
use crate::capture::CaptureError;
use crate::encoder::EncodingError;
use crate::recorder::RecordingState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Callback used by subsystems to report asynchronous failures
pub type ErrorCallback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Errors surfaced by the recording controller
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Not capturing")]
    NotCapturing,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: RecordingState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an error should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Needs user action (grant a permission) before retrying
    Permission,
    /// Retryable after correcting the configuration
    Configuration,
    /// Aborted the active session; a fresh start is required
    Fatal,
    /// The operation is not legal in the current lifecycle state
    State,
}

impl RecorderError {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            RecorderError::Capture(e) => match e {
                CaptureError::PermissionDenied => ErrorCategory::Permission,
                CaptureError::ConfigurationFailed(_) | CaptureError::CaptureUnavailable(_) => {
                    ErrorCategory::Configuration
                }
                CaptureError::StreamTerminated(_) => ErrorCategory::Fatal,
                CaptureError::NotCapturing | CaptureError::AlreadyCapturing => ErrorCategory::State,
            },
            RecorderError::Audio(e) => match e {
                AudioError::MicrophonePermissionDenied => ErrorCategory::Permission,
                AudioError::UnsupportedSettings(_) | AudioError::CannotAddInput(_) => {
                    ErrorCategory::Configuration
                }
                AudioError::DeviceLost(_) => ErrorCategory::Fatal,
            },
            RecorderError::Encoding(e) => match e {
                EncodingError::ConfigurationFailed(_)
                | EncodingError::UnsupportedSettings(_)
                | EncodingError::CannotAddInput(_) => ErrorCategory::Configuration,
                EncodingError::WriterFailed(_) | EncodingError::Io(_) => ErrorCategory::Fatal,
                EncodingError::NotEncoding | EncodingError::AlreadyEncoding => ErrorCategory::State,
            },
            RecorderError::NotCapturing
            | RecorderError::AlreadyRecording
            | RecorderError::InvalidState { .. } => ErrorCategory::State,
            RecorderError::Io(_) => ErrorCategory::Fatal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RecorderError::Capture(e) => match e {
                CaptureError::PermissionDenied => "PERMISSION_DENIED",
                CaptureError::ConfigurationFailed(_) => "CONFIGURATION_FAILED",
                CaptureError::CaptureUnavailable(_) => "CAPTURE_UNAVAILABLE",
                CaptureError::StreamTerminated(_) => "STREAM_TERMINATED",
                CaptureError::NotCapturing => "NOT_CAPTURING",
                CaptureError::AlreadyCapturing => "ALREADY_CAPTURING",
            },
            RecorderError::Audio(e) => match e {
                AudioError::MicrophonePermissionDenied => "MICROPHONE_PERMISSION_DENIED",
                AudioError::UnsupportedSettings(_) => "UNSUPPORTED_SETTINGS",
                AudioError::CannotAddInput(_) => "CANNOT_ADD_INPUT",
                AudioError::DeviceLost(_) => "DEVICE_LOST",
            },
            RecorderError::Encoding(e) => match e {
                EncodingError::ConfigurationFailed(_) => "CONFIGURATION_FAILED",
                EncodingError::UnsupportedSettings(_) => "UNSUPPORTED_SETTINGS",
                EncodingError::CannotAddInput(_) => "CANNOT_ADD_INPUT",
                EncodingError::WriterFailed(_) => "WRITER_FAILED",
                EncodingError::NotEncoding => "NOT_ENCODING",
                EncodingError::AlreadyEncoding => "ALREADY_ENCODING",
                EncodingError::Io(_) => "IO_ERROR",
            },
            RecorderError::NotCapturing => "NOT_CAPTURING",
            RecorderError::AlreadyRecording => "ALREADY_RECORDING",
            RecorderError::InvalidState { .. } => "INVALID_STATE",
            RecorderError::Io(_) => "IO_ERROR",
        }
    }
}

/// Error response for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
}

impl From<&RecorderError> for ErrorResponse {
    fn from(error: &RecorderError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
            category: error.category(),
        }
    }
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        ErrorResponse::from(&error)
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;
