//! Container writer contract
//!
//! A writer is owned by exactly one encoder session thread and is never
//! called concurrently.

use super::types::{EncoderSettings, EncodingError, Track, WriterStatus};
use crate::capture::SampleBuffer;
use std::path::Path;
use std::time::Duration;

/// The non-reentrant muxer behind an encoder session
pub trait ContainerWriter: Send {
    fn status(&self) -> WriterStatus;

    /// Whether the track can take another sample without blocking
    fn is_ready(&self, track: Track) -> bool;

    /// Open the write session; `anchor` is the source time mapped to zero
    fn start_session(&mut self, anchor: Duration) -> Result<(), EncodingError>;

    /// Append a sample at a session-relative timestamp
    ///
    /// Timestamps are non-decreasing per track.
    fn append(&mut self, track: Track, pts: Duration, buffer: &SampleBuffer) -> Result<(), EncodingError>;

    /// No more samples will arrive on any track
    fn mark_inputs_finished(&mut self);

    /// Flush and close the container
    fn finalize(&mut self) -> Result<(), EncodingError>;

    /// Stop without producing a usable file
    fn abort(&mut self);
}

/// Creates writers for new sessions
pub trait WriterFactory: Send + Sync {
    fn create(
        &self,
        output: &Path,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn ContainerWriter>, EncodingError>;
}
