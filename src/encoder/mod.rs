//! Video/audio encoding into an MP4 container

pub mod ffmpeg;
pub mod gate;
pub mod memory;
pub mod pipeline;
pub mod probe;
mod session;
pub mod sink;
pub mod types;
pub mod writer;

use std::sync::Arc;

/// Receives the number of video frames written so far
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub use ffmpeg::FfmpegWriterFactory;
pub use gate::{Admission, ForwardGate, GatePhase};
pub use memory::{read_summary, ContainerSummary, MemoryWriterFactory, MemoryWriterHandle, TrackSummary};
pub use pipeline::{Encoder, FINALIZE_TIMEOUT};
pub use probe::{probe_output, ContainerInfo};
pub use sink::{SampleReceiver, SampleSink};
pub use types::{
    video_bitrate, AudioCodec, AudioSettings, EncoderSettings, EncodingError, FrameRate,
    OutputDescriptor, Resolution, Track, VideoCodec, VideoSettings, WriterStatus,
};
pub use writer::{ContainerWriter, WriterFactory};
