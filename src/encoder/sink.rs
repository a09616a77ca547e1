//! Producer handle into the encoder queue

use super::types::{EncodingError, OutputDescriptor};
use crate::capture::FrameSample;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Messages consumed by the writer thread
pub(crate) enum EncoderCommand {
    Sample(FrameSample),
    Finish(oneshot::Sender<Result<OutputDescriptor, EncodingError>>),
    Abort,
}

#[derive(Default)]
struct SinkStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable, non-blocking handle producers push samples through
///
/// A full queue, a closed queue, or a sink that has been closed for
/// finalization drops the sample and counts it.
#[derive(Clone)]
pub struct SampleSink {
    tx: mpsc::Sender<EncoderCommand>,
    accepting: Arc<AtomicBool>,
    stats: Arc<SinkStats>,
}

impl SampleSink {
    pub(crate) fn new(tx: mpsc::Sender<EncoderCommand>) -> Self {
        Self {
            tx,
            accepting: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(SinkStats::default()),
        }
    }

    /// Detached sink and receiver, for driving producers without an encoder
    pub fn channel(capacity: usize) -> (SampleSink, SampleReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (SampleSink::new(tx), SampleReceiver { rx })
    }

    /// Hand a sample to the encoder; returns false if it was dropped
    pub fn push(&self, sample: FrameSample) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            self.count_drop(&sample, "sink closed");
            return false;
        }

        match self.tx.try_send(EncoderCommand::Sample(sample)) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(EncoderCommand::Sample(sample))) => {
                self.count_drop(&sample, "queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(EncoderCommand::Sample(sample))) => {
                self.count_drop(&sample, "encoder gone");
                false
            }
            Err(_) => false,
        }
    }

    fn count_drop(&self, sample: &FrameSample, reason: &str) {
        let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 100 == 0 {
            tracing::debug!(
                "Dropped {} sample at {:?} ({}), {} dropped so far",
                sample.kind,
                sample.pts,
                reason,
                dropped
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Stop accepting samples from every clone of this sink
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn pushed(&self) -> u64 {
        self.stats.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of [`SampleSink::channel`]
pub struct SampleReceiver {
    rx: mpsc::Receiver<EncoderCommand>,
}

impl SampleReceiver {
    pub async fn recv(&mut self) -> Option<FrameSample> {
        while let Some(command) = self.rx.recv().await {
            if let EncoderCommand::Sample(sample) = command {
                return Some(sample);
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<FrameSample> {
        while let Ok(command) = self.rx.try_recv() {
            if let EncoderCommand::Sample(sample) = command {
                return Some(sample);
            }
        }
        None
    }
}
