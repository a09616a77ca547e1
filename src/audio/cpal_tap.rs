//! Device taps backed by cpal
//!
//! The cpal stream is not `Send`, so a dedicated thread builds it, plays it
//! and keeps it alive until the tap is closed. Microphone taps use the
//! default input device; system audio taps build an input stream on the
//! default output device, which WASAPI treats as loopback capture.

use super::tap::{AudioSource, AudioTap, RawAudio, RawSamples, TapFactory};
use super::AudioError;
use crate::capture::MediaClock;
use crate::utils::ErrorCallback;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn default_device(source: AudioSource) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    let device = match source {
        AudioSource::Microphone => host.default_input_device(),
        AudioSource::System => host.default_output_device(),
    };
    device.ok_or_else(|| AudioError::CannotAddInput(format!("No default device for {}", source)))
}

fn device_config(device: &Device, source: AudioSource) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let config = match source {
        AudioSource::Microphone => device.default_input_config(),
        AudioSource::System => device.default_output_config(),
    }
    .map_err(|e| AudioError::UnsupportedSettings(format!("Failed to get audio config: {}", e)))?;

    Ok((config.config(), config.sample_format()))
}

/// Timestamps device callbacks on the session clock
#[derive(Clone)]
struct Stamp {
    source: AudioSource,
    clock: MediaClock,
    sample_rate: u32,
    channels: u16,
    tx: mpsc::Sender<RawAudio>,
    dropped: Arc<AtomicU64>,
}

impl Stamp {
    fn send(&self, samples: RawSamples) {
        let frames = samples.len() / self.channels.max(1) as usize;
        let span = Duration::from_secs_f64(frames as f64 / self.sample_rate as f64);
        let buffer = RawAudio {
            source: self.source,
            pts: self.clock.now().saturating_sub(span),
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples,
        };
        if self.tx.try_send(buffer).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                tracing::debug!("Dropped {} {} buffers, processing queue full", dropped, self.source);
            }
        }
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    format: SampleFormat,
    stamp: Stamp,
    on_error: ErrorCallback<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    let source = stamp.source;
    let error_callback = move |err: cpal::StreamError| {
        tracing::error!("{} stream error: {}", source, err);
        if let cpal::StreamError::DeviceNotAvailable = err {
            on_error(AudioError::DeviceLost(err.to_string()));
        }
    };

    let result = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| stamp.send(RawSamples::F32(data.to_vec())),
            error_callback,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| stamp.send(RawSamples::I16(data.to_vec())),
            error_callback,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| stamp.send(RawSamples::U16(data.to_vec())),
            error_callback,
            None,
        ),
        other => {
            return Err(AudioError::UnsupportedSettings(format!(
                "Unsupported sample format {:?}",
                other
            )))
        }
    };

    result.map_err(|e| match e {
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::UnsupportedSettings(format!("{} stream config not supported", source))
        }
        other => AudioError::CannotAddInput(format!("Failed to build {} stream: {}", source, other)),
    })
}

/// cpal-backed device tap
pub struct CpalTap {
    source: AudioSource,
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalTap {
    pub fn new(source: AudioSource) -> Self {
        Self {
            source,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Whether a device exists for this source
    pub fn is_available(source: AudioSource) -> bool {
        default_device(source).is_ok()
    }
}

impl AudioTap for CpalTap {
    fn source(&self) -> AudioSource {
        self.source
    }

    fn open(
        &mut self,
        clock: MediaClock,
        tx: mpsc::Sender<RawAudio>,
        on_error: ErrorCallback<AudioError>,
    ) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let source = self.source;
        let running = self.running.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), AudioError>>(1);
        running.store(true, Ordering::SeqCst);

        let thread = std::thread::Builder::new()
            .name(format!("cpal-{}", source))
            .spawn(move || {
                let opened = default_device(source).and_then(|device| {
                    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                    let (config, format) = device_config(&device, source)?;
                    let stamp = Stamp {
                        source,
                        clock,
                        sample_rate: config.sample_rate.0,
                        channels: config.channels,
                        tx,
                        dropped: Arc::new(AtomicU64::new(0)),
                    };
                    let stream = build_stream(&device, &config, format, stamp, on_error)?;
                    stream
                        .play()
                        .map_err(|e| AudioError::CannotAddInput(format!("Failed to start audio stream: {}", e)))?;
                    tracing::info!(
                        "{} tap opened: {} ({}Hz, {}ch, {:?})",
                        source,
                        name,
                        config.sample_rate.0,
                        config.channels,
                        format
                    );
                    Ok(stream)
                });

                let stream = match opened {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Keep the stream alive while open
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                tracing::info!("{} tap closed", source);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::CannotAddInput(format!("Failed to spawn audio thread: {}", e))
            })?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::CannotAddInput(format!("{} thread exited", source))));
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        self.thread = Some(thread);
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalTap {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for [`CpalTap`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalTapFactory;

impl TapFactory for CpalTapFactory {
    fn create(&self, source: AudioSource) -> Result<Box<dyn AudioTap>, AudioError> {
        if !CpalTap::is_available(source) {
            tracing::warn!("No device found for {} capture", source);
        }
        Ok(Box::new(CpalTap::new(source)))
    }
}
