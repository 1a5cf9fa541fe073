//! Microphone capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not allocate after warm-up, block on a lock, or perform I/O. It
//! only down-mixes to mono into a reused buffer and pushes into the SPSC ring.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` must be created and dropped on the same thread; the
//! engine does both inside `spawn_blocking`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffering::AudioProducer;
use crate::error::{PalfriendError, Result};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an active capture stream. **Not `Send`.**
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open the input device named `preferred` (empty or unknown falls back
    /// to the default device, then to the first available input).
    pub fn open(producer: AudioProducer, running: Arc<AtomicBool>, preferred: &str) -> Result<Self> {
        let host = cpal::default_host();

        let mut selected = None;
        if !preferred.is_empty() {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected = devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if selected.is_none() {
                        warn!("input device '{preferred}' not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list input devices: {e}"),
            }
        }

        let device = match selected.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| PalfriendError::AudioDevice(e.to_string()))?;
                let first = devices.next().ok_or(PalfriendError::NoDefaultInputDevice)?;
                warn!("no default input device, using first available input");
                first
            }
        };

        let supported = device
            .default_input_config()
            .map_err(|e| PalfriendError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate, channels, "opening input device"
        );

        let config: StreamConfig = supported.config();
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, &running, |s| s),
            SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, producer, &running, |s| s as f32 / 32768.0)
            }
            SampleFormat::U8 => build_stream::<u8>(&device, &config, producer, &running, |s| {
                (s as f32 - 128.0) / 128.0
            }),
            fmt => {
                return Err(PalfriendError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| PalfriendError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> Result<Stream>
where
    T: SizedSample,
{
    use crate::buffering::Producer;

    let channels = usize::from(config.channels.max(1));
    let running = Arc::clone(running);
    let mut mono: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                for (f, out) in mono.iter_mut().enumerate() {
                    let base = f * channels;
                    let sum: f32 = data[base..base + channels].iter().map(|s| to_f32(*s)).sum();
                    *out = sum / channels as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!("ring buffer full: dropped {} frames", mono.len() - written);
                }
            },
            |err| error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| PalfriendError::AudioStream(e.to_string()))
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(_producer: AudioProducer, _running: Arc<AtomicBool>, _preferred: &str) -> Result<Self> {
        Err(PalfriendError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl AudioCapture {
    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
