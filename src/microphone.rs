/// Microphone capture — default input device through cpal, handed to the
/// stream gate as mono 16-bit chunks at the stream's sample rate.
///
/// The cpal stream lives on its own thread for the whole capture, the same
/// way the alarm tone owns its output stream.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use flume::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::stream_gate::StreamGate;

/// Chunks waiting between the capture callback and the gate.
const CHUNK_QUEUE: usize = 64;
const FEED_POLL: Duration = Duration::from_millis(100);

pub struct Microphone {
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Microphone {
    /// Start capturing into `chunks`. Fails when the host has no usable input.
    pub fn open(sample_rate: u32, chunks: Sender<Vec<i16>>) -> DeviceResult<Self> {
        let (ready_tx, ready_rx) = flume::bounded::<Result<(), String>>(1);
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("microphone".into())
            .spawn(move || {
                let stream = match build_stream(sample_rate, chunks) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("Cannot start recording: {e}")));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Capture runs until closed.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::ResourceUnavailable(format!("microphone thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| DeviceError::ResourceUnavailable("microphone thread exited early".into()))?
            .map_err(DeviceError::ResourceUnavailable)?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn close(&mut self) {
        drop(self.shutdown_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("microphone thread panicked");
            }
            debug!("microphone closed");
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_stream(target_rate: u32, chunks: Sender<Vec<i16>>) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or("No input device (microphone) found")?;
    let name = device.name().unwrap_or_else(|_| "unknown".into());

    let config = preferred_input_config(&device, target_rate)?;
    let device_rate = config.sample_rate.0;
    let channels = config.channels.max(1);
    info!("[audio] capturing {} ({}Hz, {}ch) for the stream", name, device_rate, channels);

    let err_fn = |err| warn!("[audio] capture error: {}", err);
    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = to_mono_i16(data, channels);
                let chunk = if device_rate == target_rate {
                    mono
                } else {
                    resample_linear(&mono, device_rate, target_rate)
                };
                // Drop when the gate is behind; capture never blocks.
                let _ = chunks.try_send(chunk);
            },
            err_fn,
            None,
        )
        .map_err(|e| format!("Cannot build input stream: {e}"))
}

/// Prefer `rate` in f32 with at most two channels, fall back to the device default.
fn preferred_input_config(device: &cpal::Device, rate: u32) -> Result<StreamConfig, String> {
    if let Ok(configs) = device.supported_input_configs() {
        let rate = SampleRate(rate);
        for cfg in configs {
            if cfg.channels() <= 2
                && cfg.sample_format() == cpal::SampleFormat::F32
                && cfg.min_sample_rate() <= rate
                && rate <= cfg.max_sample_rate()
            {
                return Ok(cfg.with_sample_rate(rate).into());
            }
        }
    }
    device
        .default_input_config()
        .map(|c| c.into())
        .map_err(|e| format!("No input config available: {e}"))
}

/// Average interleaved channels and convert to 16-bit.
fn to_mono_i16(data: &[f32], channels: u16) -> Vec<i16> {
    data.chunks(channels as usize)
        .map(|frame| {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            (mono * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let s0 = samples[idx.min(last)] as f64;
            let s1 = samples[(idx + 1).min(last)] as f64;
            (s0 + frac * (s1 - s0)) as i16
        })
        .collect()
}

/// Sample chunks on their way to the stream, plus the capture producing them.
pub struct AudioFeed {
    chunks: Receiver<Vec<i16>>,
    microphone: Option<Microphone>,
}

impl AudioFeed {
    /// Capture from the default microphone.
    pub fn open(sample_rate: u32) -> DeviceResult<Self> {
        let (tx, rx) = flume::bounded(CHUNK_QUEUE);
        let microphone = Microphone::open(sample_rate, tx)?;
        Ok(Self {
            chunks: rx,
            microphone: Some(microphone),
        })
    }

    /// Feed chunks from any producer.
    pub fn from_channel(chunks: Receiver<Vec<i16>>) -> Self {
        Self {
            chunks,
            microphone: None,
        }
    }

    /// Blocking loop: forward every chunk to `gate` until `stop` flips or the
    /// producer goes away, then release the microphone.
    pub fn pump(mut self, gate: Arc<StreamGate>, stop: watch::Receiver<bool>) {
        let mut forwarded: u64 = 0;
        while !*stop.borrow() {
            match self.chunks.recv_timeout(FEED_POLL) {
                Ok(chunk) => {
                    if gate.offer_audio(chunk) {
                        forwarded += 1;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.close();
        }
        debug!("audio feed stopped ({} chunks streamed)", forwarded);
    }
}
