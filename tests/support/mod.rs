//! Fake platform collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use housedog::device::DeviceParts;
use housedog::device_config::{default_config, DeviceConfig};
use housedog::{
    AudioFeed, DeviceError, DeviceResult, FrameSource, PixelFormat, RawFrame, SourceOpener, StreamEncoder,
    StreamSettings, ToneGenerator,
};

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 16;

/// Alternates between a dark and a bright frame so every pair differs.
pub struct Flicker {
    next_at: Instant,
    produced: usize,
}

impl FrameSource for Flicker {
    fn next_frame(&mut self) -> DeviceResult<RawFrame> {
        std::thread::sleep(Duration::from_millis(5));
        let value = if self.produced % 2 == 0 { 0 } else { 255 };
        self.produced += 1;
        let at = self.next_at;
        self.next_at += Duration::from_millis(200);
        let luma = vec![value; (WIDTH * HEIGHT) as usize];
        let chroma = vec![128; PixelFormat::I420.chroma_len(WIDTH, HEIGHT)];
        Ok(RawFrame::new(WIDTH, HEIGHT, PixelFormat::I420, luma, chroma, at))
    }
}

#[derive(Default)]
pub struct FlickerOpener {
    pub opens: AtomicUsize,
}

impl SourceOpener for FlickerOpener {
    fn check_available(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn open(&self, _flash_light: bool) -> DeviceResult<Box<dyn FrameSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Flicker {
            next_at: Instant::now(),
            produced: 0,
        }))
    }
}

/// Tone that records how often it was started.
#[derive(Clone, Default)]
pub struct CountingTone {
    pub playing: Arc<AtomicBool>,
    pub plays: Arc<AtomicUsize>,
    pub closed: Arc<AtomicBool>,
}

impl ToneGenerator for CountingTone {
    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
        self.playing.store(true, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Pushed {
    pub started: usize,
    pub stopped: usize,
    pub timestamps: Vec<u64>,
    pub audio_chunks: usize,
}

/// Encoder that keeps what it was given.
#[derive(Clone, Default)]
pub struct RecordingEncoder(pub Arc<Mutex<Pushed>>);

impl StreamEncoder for RecordingEncoder {
    fn start(&mut self, _settings: &StreamSettings) -> DeviceResult<()> {
        self.0.lock().unwrap().started += 1;
        Ok(())
    }

    fn push_video_frame(&mut self, _gray: &[u8], timestamp_micros: u64) -> DeviceResult<()> {
        self.0.lock().unwrap().timestamps.push(timestamp_micros);
        Ok(())
    }

    fn push_audio_samples(&mut self, _samples: &[i16]) -> DeviceResult<()> {
        self.0.lock().unwrap().audio_chunks += 1;
        Ok(())
    }

    fn stop(&mut self) {
        self.0.lock().unwrap().stopped += 1;
    }
}

/// Encoder whose video pushes hang until it is interrupted, like an ffmpeg
/// child stuck on a dead RTMP connection.
#[derive(Clone)]
pub struct StallingEncoder {
    pub stalled: Arc<AtomicBool>,
    pub stopped: Arc<AtomicUsize>,
    killed: Arc<AtomicBool>,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

impl Default for StallingEncoder {
    fn default() -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            stalled: Arc::default(),
            stopped: Arc::default(),
            killed: Arc::default(),
            wake_tx,
            wake_rx,
        }
    }
}

impl StreamEncoder for StallingEncoder {
    fn start(&mut self, _settings: &StreamSettings) -> DeviceResult<()> {
        self.killed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn push_video_frame(&mut self, _gray: &[u8], _timestamp_micros: u64) -> DeviceResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(DeviceError::StreamEncoder("killed".into()));
        }
        self.stalled.store(true, Ordering::SeqCst);
        let _ = self.wake_rx.recv_timeout(Duration::from_secs(3));
        Ok(())
    }

    fn push_audio_samples(&mut self, _samples: &[i16]) -> DeviceResult<()> {
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn interrupter(&self) -> Option<Box<dyn Fn() + Send + Sync>> {
        let killed = Arc::clone(&self.killed);
        let wake = self.wake_tx.clone();
        Some(Box::new(move || {
            killed.store(true, Ordering::SeqCst);
            let _ = wake.try_send(());
        }))
    }
}

pub struct Fakes {
    pub opener: Arc<FlickerOpener>,
    pub tone: CountingTone,
    pub encoder: RecordingEncoder,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            opener: Arc::new(FlickerOpener::default()),
            tone: CountingTone::default(),
            encoder: RecordingEncoder::default(),
        }
    }

    pub fn parts(&self) -> DeviceParts {
        DeviceParts {
            opener: self.opener.clone(),
            tone: Box::new(self.tone.clone()),
            encoder: Box::new(self.encoder.clone()),
            audio: None,
        }
    }

    /// Same fakes, with stream audio read from `samples`.
    pub fn parts_with_audio(&self, samples: flume::Receiver<Vec<i16>>) -> DeviceParts {
        DeviceParts {
            audio: Some(AudioFeed::from_channel(samples)),
            ..self.parts()
        }
    }
}

/// Small frames, camera closed until a command opens it.
pub fn test_config() -> DeviceConfig {
    let mut cfg = default_config();
    cfg.camera.width = WIDTH;
    cfg.camera.height = HEIGHT;
    cfg.camera.scale = 2;
    cfg.camera.open_on_start = false;
    cfg.stream.url = "rtmp://localhost/live/test".into();
    cfg.stream.scale = 2;
    cfg
}

pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
