/// Live stream gate — decides per frame whether it reaches the RTMP encoder.
///
/// A frame is delivered only while streaming is enabled, the network is up
/// and an encoder session is live. Anything else is dropped, never buffered.
///
/// Each session runs the encoder on its own thread. The gate only stamps the
/// frame and hands it over through a one-slot channel, so a stalled encoder
/// costs dropped frames and never holds up the pipeline or a status read.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::preprocess::StreamFrame;

/// Audio chunks buffered ahead of the encoder before new ones are dropped.
const AUDIO_QUEUE: usize = 32;
/// How long a stopping session may take before its encoder is interrupted.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Parameters handed to `StreamEncoder::start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    /// Mono 16-bit samples are muxed into the stream.
    #[serde(default)]
    pub audio: bool,
}

/// External streaming encoder. Timestamps must be strictly increasing or the
/// push fails. Calls for one session come from a single thread.
pub trait StreamEncoder: Send {
    fn start(&mut self, settings: &StreamSettings) -> DeviceResult<()>;
    fn push_video_frame(&mut self, gray: &[u8], timestamp_micros: u64) -> DeviceResult<()>;
    fn push_audio_samples(&mut self, samples: &[i16]) -> DeviceResult<()>;
    fn stop(&mut self);
    /// Unblocks a push stuck on the encoder's output. Taken right after `start`.
    fn interrupter(&self) -> Option<Box<dyn Fn() + Send + Sync>> {
        None
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Packet {
    Video(Vec<u8>, u64),
    Audio(Vec<i16>),
}

/// Encoder thread body. Returns the encoder so the next session can reuse it.
fn encode_session(
    mut encoder: Box<dyn StreamEncoder>,
    video: Receiver<(Vec<u8>, u64)>,
    audio: Receiver<Vec<i16>>,
    alive: Arc<AtomicBool>,
) -> Box<dyn StreamEncoder> {
    loop {
        let packet = flume::Selector::new()
            .recv(&video, |r| r.ok().map(|(gray, ts)| Packet::Video(gray, ts)))
            .recv(&audio, |r| r.ok().map(Packet::Audio))
            .wait();
        let pushed = match packet {
            Some(Packet::Video(gray, ts)) => encoder.push_video_frame(&gray, ts),
            Some(Packet::Audio(samples)) => encoder.push_audio_samples(&samples),
            None => break,
        };
        if let Err(e) = pushed {
            warn!("stream session ended: {}", e);
            break;
        }
    }
    alive.store(false, Ordering::SeqCst);
    encoder.stop();
    encoder
}

struct Session {
    started: Instant,
    last_ts: Option<u64>,
    video: Sender<(Vec<u8>, u64)>,
    audio: Sender<Vec<i16>>,
    alive: Arc<AtomicBool>,
    dropped: u64,
    interrupt: Option<Box<dyn Fn() + Send + Sync>>,
    worker: JoinHandle<Box<dyn StreamEncoder>>,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Microseconds since session start, forced strictly above the last one.
    fn next_timestamp(&mut self, captured_at: Instant) -> u64 {
        let raw = captured_at.saturating_duration_since(self.started).as_micros() as u64;
        let ts = match self.last_ts {
            Some(last) if raw <= last => last + 1,
            _ => raw,
        };
        self.last_ts = Some(ts);
        ts
    }
}

struct GateInner {
    enabled: bool,
    network_available: bool,
    session: Option<Session>,
    /// Encoder between sessions. `None` while a session thread owns it.
    idle: Option<Box<dyn StreamEncoder>>,
}

impl GateInner {
    fn live(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_alive)
    }

    fn open(&self) -> bool {
        self.enabled && self.network_available && self.live()
    }
}

pub struct StreamGate {
    settings: StreamSettings,
    inner: Mutex<GateInner>,
    /// Serializes session start/stop. Never taken on the frame path.
    transitions: Mutex<()>,
}

impl StreamGate {
    pub fn new(encoder: Box<dyn StreamEncoder>, settings: StreamSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(GateInner {
                enabled: false,
                network_available: false,
                session: None,
                idle: Some(encoder),
            }),
            transitions: Mutex::new(()),
        }
    }

    /// Start or stop the encoder session. Repeating the current state is a
    /// no-op, except that enabling replaces a session whose encoder died.
    /// A session that fails to start leaves the gate disabled.
    pub fn set_enabled(&self, enabled: bool) -> DeviceResult<()> {
        let _transition = lock(&self.transitions);
        let previous = {
            let mut inner = lock(&self.inner);
            if enabled == inner.enabled && (!enabled || inner.live()) {
                return Ok(());
            }
            inner.enabled = false;
            inner.session.take()
        };
        if let Some(session) = previous {
            self.finish(session);
        }
        if enabled {
            self.start_session()?;
        }
        Ok(())
    }

    fn start_session(&self) -> DeviceResult<()> {
        let mut encoder = lock(&self.inner)
            .idle
            .take()
            .ok_or_else(|| DeviceError::StreamEncoder("encoder unavailable".into()))?;
        if let Err(e) = encoder.start(&self.settings) {
            lock(&self.inner).idle = Some(encoder);
            return Err(e);
        }
        let interrupt = encoder.interrupter();

        let (video_tx, video_rx) = flume::bounded(1);
        let (audio_tx, audio_rx) = flume::bounded(AUDIO_QUEUE);
        let alive = Arc::new(AtomicBool::new(true));
        let worker_alive = Arc::clone(&alive);
        let worker = std::thread::Builder::new()
            .name("stream-encoder".into())
            .spawn(move || encode_session(encoder, video_rx, audio_rx, worker_alive))
            .map_err(|e| DeviceError::ResourceUnavailable(format!("encoder thread: {e}")))?;

        let mut inner = lock(&self.inner);
        inner.session = Some(Session {
            started: Instant::now(),
            last_ts: None,
            video: video_tx,
            audio: audio_tx,
            alive,
            dropped: 0,
            interrupt,
            worker,
        });
        inner.enabled = true;
        info!(
            "stream session started: {} {}x{} @{}fps audio={}",
            self.settings.url, self.settings.width, self.settings.height, self.settings.frame_rate, self.settings.audio
        );
        Ok(())
    }

    /// Close the session's channels and wait for its thread, interrupting the
    /// encoder if it does not wind down within `STOP_GRACE`.
    fn finish(&self, session: Session) {
        let Session {
            video,
            audio,
            interrupt,
            worker,
            dropped,
            ..
        } = session;
        drop(video);
        drop(audio);

        let deadline = Instant::now() + STOP_GRACE;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if !worker.is_finished() {
            if let Some(interrupt) = interrupt {
                warn!("stream encoder stalled, interrupting");
                interrupt();
            }
        }
        match worker.join() {
            Ok(encoder) => lock(&self.inner).idle = Some(encoder),
            Err(_) => error!("stream encoder thread panicked"),
        }
        info!("stream session stopped ({} frame(s) dropped behind the encoder)", dropped);
    }

    pub fn set_network_available(&self, available: bool) {
        let mut inner = lock(&self.inner);
        if inner.network_available != available {
            debug!("stream gate network available: {}", available);
            inner.network_available = available;
        }
    }

    pub fn network_available(&self) -> bool {
        lock(&self.inner).network_available
    }

    /// Whether a pushed frame would currently be delivered.
    pub fn is_open(&self) -> bool {
        lock(&self.inner).open()
    }

    /// Streaming flag reported in the device status. Clears by itself when
    /// the encoder gives up.
    pub fn is_streaming(&self) -> bool {
        let inner = lock(&self.inner);
        inner.enabled && inner.live()
    }

    /// Hand `frame` to the encoder if the gate is open. Returns `false` when
    /// the gate is shut or the encoder is still busy with the previous frame.
    pub fn offer(&self, frame: StreamFrame) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.open() {
            return false;
        }
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        let ts = session.next_timestamp(frame.captured_at);
        match session.video.try_send((frame.image.into_raw(), ts)) {
            Ok(()) => true,
            Err(_) => {
                session.dropped += 1;
                false
            }
        }
    }

    /// Hand microphone samples to the encoder. Dropped when the gate is shut,
    /// the session has no audio track or the audio queue is full.
    pub fn offer_audio(&self, samples: Vec<i16>) -> bool {
        if !self.settings.audio {
            return false;
        }
        let inner = lock(&self.inner);
        if !inner.open() {
            return false;
        }
        inner
            .session
            .as_ref()
            .is_some_and(|session| session.audio.try_send(samples).is_ok())
    }

    /// Stop any live session. Safe to call repeatedly.
    pub fn close(&self) {
        let _transition = lock(&self.transitions);
        let session = {
            let mut inner = lock(&self.inner);
            inner.enabled = false;
            inner.session.take()
        };
        if let Some(session) = session {
            self.finish(session);
        }
    }
}

// ── ffmpeg-backed encoder ────────────────────────────────────────────────────

/// Samples waiting for ffmpeg's audio input, written by their own thread.
struct AudioPipe {
    tx: Sender<Vec<i16>>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Pipes gray rawvideo into an `ffmpeg` child that publishes FLV/H.264.
/// With audio on, s16le mono samples reach the same child over a loopback
/// TCP connection it opens as its second input and are encoded as AAC.
pub struct FfmpegStreamEncoder {
    binary: String,
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<ChildStdin>,
    audio: Option<AudioPipe>,
    frame_len: usize,
    last_ts: Option<u64>,
}

impl Default for FfmpegStreamEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegStreamEncoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            child: None,
            stdin: None,
            audio: None,
            frame_len: 0,
            last_ts: None,
        }
    }

    fn args(settings: &StreamSettings, audio_port: Option<u16>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "gray".into(),
            "-s".into(),
            format!("{}x{}", settings.width, settings.height),
            "-r".into(),
            settings.frame_rate.max(1).to_string(),
            "-i".into(),
            "-".into(),
        ];
        if let Some(port) = audio_port {
            args.extend([
                "-f".into(),
                "s16le".into(),
                "-ar".into(),
                settings.sample_rate.to_string(),
                "-ac".into(),
                "1".into(),
                "-i".into(),
                format!("tcp://127.0.0.1:{port}"),
                "-map".into(),
                "0:v".into(),
                "-map".into(),
                "1:a".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "64k".into(),
            ]);
        }
        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-f".into(),
            "flv".into(),
            settings.url.clone(),
        ]);
        args
    }

    fn open_audio_pipe() -> DeviceResult<(AudioPipe, u16)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .map_err(|e| DeviceError::StreamEncoder(format!("audio listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| DeviceError::StreamEncoder(format!("audio listener: {e}")))?
            .port();

        let (tx, rx) = flume::bounded(AUDIO_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));
        let writer_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("stream-audio".into())
            .spawn(move || feed_audio(listener, rx, writer_stop))
            .map_err(|e| DeviceError::StreamEncoder(format!("audio thread: {e}")))?;
        Ok((AudioPipe { tx, stop, handle }, port))
    }

    fn check_running(&self) -> DeviceResult<()> {
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| DeviceError::StreamEncoder("encoder not started".into()))?;
        match lock(child).try_wait() {
            Ok(Some(status)) => Err(DeviceError::StreamEncoder(format!("ffmpeg exited ({status})"))),
            _ => Ok(()),
        }
    }
}

/// Wait for ffmpeg to connect, then copy sample chunks until the queue closes
/// or the connection breaks.
fn feed_audio(listener: TcpListener, rx: Receiver<Vec<i16>>, stop: Arc<AtomicBool>) {
    let Some(mut socket) = accept_audio(&listener, &stop) else {
        return;
    };
    for chunk in rx.iter() {
        let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
        if let Err(e) = socket.write_all(&bytes) {
            debug!("audio pipe closed: {}", e);
            break;
        }
    }
}

fn accept_audio(listener: &TcpListener, stop: &AtomicBool) -> Option<TcpStream> {
    loop {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        match listener.accept() {
            Ok((socket, _)) => {
                if let Err(e) = socket.set_nonblocking(false) {
                    warn!("audio pipe: {}", e);
                    return None;
                }
                return Some(socket);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                warn!("audio pipe accept failed: {}", e);
                return None;
            }
        }
    }
}

impl StreamEncoder for FfmpegStreamEncoder {
    fn start(&mut self, settings: &StreamSettings) -> DeviceResult<()> {
        self.stop();
        if settings.url.is_empty() {
            return Err(DeviceError::ResourceUnavailable("no stream url configured".into()));
        }

        let (audio, audio_port) = if settings.audio {
            let (pipe, port) = Self::open_audio_pipe()?;
            (Some(pipe), Some(port))
        } else {
            (None, None)
        };

        let spawned = Command::new(&self.binary)
            .args(Self::args(settings, audio_port))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if let Some(pipe) = audio {
                    pipe.stop.store(true, Ordering::SeqCst);
                    let _ = pipe.handle.join();
                }
                return Err(DeviceError::StreamEncoder(format!("failed to spawn {}: {}", self.binary, e)));
            }
        };

        self.stdin = child.stdin.take();
        self.child = Some(Arc::new(Mutex::new(child)));
        self.audio = audio;
        self.frame_len = settings.width as usize * settings.height as usize;
        self.last_ts = None;
        Ok(())
    }

    fn push_video_frame(&mut self, gray: &[u8], timestamp_micros: u64) -> DeviceResult<()> {
        self.check_running()?;
        if let Some(last) = self.last_ts {
            if timestamp_micros <= last {
                return Err(DeviceError::StreamEncoder(format!(
                    "timestamp {} not after {}",
                    timestamp_micros, last
                )));
            }
        }
        if gray.len() != self.frame_len {
            return Err(DeviceError::StreamEncoder(format!(
                "frame is {} bytes, encoder expects {}",
                gray.len(),
                self.frame_len
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| DeviceError::StreamEncoder("encoder not started".into()))?;
        stdin
            .write_all(gray)
            .map_err(|e| DeviceError::StreamEncoder(format!("ffmpeg pipe: {}", e)))?;
        self.last_ts = Some(timestamp_micros);
        Ok(())
    }

    fn push_audio_samples(&mut self, samples: &[i16]) -> DeviceResult<()> {
        self.check_running()?;
        let pipe = self
            .audio
            .as_ref()
            .ok_or_else(|| DeviceError::StreamEncoder("session has no audio input".into()))?;
        match pipe.tx.try_send(samples.to_vec()) {
            Ok(()) | Err(flume::TrySendError::Full(_)) => Ok(()),
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(DeviceError::StreamEncoder("audio pipe closed".into()))
            }
        }
    }

    fn stop(&mut self) {
        // End of both inputs lets ffmpeg flush and exit on its own.
        drop(self.stdin.take());
        let audio = self.audio.take();
        let audio_thread = audio.map(|AudioPipe { tx, stop, handle }| {
            stop.store(true, Ordering::SeqCst);
            drop(tx);
            handle
        });

        if let Some(child) = self.child.take() {
            let mut child = lock(&child);
            for _ in 0..10 {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            if !matches!(child.try_wait(), Ok(Some(_))) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        if let Some(handle) = audio_thread {
            let _ = handle.join();
        }
        self.last_ts = None;
    }

    fn interrupter(&self) -> Option<Box<dyn Fn() + Send + Sync>> {
        let child = Arc::clone(self.child.as_ref()?);
        Some(Box::new(move || {
            let _ = lock(&child).kill();
        }))
    }
}

impl Drop for FfmpegStreamEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}
