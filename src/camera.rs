/// Camera session — owns the capture thread.
///
/// Lifecycle: `Closed → Opening → Streaming → (Error | Closed)`.
/// The capture thread pulls frames from a `FrameSource`, drops arrivals that
/// exceed the frame rate and leaves the survivors in the `LatestFrameSlot`.

use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::dispatcher::CameraControl;
use crate::error::{DeviceError, DeviceResult};
use crate::frame::{BufferLedger, PixelFormat, RawFrame};
use crate::frame_slot::{AdmissionControl, LatestFrameSlot};
use crate::motion::DetectorState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraState {
    Closed,
    Opening,
    Streaming,
    Error(String),
}

/// Produces raw frames. `next_frame` may block until one is available.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> DeviceResult<RawFrame>;

    /// Callback that unblocks a pending `next_frame` from another thread.
    fn interrupter(&self) -> Option<Box<dyn Fn() + Send + Sync>> {
        None
    }
}

/// Opens frame sources on demand.
pub trait SourceOpener: Send + Sync {
    /// Check that a source can exist at all. Failing here aborts startup.
    fn check_available(&self) -> DeviceResult<()>;
    fn open(&self, flash_light: bool) -> DeviceResult<Box<dyn FrameSource>>;
}

/// Capture reconnect policy after a read failure.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    interrupt: Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>>,
    handle: JoinHandle<()>,
    flash_light: bool,
}

pub struct CameraSession {
    opener: Arc<dyn SourceOpener>,
    slot: LatestFrameSlot,
    detector: Arc<Mutex<DetectorState>>,
    frame_rate: u32,
    reconnect: ReconnectPolicy,
    ledger: Option<BufferLedger>,
    state: Arc<Mutex<CameraState>>,
    capture: Mutex<Option<CaptureThread>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CameraSession {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        slot: LatestFrameSlot,
        detector: Arc<Mutex<DetectorState>>,
        frame_rate: u32,
    ) -> Self {
        Self {
            opener,
            slot,
            detector,
            frame_rate: frame_rate.max(1),
            reconnect: ReconnectPolicy::default(),
            ledger: None,
            state: Arc::new(Mutex::new(CameraState::Closed)),
            capture: Mutex::new(None),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Captured frames are counted in `ledger` until dropped.
    pub fn with_ledger(mut self, ledger: BufferLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn state(&self) -> CameraState {
        lock(&self.state).clone()
    }

    fn set_state(&self, state: CameraState) {
        *lock(&self.state) = state;
    }

    fn stop_capture(capture: CaptureThread) {
        capture.stop.store(true, Ordering::SeqCst);
        if let Some(interrupt) = lock(&capture.interrupt).as_ref() {
            interrupt();
        }
        if capture.handle.join().is_err() {
            error!("capture thread panicked");
        }
    }

    fn spawn_capture(&self, source: Box<dyn FrameSource>, flash_light: bool) -> DeviceResult<CaptureThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let interrupt = Arc::new(Mutex::new(source.interrupter()));

        let worker = CaptureWorker {
            opener: Arc::clone(&self.opener),
            slot: self.slot.clone(),
            state: Arc::clone(&self.state),
            stop: Arc::clone(&stop),
            interrupt: Arc::clone(&interrupt),
            ledger: self.ledger.clone(),
            admission: AdmissionControl::new(self.frame_rate),
            reconnect: self.reconnect,
            flash_light,
        };

        let handle = std::thread::Builder::new()
            .name("camera-capture".into())
            .spawn(move || worker.run(source))
            .map_err(|e| DeviceError::ResourceUnavailable(format!("capture thread: {e}")))?;

        Ok(CaptureThread {
            stop,
            interrupt,
            handle,
            flash_light,
        })
    }
}

impl CameraControl for CameraSession {
    fn open(&self, flash_light: bool) -> DeviceResult<()> {
        let mut capture = lock(&self.capture);

        if let Some(running) = capture.as_ref() {
            if running.flash_light == flash_light && self.state() == CameraState::Streaming {
                return Ok(());
            }
        }
        if let Some(previous) = capture.take() {
            Self::stop_capture(previous);
        }

        self.set_state(CameraState::Opening);
        let source = match self.opener.open(flash_light) {
            Ok(source) => source,
            Err(e) => {
                self.set_state(CameraState::Error(e.to_string()));
                return Err(e);
            }
        };

        match self.spawn_capture(source, flash_light) {
            Ok(thread) => {
                *capture = Some(thread);
                self.set_state(CameraState::Streaming);
                info!("camera streaming (flash_light={})", flash_light);
                Ok(())
            }
            Err(e) => {
                self.set_state(CameraState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn close(&self) {
        let mut capture = lock(&self.capture);
        if let Some(running) = capture.take() {
            Self::stop_capture(running);
            info!("camera closed");
        }
        // Closed before the detector is cleared, so an in-flight detection
        // cycle discards its frame instead of retaining it.
        self.set_state(CameraState::Closed);
        let dropped = self.slot.clear();
        if dropped > 0 {
            debug!("released {} pending frame(s)", dropped);
        }
        lock(&self.detector).clear();
    }

    fn is_on(&self) -> bool {
        self.state() == CameraState::Streaming
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        CameraControl::close(self);
    }
}

struct CaptureWorker {
    opener: Arc<dyn SourceOpener>,
    slot: LatestFrameSlot,
    state: Arc<Mutex<CameraState>>,
    stop: Arc<AtomicBool>,
    interrupt: Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>>,
    ledger: Option<BufferLedger>,
    admission: AdmissionControl,
    reconnect: ReconnectPolicy,
    flash_light: bool,
}

impl CaptureWorker {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn run(mut self, mut source: Box<dyn FrameSource>) {
        while !self.stopped() {
            match source.next_frame() {
                Ok(frame) => {
                    if !self.admission.admit(frame.captured_at) {
                        continue;
                    }
                    let frame = match &self.ledger {
                        Some(ledger) => frame.leased(ledger),
                        None => frame,
                    };
                    self.slot.offer(frame);
                }
                Err(e) => {
                    if self.stopped() {
                        break;
                    }
                    warn!("capture error: {}, reconnecting", e);
                    match self.reopen() {
                        Some(next) => source = next,
                        None => break,
                    }
                }
            }
        }
        debug!("capture thread exiting");
    }

    /// Sleep in short slices so a stop request is honoured promptly.
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.stopped() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20).min(total));
        }
        !self.stopped()
    }

    fn reopen(&mut self) -> Option<Box<dyn FrameSource>> {
        let mut delay = self.reconnect.initial_delay;
        let mut last_error = String::from("reconnect disabled");
        for attempt in 1..=self.reconnect.attempts {
            if !self.sleep(delay) {
                return None;
            }
            match self.opener.open(self.flash_light) {
                Ok(source) => {
                    *lock(&self.interrupt) = source.interrupter();
                    self.admission.reset();
                    info!("camera reconnected (attempt {})", attempt);
                    return Some(source);
                }
                Err(e) => {
                    error!("reconnect attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                    delay = (delay * 2).min(self.reconnect.max_delay);
                }
            }
        }
        if !self.stopped() {
            *lock(&self.state) = CameraState::Error(last_error);
        }
        None
    }
}

// ── ffmpeg-backed source ─────────────────────────────────────────────────────

/// What ffmpeg should read and the frame geometry it should produce.
#[derive(Debug, Clone)]
pub struct FfmpegInput {
    pub binary: String,
    /// URL, file or device path.
    pub source: String,
    /// Demuxer passed as `-f` (e.g. `v4l2`), if any.
    pub input_format: Option<String>,
    /// Planar layout requested from ffmpeg.
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl FfmpegInput {
    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if let Some(format) = &self.input_format {
            args.push("-f".into());
            args.push(format.clone());
        }
        args.extend([
            "-i".into(),
            self.source.clone(),
            "-vf".into(),
            format!("scale={}:{}", self.width, self.height),
            "-pix_fmt".into(),
            ffmpeg_pix_fmt(self.pixel_format).into(),
            "-f".into(),
            "rawvideo".into(),
            "-".into(),
        ]);
        args
    }
}

fn ffmpeg_pix_fmt(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::I420 => "yuv420p",
        PixelFormat::Nv12 => "nv12",
        PixelFormat::Nv21 => "nv21",
    }
}

/// Reads planar 4:2:0 frames from an ffmpeg child's stdout.
pub struct FfmpegFrameSource {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl FfmpegFrameSource {
    pub fn spawn(input: &FfmpegInput) -> DeviceResult<Self> {
        if input.width % 2 != 0 || input.height % 2 != 0 || input.width == 0 || input.height == 0 {
            return Err(DeviceError::ResourceUnavailable(format!(
                "capture size {}x{} must be even and non-zero",
                input.width, input.height
            )));
        }

        info!("opening camera {} via {}", input.source, input.binary);
        let mut child = Command::new(&input.binary)
            .args(input.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| DeviceError::ResourceUnavailable(format!("failed to spawn {}: {}", input.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::ResourceUnavailable("ffmpeg stdout not captured".into()))?;

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdout,
            format: input.pixel_format,
            width: input.width,
            height: input.height,
        })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn next_frame(&mut self) -> DeviceResult<RawFrame> {
        let luma_len = self.width as usize * self.height as usize;
        let chroma_len = self.format.chroma_len(self.width, self.height);

        let mut luma = vec![0u8; luma_len];
        let mut chroma = vec![0u8; chroma_len];
        self.stdout
            .read_exact(&mut luma)
            .and_then(|_| self.stdout.read_exact(&mut chroma))
            .map_err(|e| DeviceError::ResourceUnavailable(format!("camera stream ended: {e}")))?;

        Ok(RawFrame::new(
            self.width,
            self.height,
            self.format,
            luma,
            chroma,
            Instant::now(),
        ))
    }

    fn interrupter(&self) -> Option<Box<dyn Fn() + Send + Sync>> {
        let child = Arc::clone(&self.child);
        Some(Box::new(move || {
            let _ = lock(&child).kill();
        }))
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        let mut child = lock(&self.child);
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Opens `FfmpegFrameSource`s for a fixed input.
pub struct FfmpegOpener {
    input: FfmpegInput,
}

impl FfmpegOpener {
    pub fn new(input: FfmpegInput) -> Self {
        Self { input }
    }
}

impl SourceOpener for FfmpegOpener {
    fn check_available(&self) -> DeviceResult<()> {
        if self.input.source.is_empty() {
            return Err(DeviceError::NoCamera);
        }
        if self.input.source.starts_with("/dev/") && !Path::new(&self.input.source).exists() {
            return Err(DeviceError::CameraNotExist(self.input.source.clone()));
        }
        let status = Command::new(&self.input.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| DeviceError::ResourceUnavailable(format!("{} not runnable: {}", self.input.binary, e)))?;
        if !status.success() {
            return Err(DeviceError::ResourceUnavailable(format!(
                "{} -version exited with {}",
                self.input.binary, status
            )));
        }
        Ok(())
    }

    fn open(&self, flash_light: bool) -> DeviceResult<Box<dyn FrameSource>> {
        if flash_light {
            debug!("flash light requested; ffmpeg sources have no torch control");
        }
        Ok(Box::new(FfmpegFrameSource::spawn(&self.input)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::DetectorSettings;
    use std::sync::atomic::AtomicUsize;

    /// Emits small gray frames with real timestamps spaced `step` apart.
    struct Synthetic {
        next_at: Instant,
        step: Duration,
        fail_after: Option<usize>,
        produced: usize,
    }

    impl FrameSource for Synthetic {
        fn next_frame(&mut self) -> DeviceResult<RawFrame> {
            if let Some(limit) = self.fail_after {
                if self.produced >= limit {
                    return Err(DeviceError::ResourceUnavailable("unplugged".into()));
                }
            }
            self.produced += 1;
            std::thread::sleep(Duration::from_millis(1));
            let at = self.next_at;
            self.next_at += self.step;
            Ok(RawFrame::new(4, 4, PixelFormat::I420, vec![60; 16], vec![128; 8], at))
        }
    }

    struct Opener {
        opens: AtomicUsize,
        fail_after: Option<usize>,
        refuse_reopen: bool,
    }

    impl SourceOpener for Opener {
        fn check_available(&self) -> DeviceResult<()> {
            Ok(())
        }
        fn open(&self, _flash_light: bool) -> DeviceResult<Box<dyn FrameSource>> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse_reopen && n > 0 {
                return Err(DeviceError::NoCamera);
            }
            Ok(Box::new(Synthetic {
                next_at: Instant::now(),
                step: Duration::from_millis(250),
                fail_after: self.fail_after,
                produced: 0,
            }))
        }
    }

    fn session(fail_after: Option<usize>, refuse_reopen: bool) -> (CameraSession, Arc<Opener>, BufferLedger) {
        let opener = Arc::new(Opener {
            opens: AtomicUsize::new(0),
            fail_after,
            refuse_reopen,
        });
        let ledger = BufferLedger::new();
        let detector = Arc::new(Mutex::new(DetectorState::new(DetectorSettings::default())));
        let session = CameraSession::new(opener.clone(), LatestFrameSlot::new(), detector, 10)
            .with_ledger(ledger.clone())
            .with_reconnect(ReconnectPolicy {
                attempts: 2,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            });
        (session, opener, ledger)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn open_streams_frames_into_slot() {
        let (session, _, _) = session(None, false);
        assert_eq!(session.state(), CameraState::Closed);
        session.open(false).unwrap();
        assert!(session.is_on());
        assert!(session.slot.recv_timeout(Duration::from_secs(3)).is_some());
    }

    #[test]
    fn reopen_with_same_flash_is_noop() {
        let (session, opener, _) = session(None, false);
        session.open(true).unwrap();
        session.open(true).unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        session.open(false).unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_releases_every_buffer() {
        let (session, _, ledger) = session(None, false);
        session.open(false).unwrap();
        assert!(wait_for(|| ledger.live() > 0));
        session.close();
        assert_eq!(session.state(), CameraState::Closed);
        assert_eq!(ledger.live(), 0);
        session.close();
        assert!(!session.is_on());
    }

    #[test]
    fn lost_source_is_reconnected() {
        let (session, opener, _) = session(Some(2), false);
        session.open(false).unwrap();
        assert!(wait_for(|| opener.opens.load(Ordering::SeqCst) >= 2));
        session.close();
    }

    #[test]
    fn unrecoverable_source_ends_in_error() {
        let (session, _, _) = session(Some(1), true);
        session.open(false).unwrap();
        assert!(wait_for(|| matches!(session.state(), CameraState::Error(_))));
        assert!(!session.is_on());
        session.close();
        assert_eq!(session.state(), CameraState::Closed);
    }

    #[test]
    fn ffmpeg_args_request_raw_yuv() {
        let input = FfmpegInput {
            binary: "ffmpeg".into(),
            source: "/dev/video0".into(),
            input_format: Some("v4l2".into()),
            pixel_format: PixelFormat::Nv12,
            width: 640,
            height: 360,
        };
        let joined = input.args().join(" ");
        assert!(joined.contains("-f v4l2 -i /dev/video0"));
        assert!(joined.ends_with("-vf scale=640:360 -pix_fmt nv12 -f rawvideo -"));
    }

    #[test]
    fn missing_device_is_reported_unavailable() {
        let opener = FfmpegOpener::new(FfmpegInput {
            binary: "ffmpeg".into(),
            source: "/dev/housedog-missing-camera".into(),
            input_format: None,
            pixel_format: PixelFormat::I420,
            width: 640,
            height: 360,
        });
        assert!(matches!(opener.check_available(), Err(DeviceError::CameraNotExist(_))));
    }
}
