/// Alarm — Silent/Sounding state machine over a continuous tone.
///
/// The tone itself comes from a `ToneGenerator`; `RodioTone` plays a sine
/// wave through the default audio output, `SilentTone` is used when the host
/// has no audio device.

use rodio::source::{SineWave, Source};
use rodio::{OutputStream, Sink};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};

/// Tone output consumed by the alarm. Must tolerate redundant calls.
pub trait ToneGenerator: Send + Sync {
    fn play(&self);
    fn pause(&self);
    fn is_playing(&self) -> bool;
    /// Release the audio device. Called once by `AlertController::close`.
    fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Silent,
    Sounding,
}

struct AlertInner {
    state: AlertState,
    tone: Option<Box<dyn ToneGenerator>>,
}

/// Alarm controller. Every check-and-set runs under one lock so concurrent
/// callers (pipeline and command channel) cannot double-trigger the tone.
pub struct AlertController {
    inner: Mutex<AlertInner>,
}

impl AlertController {
    pub fn new(tone: Box<dyn ToneGenerator>) -> Self {
        Self {
            inner: Mutex::new(AlertInner {
                state: AlertState::Silent,
                tone: Some(tone),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AlertInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> AlertState {
        self.lock().state
    }

    pub fn is_sounding(&self) -> bool {
        self.state() == AlertState::Sounding
    }

    /// `Silent → Sounding`. Returns whether a transition happened.
    pub fn activate_alarm(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == AlertState::Sounding {
            return false;
        }
        match inner.tone.as_ref() {
            Some(tone) => tone.play(),
            None => {
                warn!("alarm requested after close, ignoring");
                return false;
            }
        }
        inner.state = AlertState::Sounding;
        info!("alarm sounding");
        true
    }

    /// `Sounding → Silent`. Returns whether a transition happened.
    pub fn deactivate_alarm(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == AlertState::Silent {
            return false;
        }
        if let Some(tone) = inner.tone.as_ref() {
            tone.pause();
        }
        inner.state = AlertState::Silent;
        info!("alarm silenced");
        true
    }

    /// Automatic policy: with auto-warning on, the alarm follows the motion
    /// verdict of every cycle. With it off, motion never touches the alarm.
    pub fn apply_motion(&self, moved: bool, auto_warning: bool) {
        if !auto_warning {
            return;
        }
        if moved {
            self.activate_alarm();
        } else {
            self.deactivate_alarm();
        }
    }

    /// Silence and release the tone generator. Safe to call repeatedly.
    pub fn close(&self) {
        let mut inner = self.lock();
        if let Some(tone) = inner.tone.take() {
            if inner.state == AlertState::Sounding {
                tone.pause();
            }
            tone.close();
            debug!("alarm tone released");
        }
        inner.state = AlertState::Silent;
    }
}

// ── Tone generators ──────────────────────────────────────────────────────────

/// No audio output; only tracks the logical state.
#[derive(Debug, Default)]
pub struct SilentTone {
    playing: std::sync::atomic::AtomicBool,
}

impl ToneGenerator for SilentTone {
    fn play(&self) {
        self.playing.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn pause(&self) {
        self.playing.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Continuous sine tone through the default audio output.
///
/// The output stream is not `Send`, so it lives on its own thread; only the
/// sink (which is) is shared.
pub struct RodioTone {
    sink: Arc<Sink>,
    shutdown_tx: Mutex<Option<flume::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RodioTone {
    pub fn open(frequency_hz: f32, volume: f32) -> DeviceResult<Self> {
        let (ready_tx, ready_rx) = flume::bounded::<Result<Arc<Sink>, String>>(1);
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("alarm-tone".into())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Cannot open audio output: {e}")));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => Arc::new(sink),
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Cannot create audio sink: {e}")));
                        return;
                    }
                };
                sink.pause();
                sink.set_volume(volume.clamp(0.0, 1.0));
                sink.append(SineWave::new(frequency_hz).amplify(1.0));
                let _ = ready_tx.send(Ok(Arc::clone(&sink)));

                // Hold the stream open until closed.
                let _ = shutdown_rx.recv();
                sink.stop();
            })
            .map_err(|e| DeviceError::ResourceUnavailable(format!("alarm thread: {e}")))?;

        let sink = ready_rx
            .recv()
            .map_err(|_| DeviceError::ResourceUnavailable("alarm thread exited early".into()))?
            .map_err(DeviceError::ResourceUnavailable)?;

        info!("alarm tone ready at {} Hz", frequency_hz);
        Ok(Self {
            sink,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl ToneGenerator for RodioTone {
    fn play(&self) {
        self.sink.play();
    }

    fn pause(&self) {
        self.sink.pause();
    }

    fn is_playing(&self) -> bool {
        !self.sink.is_paused()
    }

    fn close(&self) {
        self.sink.pause();
        if let Some(tx) = self.shutdown_tx.lock().ok().and_then(|mut g| g.take()) {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.lock().ok().and_then(|mut g| g.take()) {
            if handle.join().is_err() {
                warn!("alarm tone thread panicked");
            }
        }
    }
}

impl Drop for RodioTone {
    fn drop(&mut self) {
        ToneGenerator::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        plays: AtomicUsize,
        pauses: AtomicUsize,
        closes: AtomicUsize,
        playing: AtomicBool,
    }

    struct Shared(Arc<Counting>);

    impl ToneGenerator for Shared {
        fn play(&self) {
            self.0.plays.fetch_add(1, Ordering::SeqCst);
            self.0.playing.store(true, Ordering::SeqCst);
        }
        fn pause(&self) {
            self.0.pauses.fetch_add(1, Ordering::SeqCst);
            self.0.playing.store(false, Ordering::SeqCst);
        }
        fn is_playing(&self) -> bool {
            self.0.playing.load(Ordering::SeqCst)
        }
        fn close(&self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller() -> (AlertController, Arc<Counting>) {
        let counts = Arc::new(Counting::default());
        (AlertController::new(Box::new(Shared(Arc::clone(&counts)))), counts)
    }

    #[test]
    fn activate_twice_plays_once() {
        let (alert, counts) = controller();
        assert!(alert.activate_alarm());
        assert!(!alert.activate_alarm());
        assert_eq!(counts.plays.load(Ordering::SeqCst), 1);
        assert_eq!(alert.state(), AlertState::Sounding);
    }

    #[test]
    fn deactivate_is_idempotent() {
        let (alert, counts) = controller();
        assert!(!alert.deactivate_alarm());
        assert_eq!(counts.pauses.load(Ordering::SeqCst), 0);

        alert.activate_alarm();
        assert!(alert.deactivate_alarm());
        assert!(!alert.deactivate_alarm());
        assert_eq!(counts.pauses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn motion_only_drives_alarm_with_auto_warning() {
        let (alert, counts) = controller();
        alert.apply_motion(true, false);
        assert!(!alert.is_sounding());

        alert.apply_motion(true, true);
        alert.apply_motion(true, true);
        assert!(alert.is_sounding());
        assert_eq!(counts.plays.load(Ordering::SeqCst), 1);

        alert.apply_motion(false, true);
        assert!(!alert.is_sounding());
    }

    #[test]
    fn concurrent_activation_plays_once() {
        let (alert, counts) = controller();
        let alert = Arc::new(alert);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let alert = Arc::clone(&alert);
                std::thread::spawn(move || {
                    alert.activate_alarm();
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(counts.plays.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_silences_and_releases_once() {
        let (alert, counts) = controller();
        alert.activate_alarm();
        alert.close();
        alert.close();
        assert_eq!(alert.state(), AlertState::Silent);
        assert_eq!(counts.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(counts.closes.load(Ordering::SeqCst), 1);
        assert!(!alert.activate_alarm());
    }

    #[test]
    fn silent_tone_tracks_state() {
        let tone = SilentTone::default();
        assert!(!tone.is_playing());
        tone.play();
        tone.play();
        assert!(tone.is_playing());
        tone.pause();
        assert!(!tone.is_playing());
    }
}
