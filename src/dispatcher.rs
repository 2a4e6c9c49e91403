/// Command dispatcher — binary request in, deterministic reply out.
///
/// Holds no state of its own beyond the motion-detection flags; everything
/// else is read live from the components it drives.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::alert::AlertController;
use crate::error::DeviceResult;
use crate::protocol::{Command, DeviceStatus, MotionFlags, Opcode, NOOP_ACK};
use crate::stream_gate::StreamGate;

/// The camera side of motion detection, as seen by the dispatcher.
pub trait CameraControl: Send + Sync {
    /// Open (or reopen with new flash setting) the capture session.
    fn open(&self, flash_light: bool) -> DeviceResult<()>;
    /// Close the capture session and release detector state.
    fn close(&self);
    fn is_on(&self) -> bool;
}

/// Motion-detection flags shared between the dispatcher and the pipeline.
#[derive(Debug, Default)]
pub struct MotionSettings {
    flags: Mutex<MotionSettingsInner>,
}

#[derive(Debug, Default, Clone, Copy)]
struct MotionSettingsInner {
    flash_light: bool,
    auto_warning: bool,
}

impl MotionSettings {
    pub fn new(flash_light: bool, auto_warning: bool) -> Self {
        Self {
            flags: Mutex::new(MotionSettingsInner {
                flash_light,
                auto_warning,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MotionSettingsInner> {
        self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn flash_light(&self) -> bool {
        self.lock().flash_light
    }

    pub fn auto_warning(&self) -> bool {
        self.lock().auto_warning
    }

    pub fn set_flash_light(&self, on: bool) {
        self.lock().flash_light = on;
    }

    pub fn set_auto_warning(&self, on: bool) {
        self.lock().auto_warning = on;
    }
}

pub struct CommandDispatcher {
    camera: Arc<dyn CameraControl>,
    alert: Arc<AlertController>,
    gate: Arc<StreamGate>,
    motion: Arc<MotionSettings>,
}

impl CommandDispatcher {
    pub fn new(
        camera: Arc<dyn CameraControl>,
        alert: Arc<AlertController>,
        gate: Arc<StreamGate>,
        motion: Arc<MotionSettings>,
    ) -> Self {
        Self {
            camera,
            alert,
            gate,
            motion,
        }
    }

    /// Decode, apply and answer one message. Never fails: anything not
    /// understood gets `[0x00]`.
    pub fn handle(&self, message: &[u8]) -> Vec<u8> {
        let command = match Command::decode(message) {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                return vec![NOOP_ACK];
            }
        };
        debug!("handling {:?} payload={:?}", command.opcode, command.payload);

        match command.opcode {
            Opcode::InspectStatus => self.status().to_reply(),
            _ => {
                if let Err(e) = self.apply(&command) {
                    warn!("{:?} not fully applied: {}", command.opcode, e);
                }
                message.to_vec()
            }
        }
    }

    fn apply(&self, command: &Command<'_>) -> DeviceResult<()> {
        match command.opcode {
            Opcode::MotionDetection => self.apply_motion(MotionFlags::from_bits(command.arg())),
            Opcode::RtmpVideo => self.gate.set_enabled(command.switch_on()),
            Opcode::WarningSound => {
                if command.switch_on() {
                    self.alert.activate_alarm();
                } else {
                    self.alert.deactivate_alarm();
                }
                Ok(())
            }
            Opcode::InspectStatus => Ok(()),
        }
    }

    fn apply_motion(&self, flags: MotionFlags) -> DeviceResult<()> {
        self.motion.set_flash_light(flags.flash_light());

        // Auto-warning is applied before the camera so a camera failure does
        // not leave the alarm policy stale.
        self.motion.set_auto_warning(flags.auto_warning());
        if !flags.auto_warning() {
            self.alert.deactivate_alarm();
        }

        if flags.camera() {
            self.camera.open(flags.flash_light())?;
        } else {
            self.camera.close();
        }
        info!(
            "motion detection: camera={} flash={} auto_warning={}",
            flags.camera(),
            flags.flash_light(),
            flags.auto_warning()
        );
        Ok(())
    }

    /// Fresh read of the live component state.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            streaming: self.gate.is_streaming(),
            alarm: self.alert.is_sounding(),
        }
    }

    /// Live motion-detection flags (camera state read from the session).
    pub fn motion_flags(&self) -> MotionFlags {
        MotionFlags::new(
            self.camera.is_on(),
            self.motion.flash_light(),
            self.motion.auto_warning(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::SilentTone;
    use crate::error::DeviceError;
    use crate::stream_gate::{StreamEncoder, StreamSettings};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeCamera {
        on: AtomicBool,
        flash: AtomicBool,
        opens: AtomicUsize,
        fail: AtomicBool,
    }

    impl CameraControl for FakeCamera {
        fn open(&self, flash_light: bool) -> DeviceResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeviceError::NoCamera);
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.flash.store(flash_light, Ordering::SeqCst);
            self.on.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn close(&self) {
            self.on.store(false, Ordering::SeqCst);
        }
        fn is_on(&self) -> bool {
            self.on.load(Ordering::SeqCst)
        }
    }

    struct NullEncoder;

    impl StreamEncoder for NullEncoder {
        fn start(&mut self, _settings: &StreamSettings) -> DeviceResult<()> {
            Ok(())
        }
        fn push_video_frame(&mut self, _gray: &[u8], _ts: u64) -> DeviceResult<()> {
            Ok(())
        }
        fn push_audio_samples(&mut self, _samples: &[i16]) -> DeviceResult<()> {
            Ok(())
        }
        fn stop(&mut self) {}
    }

    fn dispatcher() -> (CommandDispatcher, Arc<FakeCamera>) {
        let camera = Arc::new(FakeCamera::default());
        let settings = StreamSettings {
            url: "rtmp://localhost/live".into(),
            width: 480,
            height: 270,
            frame_rate: 10,
            sample_rate: 44100,
            audio: false,
        };
        let d = CommandDispatcher::new(
            camera.clone(),
            Arc::new(AlertController::new(Box::new(SilentTone::default()))),
            Arc::new(StreamGate::new(Box::new(NullEncoder), settings)),
            Arc::new(MotionSettings::default()),
        );
        (d, camera)
    }

    #[test]
    fn empty_and_unknown_get_noop_ack() {
        let (d, _) = dispatcher();
        assert_eq!(d.handle(&[]), vec![0x00]);
        assert_eq!(d.handle(&[0x7f, 0x01]), vec![0x00]);
        assert_eq!(d.handle(&[0x00]), vec![0x00]);
    }

    #[test]
    fn warning_sound_toggles_alarm_bit() {
        let (d, _) = dispatcher();
        assert_eq!(d.handle(&[0x03, 0x01]), vec![0x03, 0x01]);
        assert_eq!(d.handle(&[0x04]), vec![0x04, 0b111, 0b10]);
        assert_eq!(d.handle(&[0x03, 0x00]), vec![0x03, 0x00]);
        assert_eq!(d.handle(&[0x04]), vec![0x04, 0b111, 0b00]);
    }

    #[test]
    fn rtmp_video_toggles_streaming_bit() {
        let (d, _) = dispatcher();
        assert_eq!(d.handle(&[0x02, 0x05]), vec![0x02, 0x05]);
        assert!(d.status().streaming);
        assert_eq!(d.handle(&[0x02]), vec![0x02]);
        assert!(!d.status().streaming);
    }

    #[test]
    fn motion_detection_echoes_and_applies() {
        let (d, camera) = dispatcher();
        d.handle(&[0x03, 0x01]);

        assert_eq!(d.handle(&[0x01, 0b101]), vec![0x01, 0b101]);
        assert!(camera.is_on());
        assert_eq!(camera.opens.load(Ordering::SeqCst), 1);
        assert!(!camera.flash.load(Ordering::SeqCst));
        assert_eq!(d.motion_flags().bits(), 0b101);
        // Unrelated alarm bit survives.
        assert_eq!(d.handle(&[0x04]), vec![0x04, 0b111, 0b10]);

        assert_eq!(d.handle(&[0x01]), vec![0x01]);
        assert!(!camera.is_on());
        assert_eq!(d.motion_flags().bits(), 0);
    }

    #[test]
    fn disabling_auto_warning_silences_alarm() {
        let (d, _) = dispatcher();
        d.handle(&[0x01, 0b100]);
        d.handle(&[0x03, 0x01]);
        assert!(d.status().alarm);
        d.handle(&[0x01, 0b001]);
        assert!(!d.status().alarm);
    }

    #[test]
    fn repeated_commands_are_idempotent() {
        let (d, _) = dispatcher();
        for msg in [&[0x01u8, 0b011][..], &[0x02, 0x01], &[0x03, 0x01]] {
            let first = d.handle(msg);
            let status = d.status();
            assert_eq!(d.handle(msg), first);
            assert_eq!(d.status(), status);
        }
    }

    #[test]
    fn camera_failure_still_echoes() {
        let (d, camera) = dispatcher();
        camera.fail.store(true, Ordering::SeqCst);
        assert_eq!(d.handle(&[0x01, 0b111]), vec![0x01, 0b111]);
        assert!(!camera.is_on());
        assert!(d.motion_flags().auto_warning());
    }
}
