/// Frame pipeline — one detection cycle per admitted frame
///
/// Architecture:
///   capture thread (CameraSession)
///     → [LatestFrameSlot, capacity 1, newest wins]
///     → normalize (downscale, rotate, gray)
///     → diff against previous frame
///       → alarm policy (auto-warning)
///       → stream gate (luma downscale → RTMP encoder)
///
/// Every error is local to its cycle: the frame is dropped and the next one
/// is processed as usual.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::alert::AlertController;
use crate::dispatcher::{CameraControl, MotionSettings};
use crate::error::DeviceResult;
use crate::frame::RawFrame;
use crate::frame_slot::LatestFrameSlot;
use crate::motion::{detect, DetectorState};
use crate::preprocess::FramePreprocessor;
use crate::stream_gate::StreamGate;

const SLOT_POLL: Duration = Duration::from_millis(100);

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub moved: bool,
    pub regions: usize,
    pub streamed: bool,
    /// The camera was closed mid-cycle and the frame was discarded.
    pub discarded: bool,
}

pub struct FramePipeline {
    slot: LatestFrameSlot,
    preprocessor: FramePreprocessor,
    detector: Arc<Mutex<DetectorState>>,
    camera: Arc<dyn CameraControl>,
    alert: Arc<AlertController>,
    gate: Arc<StreamGate>,
    motion: Arc<MotionSettings>,
    stream_scale: u32,
}

impl FramePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: LatestFrameSlot,
        preprocessor: FramePreprocessor,
        detector: Arc<Mutex<DetectorState>>,
        camera: Arc<dyn CameraControl>,
        alert: Arc<AlertController>,
        gate: Arc<StreamGate>,
        motion: Arc<MotionSettings>,
        stream_scale: u32,
    ) -> Self {
        Self {
            slot,
            preprocessor,
            detector,
            camera,
            alert,
            gate,
            motion,
            stream_scale: stream_scale.max(1),
        }
    }

    /// Run one cycle on `raw`. The frame is dropped when this returns,
    /// whatever the outcome.
    pub fn process(&self, raw: RawFrame) -> DeviceResult<CycleOutcome> {
        let scale = self
            .detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .settings()
            .scale;
        let normalized = self.preprocessor.normalize(&raw, scale)?;

        let result = {
            let mut state = self.detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Checked under the detector lock: `close` clears the detector
            // after marking the camera off, so nothing is retained past it.
            if !self.camera.is_on() {
                return Ok(CycleOutcome {
                    discarded: true,
                    ..CycleOutcome::default()
                });
            }
            detect(normalized, &mut state)
        };

        self.alert.apply_motion(result.moved, self.motion.auto_warning());

        let streamed = if self.gate.is_open() {
            match self.preprocessor.stream_frame(&raw, self.stream_scale) {
                Ok(frame) => self.gate.offer(frame),
                Err(e) => {
                    warn!("stream frame skipped: {}", e);
                    false
                }
            }
        } else {
            false
        };

        Ok(CycleOutcome {
            moved: result.moved,
            regions: result.regions,
            streamed,
            discarded: false,
        })
    }

    /// Blocking loop: take the latest frame, process it, repeat until `stop`
    /// flips to `true`. Run on a blocking thread.
    pub fn run(&self, stop: watch::Receiver<bool>) {
        info!("frame pipeline running");
        let mut cycles: u64 = 0;
        let mut moved_cycles: u64 = 0;

        while !*stop.borrow() {
            let Some(raw) = self.slot.recv_timeout(SLOT_POLL) else {
                continue;
            };
            match self.process(raw) {
                Ok(outcome) => {
                    cycles += 1;
                    if outcome.moved {
                        moved_cycles += 1;
                        debug!("motion: {} region(s)", outcome.regions);
                    }
                    trace!("cycle {:?}", outcome);
                }
                Err(e) => warn!("frame dropped: {}", e),
            }
        }

        info!(
            "frame pipeline stopped after {} cycles ({} with motion, {} frames replaced)",
            cycles,
            moved_cycles,
            self.slot.replaced()
        );
    }
}
