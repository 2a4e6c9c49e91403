/// Capture → processing hand-off.
///
/// `LatestFrameSlot` is a capacity-1 channel where a new frame replaces the
/// unprocessed one instead of queueing behind it. `AdmissionControl` drops
/// arrivals that come faster than the configured frame rate before any work
/// is spent on them.

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::frame::RawFrame;

#[derive(Clone)]
pub struct LatestFrameSlot {
    tx: Sender<RawFrame>,
    rx: Receiver<RawFrame>,
    replaced: std::sync::Arc<AtomicU64>,
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            tx,
            rx,
            replaced: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Put `frame` in the slot, evicting whatever was waiting there.
    /// Returns `true` when an older frame was replaced.
    pub fn offer(&self, frame: RawFrame) -> bool {
        let mut pending = frame;
        let mut evicted = false;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    if let Ok(stale) = self.rx.try_recv() {
                        trace!("dropping stale frame captured {:?} ago", stale.captured_at.elapsed());
                        self.replaced.fetch_add(1, Ordering::Relaxed);
                        evicted = true;
                    }
                }
                // Both ends live in `self`, so the channel never disconnects.
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Wait up to `timeout` for the latest frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RawFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drop any waiting frame. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.rx.drain().count()
    }

    /// Frames evicted by newer arrivals since creation.
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

/// Minimum inter-arrival gate: `1000 / frame_rate` milliseconds.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    min_interval: Duration,
    last: Option<Instant>,
}

impl AdmissionControl {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(1000 / u64::from(frame_rate.max(1))),
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// `true` if a frame arriving at `at` should be processed.
    pub fn admit(&mut self, at: Instant) -> bool {
        if let Some(last) = self.last {
            if at.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last = Some(at);
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
