/// Frame buffers flowing through the pipeline.
///
/// `RawFrame` is what a frame source hands over, `NormalizedFrame` is what the
/// detector compares. Both can carry a `BufferLease` so tests (and the
/// `status` log line) can see how many pixel buffers are alive.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ── Buffer accounting ────────────────────────────────────────────────────────

/// Shared counter of live pixel buffers.
#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    live: Arc<AtomicUsize>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leased buffers that have not been dropped yet.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn lease(&self) -> BufferLease {
        self.live.fetch_add(1, Ordering::SeqCst);
        BufferLease {
            live: Arc::clone(&self.live),
        }
    }
}

/// Decrements its ledger when dropped together with the buffer it is attached to.
#[derive(Debug)]
pub struct BufferLease {
    live: Arc<AtomicUsize>,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Raw frames ───────────────────────────────────────────────────────────────

/// Planar YUV 4:2:0 layouts a source may deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Chroma plane holds the full U plane followed by the full V plane.
    #[default]
    I420,
    /// Chroma plane holds interleaved U/V pairs.
    Nv12,
    /// Chroma plane holds interleaved V/U pairs (Android camera default).
    Nv21,
}

impl PixelFormat {
    /// Expected chroma plane length for a `width x height` frame.
    pub fn chroma_len(self, width: u32, height: u32) -> usize {
        (width as usize * height as usize) / 2
    }
}

/// Unprocessed sensor output. Owned by exactly one stage at a time.
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub captured_at: Instant,
    luma: Vec<u8>,
    chroma: Vec<u8>,
    _lease: Option<BufferLease>,
}

impl RawFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        luma: Vec<u8>,
        chroma: Vec<u8>,
        captured_at: Instant,
    ) -> Self {
        Self {
            width,
            height,
            format,
            captured_at,
            luma,
            chroma,
            _lease: None,
        }
    }

    /// Attach a lease so the frame shows up in `ledger.live()` until dropped.
    pub fn leased(mut self, ledger: &BufferLedger) -> Self {
        self._lease = Some(ledger.lease());
        self
    }

    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    pub fn chroma(&self) -> &[u8] {
        &self.chroma
    }
}

// ── Normalized frames ────────────────────────────────────────────────────────

/// Downscaled, reoriented, single-channel 8-bit frame.
#[derive(Debug)]
pub struct NormalizedFrame {
    image: GrayImage,
    _lease: Option<BufferLease>,
}

impl NormalizedFrame {
    pub fn from_image(image: GrayImage) -> Self {
        Self {
            image,
            _lease: None,
        }
    }

    pub fn leased(mut self, ledger: &BufferLedger) -> Self {
        self._lease = Some(ledger.lease());
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_follows_frame_lifetime() {
        let ledger = BufferLedger::new();
        let frame = RawFrame::new(2, 2, PixelFormat::I420, vec![0; 4], vec![0; 2], Instant::now())
            .leased(&ledger);
        let normalized = NormalizedFrame::from_image(GrayImage::new(2, 2)).leased(&ledger);
        assert_eq!(ledger.live(), 2);

        drop(frame);
        assert_eq!(ledger.live(), 1);
        drop(normalized);
        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn unleased_frames_are_not_counted() {
        let ledger = BufferLedger::new();
        let _frame = NormalizedFrame::from_image(GrayImage::new(4, 4));
        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn chroma_len_is_half_the_luma() {
        assert_eq!(PixelFormat::Nv21.chroma_len(640, 480), 640 * 480 / 2);
        assert_eq!(PixelFormat::I420.chroma_len(0, 480), 0);
    }

    #[test]
    fn zero_sized_frame_is_empty() {
        let frame = NormalizedFrame::from_image(GrayImage::new(0, 135));
        assert!(frame.is_empty());
    }
}
