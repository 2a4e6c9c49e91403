/// Motion Detection — single-frame background subtraction
///
/// Compares the current normalized frame against the one retained from the
/// previous cycle: absolute difference, binarize, label connected regions.
/// There is no accumulated background model; only one previous frame is kept.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;
use tracing::debug;

use crate::frame::NormalizedFrame;

/// Tunables read by every detection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSettings {
    /// Integer downsampling factor applied by the preprocessor.
    pub scale: u32,
    /// Pixels whose intensity changed by at least this much are foreground.
    pub diff_threshold: u8,
    /// Smallest region (in pixels) that counts as motion.
    pub min_region_pixels: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            scale: 8,
            diff_threshold: 150,
            min_region_pixels: 1,
        }
    }
}

impl DetectorSettings {
    /// Clamp into the ranges the detector relies on: a zero threshold would
    /// turn identical frames into motion.
    pub fn sanitized(self) -> Self {
        Self {
            scale: self.scale.max(1),
            diff_threshold: self.diff_threshold.max(1),
            min_region_pixels: self.min_region_pixels.max(1),
        }
    }
}

/// The retained previous frame plus the settings it was produced with.
#[derive(Debug, Default)]
pub struct DetectorState {
    previous: Option<NormalizedFrame>,
    settings: DetectorSettings,
}

impl DetectorState {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            previous: None,
            settings: settings.sanitized(),
        }
    }

    pub fn settings(&self) -> DetectorSettings {
        self.settings
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// Release the retained frame.
    pub fn clear(&mut self) {
        self.previous = None;
    }
}

/// Outcome of one detection cycle.
#[derive(Debug)]
pub struct DiffResult {
    pub mask: GrayImage,
    pub moved: bool,
    pub regions: usize,
}

impl DiffResult {
    fn still(mask: GrayImage) -> Self {
        Self {
            mask,
            moved: false,
            regions: 0,
        }
    }
}

/// Compare `curr` against the retained frame and retain `curr` for the next
/// cycle. The slot holds either nothing or a complete frame at every point.
pub fn detect(curr: NormalizedFrame, state: &mut DetectorState) -> DiffResult {
    let (width, height) = curr.dimensions();

    let previous = match state.previous.take() {
        Some(prev) if prev.dimensions() == curr.dimensions() => prev,
        Some(prev) => {
            debug!(
                "frame size changed {:?} → {:?}, restarting comparison",
                prev.dimensions(),
                curr.dimensions()
            );
            state.previous = Some(curr);
            return DiffResult::still(GrayImage::new(width, height));
        }
        None => {
            state.previous = Some(curr);
            return DiffResult::still(GrayImage::new(width, height));
        }
    };

    let settings = state.settings;
    let mask = difference_mask(previous.image(), curr.image(), settings.diff_threshold);
    let regions = count_regions(&mask, settings.min_region_pixels);

    state.previous = Some(curr);
    drop(previous);

    DiffResult {
        mask,
        moved: regions > 0,
        regions,
    }
}

/// `|a - b| >= threshold → 255`, else `0`.
pub fn difference_mask(a: &GrayImage, b: &GrayImage, threshold: u8) -> GrayImage {
    let mut mask = GrayImage::new(a.width(), a.height());
    for ((out, pa), pb) in mask.iter_mut().zip(a.iter()).zip(b.iter()) {
        *out = if pa.abs_diff(*pb) >= threshold { 255 } else { 0 };
    }
    mask
}

/// Number of 8-connected foreground regions with at least `min_pixels` pixels.
pub fn count_regions(mask: &GrayImage, min_pixels: u32) -> usize {
    if mask.width() == 0 || mask.height() == 0 {
        return 0;
    }
    if !mask.iter().any(|&p| p != 0) {
        return 0;
    }

    let labeled = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut area_by_label: HashMap<u32, u32> = HashMap::new();
    for pixel in labeled.pixels() {
        let label = pixel[0];
        if label != 0 {
            *area_by_label.entry(label).or_insert(0) += 1;
        }
    }

    area_by_label
        .values()
        .filter(|&&area| area >= min_pixels.max(1))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> NormalizedFrame {
        NormalizedFrame::from_image(GrayImage::from_pixel(width, height, Luma([value])))
    }

    fn with_block(width: u32, height: u32, base: u8, block: u8, x0: u32, y0: u32, size: u32) -> NormalizedFrame {
        let img = GrayImage::from_fn(width, height, |x, y| {
            if x >= x0 && x < x0 + size && y >= y0 && y < y0 + size {
                Luma([block])
            } else {
                Luma([base])
            }
        });
        NormalizedFrame::from_image(img)
    }

    #[test]
    fn first_cycle_never_moves() {
        let mut state = DetectorState::new(DetectorSettings::default());
        let result = detect(with_block(16, 16, 0, 255, 2, 2, 4), &mut state);
        assert!(!result.moved);
        assert!(state.has_previous());
    }

    #[test]
    fn identical_frames_never_move() {
        for threshold in [1u8, 40, 150, 255] {
            let mut state = DetectorState::new(DetectorSettings {
                diff_threshold: threshold,
                ..DetectorSettings::default()
            });
            detect(flat(12, 20, 77), &mut state);
            let result = detect(flat(12, 20, 77), &mut state);
            assert!(!result.moved, "threshold {threshold}");
            assert_eq!(result.regions, 0);
        }
    }

    #[test]
    fn changed_block_is_motion() {
        let mut state = DetectorState::new(DetectorSettings::default());
        detect(flat(20, 20, 10), &mut state);
        let result = detect(with_block(20, 20, 10, 240, 5, 5, 3), &mut state);
        assert!(result.moved);
        assert_eq!(result.regions, 1);
        assert_eq!(result.mask.get_pixel(6, 6)[0], 255);
        assert_eq!(result.mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut state = DetectorState::new(DetectorSettings {
            diff_threshold: 100,
            ..DetectorSettings::default()
        });
        detect(flat(4, 4, 0), &mut state);
        assert!(detect(flat(4, 4, 100), &mut state).moved);
        assert!(!detect(flat(4, 4, 199), &mut state).moved);
    }

    #[test]
    fn small_regions_are_filtered() {
        let mut state = DetectorState::new(DetectorSettings {
            min_region_pixels: 10,
            ..DetectorSettings::default()
        });
        detect(flat(20, 20, 0), &mut state);
        // 2x2 = 4 pixels, below the minimum.
        assert!(!detect(with_block(20, 20, 0, 255, 1, 1, 2), &mut state).moved);
        // 4x4 = 16 pixels against the previous (which still had the 2x2 block).
        let result = detect(with_block(20, 20, 0, 255, 10, 10, 4), &mut state);
        assert!(result.moved);
        assert_eq!(result.regions, 1);
    }

    #[test]
    fn diagonal_pixels_form_one_region() {
        let mut mask = GrayImage::new(5, 5);
        mask.put_pixel(1, 1, Luma([255]));
        mask.put_pixel(2, 2, Luma([255]));
        mask.put_pixel(4, 0, Luma([255]));
        assert_eq!(count_regions(&mask, 1), 2);
        assert_eq!(count_regions(&mask, 2), 1);
    }

    #[test]
    fn empty_frames_degrade_to_still() {
        let mut state = DetectorState::new(DetectorSettings::default());
        detect(flat(0, 5, 0), &mut state);
        let result = detect(flat(0, 5, 0), &mut state);
        assert!(!result.moved);
        assert_eq!(count_regions(&GrayImage::new(0, 0), 1), 0);
    }

    #[test]
    fn size_change_restarts_comparison() {
        let mut state = DetectorState::new(DetectorSettings::default());
        detect(flat(10, 10, 0), &mut state);
        let result = detect(flat(8, 8, 255), &mut state);
        assert!(!result.moved);
        assert!(detect(flat(8, 8, 0), &mut state).moved);
    }

    #[test]
    fn clear_releases_previous_frame() {
        let mut state = DetectorState::new(DetectorSettings {
            scale: 4,
            diff_threshold: 0,
            min_region_pixels: 0,
        });
        assert_eq!(state.settings().diff_threshold, 1);
        assert_eq!(state.settings().min_region_pixels, 1);
        detect(flat(4, 4, 0), &mut state);
        assert!(state.has_previous());
        state.clear();
        assert!(!state.has_previous());
    }
}
