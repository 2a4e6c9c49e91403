/// Frame Preprocessing — raw YUV → normalized grayscale
///
/// Fixed step order:
///   1. decode planar YUV 4:2:0 into RGB (BT.601, video range)
///   2. downscale by the integer `scale` factor (linear filter)
///   3. transpose + horizontal mirror (sensor orientation → display orientation)
///   4. grayscale
///
/// Each intermediate image is moved into the next step and dropped there.

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use tracing::trace;

use crate::error::{DeviceError, DeviceResult};
use crate::frame::{BufferLedger, NormalizedFrame, PixelFormat, RawFrame};

/// Gray frame handed to the streaming encoder.
#[derive(Debug)]
pub struct StreamFrame {
    pub image: GrayImage,
    pub captured_at: std::time::Instant,
}

#[derive(Debug, Clone, Default)]
pub struct FramePreprocessor {
    ledger: Option<BufferLedger>,
}

impl FramePreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized frames produced by this preprocessor are counted in `ledger`.
    pub fn with_ledger(ledger: BufferLedger) -> Self {
        Self {
            ledger: Some(ledger),
        }
    }

    pub fn normalize(&self, raw: &RawFrame, scale: u32) -> DeviceResult<NormalizedFrame> {
        validate_layout(raw)?;

        let scale = scale.max(1);
        let (w, h) = (raw.width / scale, raw.height / scale);

        let gray = if w == 0 || h == 0 {
            // Nothing left after downscale; keep the rotated (swapped) shape.
            GrayImage::new(h, w)
        } else {
            let rgb = decode_rgb(raw);
            let small = if scale == 1 {
                rgb
            } else {
                imageops::resize(&rgb, w, h, FilterType::Triangle)
            };
            let rotated = canonical_orientation(&small);
            drop(small);
            imageops::grayscale(&rotated)
        };

        trace!(
            "normalized {}x{} → {}x{} (scale {})",
            raw.width,
            raw.height,
            gray.width(),
            gray.height(),
            scale
        );

        let frame = NormalizedFrame::from_image(gray);
        Ok(match &self.ledger {
            Some(ledger) => frame.leased(ledger),
            None => frame,
        })
    }

    /// Luma-only downscale of the raw frame for the live stream. The luma plane
    /// already is the grayscale picture, so no color decode is needed.
    pub fn stream_frame(&self, raw: &RawFrame, scale: u32) -> DeviceResult<StreamFrame> {
        validate_layout(raw)?;

        let scale = scale.max(1);
        let luma = GrayImage::from_raw(raw.width, raw.height, raw.luma().to_vec()).ok_or_else(
            || unsupported(raw, "luma plane does not fill the frame".to_string()),
        )?;
        let (w, h) = (raw.width / scale, raw.height / scale);
        let image = if scale == 1 || w == 0 || h == 0 {
            luma
        } else {
            imageops::resize(&luma, w, h, FilterType::Triangle)
        };

        Ok(StreamFrame {
            image,
            captured_at: raw.captured_at,
        })
    }
}

/// Transpose followed by a horizontal mirror, i.e. a clockwise quarter turn.
pub fn canonical_orientation(image: &RgbImage) -> RgbImage {
    imageops::rotate90(image)
}

fn unsupported(raw: &RawFrame, reason: String) -> DeviceError {
    DeviceError::UnsupportedFrameFormat {
        format: raw.format,
        width: raw.width,
        height: raw.height,
        reason,
    }
}

fn validate_layout(raw: &RawFrame) -> DeviceResult<()> {
    if raw.width % 2 != 0 || raw.height % 2 != 0 {
        return Err(unsupported(raw, "4:2:0 frames need even dimensions".into()));
    }
    let luma_len = raw.width as usize * raw.height as usize;
    if raw.luma().len() != luma_len {
        return Err(unsupported(
            raw,
            format!("luma plane is {} bytes, expected {}", raw.luma().len(), luma_len),
        ));
    }
    let chroma_len = raw.format.chroma_len(raw.width, raw.height);
    if raw.chroma().len() != chroma_len {
        return Err(unsupported(
            raw,
            format!("chroma plane is {} bytes, expected {}", raw.chroma().len(), chroma_len),
        ));
    }
    Ok(())
}

/// Chroma (u, v) sample covering pixel (x, y).
fn chroma_at(raw: &RawFrame, x: u32, y: u32) -> (u8, u8) {
    let chroma = raw.chroma();
    let (w, h) = (raw.width as usize, raw.height as usize);
    let (cx, cy) = (x as usize / 2, y as usize / 2);
    match raw.format {
        PixelFormat::I420 => {
            let quarter = (w / 2) * (h / 2);
            let idx = cy * (w / 2) + cx;
            (chroma[idx], chroma[quarter + idx])
        }
        PixelFormat::Nv12 => {
            let idx = cy * w + cx * 2;
            (chroma[idx], chroma[idx + 1])
        }
        PixelFormat::Nv21 => {
            let idx = cy * w + cx * 2;
            (chroma[idx + 1], chroma[idx])
        }
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    Rgb([
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ])
}

fn decode_rgb(raw: &RawFrame) -> RgbImage {
    let luma = raw.luma();
    let width = raw.width as usize;
    RgbImage::from_fn(raw.width, raw.height, |x, y| {
        let (u, v) = chroma_at(raw, x, y);
        yuv_to_rgb(luma[y as usize * width + x as usize], u, v)
    })
}
