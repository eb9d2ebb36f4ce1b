//! Still decoding and per-rectangle encoding.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{imageops, ExtendedColorType, ImageEncoder, RgbaImage};

use crate::config::Rotation;
use crate::error::FrameError;
use crate::tiles::{PixelFrame, Rect};

/// Turns an encoded capture into RGBA pixels, applying the device rotation.
pub trait StillDecoder: Send + Sync {
    fn decode(&self, data: &[u8], rotation: Rotation) -> Result<PixelFrame, FrameError>;
}

/// Encodes one rectangle of a frame for the wire.
pub trait RectEncoder: Send + Sync {
    fn encode(&self, frame: &PixelFrame, rect: Rect, quality: u8) -> Result<Bytes, FrameError>;
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decodes PNG (or any format the `image` build supports) captures.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageDecoder;

impl StillDecoder for ImageDecoder {
    fn decode(&self, data: &[u8], rotation: Rotation) -> Result<PixelFrame, FrameError> {
        let rgba = image::load_from_memory(data)?.to_rgba8();
        let rotated = match rotation {
            Rotation::None => rgba,
            Rotation::Cw90 => imageops::rotate90(&rgba),
            Rotation::Cw180 => imageops::rotate180(&rgba),
            Rotation::Cw270 => imageops::rotate270(&rgba),
        };
        Ok(PixelFrame::from(rotated))
    }
}

impl From<RgbaImage> for PixelFrame {
    fn from(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        PixelFrame::new(width, height, img.into_raw())
    }
}

/// PNG-encode a frame. Used by capture fakes and diagnostics.
pub fn encode_png(frame: &PixelFrame) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out).write_image(
        frame.data(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgba8,
    )?;
    Ok(out)
}

// ── Encoding ────────────────────────────────────────────────────────

/// Baseline JPEG per rectangle; alpha is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegRectEncoder;

impl RectEncoder for JpegRectEncoder {
    fn encode(&self, frame: &PixelFrame, rect: Rect, quality: u8) -> Result<Bytes, FrameError> {
        let rgb = frame.crop_rgb(rect);
        let mut out = Cursor::new(Vec::with_capacity(rgb.len() / 8));
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            &rgb,
            rect.width,
            rect.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(Bytes::from(out.into_inner()))
    }
}

/// Uncompressed RGBA rows. Lossless, so clients and tests can compare pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawRgbaEncoder;

impl RectEncoder for RawRgbaEncoder {
    fn encode(&self, frame: &PixelFrame, rect: Rect, _quality: u8) -> Result<Bytes, FrameError> {
        Ok(Bytes::from(frame.crop_rgba(rect)))
    }
}
