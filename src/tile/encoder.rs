//! JPEG encoder for stitched pages.
//!
//! # Design Decisions
//!
//! - **JPEG output only**: pages are delivered in one widely supported lossy
//!   format; quality is configurable per request.
//!
//! - **Decode by sniffing**: tiles may be JPEG or PNG regardless of what the
//!   source declares, so decoding guesses the format from the bytes.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};

use crate::error::StitchError;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

// =============================================================================
// JPEG Encoder
// =============================================================================

/// Encodes composited canvases as JPEG.
#[derive(Debug, Clone, Copy)]
pub struct JpegPageEncoder {
    quality: u8,
}

impl Default for JpegPageEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl JpegPageEncoder {
    /// Create an encoder; `quality` is clamped to 1-100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: clamp_quality(quality),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode an RGB canvas.
    pub fn encode(&self, canvas: &RgbImage) -> Result<Bytes, StitchError> {
        let mut output = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut output, self.quality);

        encoder
            .encode_image(canvas)
            .map_err(|e| StitchError::Encode(e.to_string()))?;

        Ok(Bytes::from(output))
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Decode a JPEG or PNG tile into RGB pixels.
pub fn decode_rgb(source: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(source)?.to_rgb8())
}

/// Get image dimensions without fully decoding.
pub fn dimensions(source: &[u8]) -> Result<(u32, u32), image::ImageError> {
    ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .into_dimensions()
}

/// Clamp quality to valid range.
///
/// Values below 1 become 1, values above 100 become 100.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
}

// =============================================================================
// Tests
// =============================================================================
