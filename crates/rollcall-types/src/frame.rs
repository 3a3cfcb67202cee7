use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RollcallError, Result};

/// Bytes per RGBA pixel.
pub const RGBA_CHANNELS: usize = 4;

/// MIME type of every encoded frame.
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// JPEG start-of-image marker followed by the first marker prefix.
pub const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Snapshot of the current stream frame, sized to the stream's resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    /// Raw RGBA pixel buffer, row-major.
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl FrameBuffer {
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    /// Wraps an RGBA buffer, rejecting zero dimensions and short buffers.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        ensure_dimensions(width, height)?;
        let expected = width as usize * height as usize * RGBA_CHANNELS;
        if data.len() != expected {
            return Err(RollcallError::Capture(format!(
                "frame buffer holds {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            captured_at: Utc::now(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Compressed frame ready for upload. Lives for a single request.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub content_type: &'static str,
}

impl EncodedImage {
    pub fn jpeg(bytes: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            bytes,
            width,
            height,
            content_type: JPEG_CONTENT_TYPE,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn has_jpeg_header(&self) -> bool {
        self.bytes.starts_with(&JPEG_SOI)
    }
}

/// Fails with [`RollcallError::EmptyFrame`] when either side is zero.
pub fn ensure_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        Err(RollcallError::EmptyFrame { width, height })
    } else {
        Ok(())
    }
}
