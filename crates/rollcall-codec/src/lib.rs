//! Frame encoding, capture archiving and preview down-sampling.

use std::{fs, path::PathBuf};

use chrono::Utc;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, ColorType, ImageBuffer, Rgba};
use rollcall_types::{
    frame::{ensure_dimensions, EncodedImage, FrameBuffer},
    Result, RollcallError,
};
use serde::Serialize;
use tracing::{debug, info};

/// Fixed JPEG quality, the same default a browser canvas uses.
pub const JPEG_QUALITY: u8 = 92;

/// Encodes a frame as JPEG. Identical pixels always give identical bytes.
pub fn encode_frame(frame: &FrameBuffer) -> Result<EncodedImage> {
    let rgba = rgba_buffer(frame)?;
    // JPEG has no alpha channel.
    let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode(rgb.as_raw(), frame.width, frame.height, ColorType::Rgb8)
        .map_err(|err| codec_error(format!("jpeg encoding failed: {err}")))?;

    debug!(
        "Encoded {}x{} frame into {} bytes",
        frame.width,
        frame.height,
        bytes.len()
    );
    Ok(EncodedImage::jpeg(bytes, frame.width, frame.height))
}

fn rgba_buffer(frame: &FrameBuffer) -> Result<ImageBuffer<Rgba<u8>, Vec<u8>>> {
    ensure_dimensions(frame.width, frame.height)?;
    ImageBuffer::<Rgba<u8>, _>::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| codec_error("frame buffer does not match its dimensions"))
}

/// Keeps a copy of every uploaded frame on disk.
#[derive(Debug, Clone)]
pub struct CaptureArchive {
    dir: PathBuf,
}

impl CaptureArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_option(dir: Option<&str>) -> Option<Self> {
        dir.map(Self::new)
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn persist(&self, cycle: u64, image: &EncodedImage) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            codec_error(format!(
                "failed to create capture directory {:?}: {err}",
                self.dir
            ))
        })?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let path = self.dir.join(format!("frame_{timestamp}_{cycle}.jpg"));
        fs::write(&path, &image.bytes)
            .map_err(|err| codec_error(format!("failed to save frame {:?}: {err}", path)))?;
        info!("Archived frame {:?}", path);
        Ok(path)
    }
}

/// Low-resolution RGB copy of a frame for terminal previews.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PreviewFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[u8; 3]>,
    pub source_width: u32,
    pub source_height: u32,
}

impl PreviewFrame {
    /// Scales the frame to fit inside `max_width` x `max_height`, keeping its aspect ratio.
    pub fn from_frame(frame: &FrameBuffer, max_width: u32, max_height: u32) -> Result<Self> {
        ensure_dimensions(max_width, max_height)?;
        let rgba = rgba_buffer(frame)?;
        let scale = f64::min(
            max_width as f64 / frame.width as f64,
            max_height as f64 / frame.height as f64,
        )
        .min(1.0);
        let width = ((frame.width as f64 * scale).round() as u32).max(1);
        let height = ((frame.height as f64 * scale).round() as u32).max(1);
        let small = image::imageops::resize(&rgba, width, height, FilterType::Triangle);
        let pixels = small.pixels().map(|p| [p[0], p[1], p[2]]).collect();
        Ok(Self {
            width,
            height,
            pixels,
            source_width: frame.width,
            source_height: frame.height,
        })
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x < self.width && y < self.height {
            self.pixels.get((y * self.width + x) as usize).copied()
        } else {
            None
        }
    }
}

pub fn codec_error(message: impl Into<String>) -> RollcallError {
    RollcallError::Encode(message.into())
}
