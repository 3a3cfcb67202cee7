use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use rollcall_types::{
    frame::{ensure_dimensions, FrameBuffer},
    Result,
};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    capture_access_error, capture_error, record_failure, record_success, CaptureMetrics,
    MediaSource,
};

/// Camera backed by an external single-frame grabber such as ffmpeg.
///
/// Each capture runs the program once and decodes the image it writes to
/// stdout. The stream resolution is whatever the last decoded frame reported.
pub struct CommandCamera {
    program: PathBuf,
    args: Vec<String>,
    dimensions: Arc<Mutex<Option<(u32, u32)>>>,
    metrics: Arc<Mutex<CaptureMetrics>>,
}

impl CommandCamera {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            dimensions: Arc::new(Mutex::new(None)),
            metrics: Arc::new(Mutex::new(CaptureMetrics::default())),
        }
    }

    pub fn program(&self) -> String {
        self.program.display().to_string()
    }

    async fn run_grabber(&self) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = command.output().await.map_err(|err| {
            capture_error(format!(
                "failed to run grabber {} {:?}: {err}",
                self.program.display(),
                self.args.join(" ")
            ))
        })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(capture_error(format!(
                "grabber exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn grab(&self) -> Result<FrameBuffer> {
        let raw = self.run_grabber().await?;
        let img = image::load_from_memory(&raw)
            .map_err(|err| capture_error(format!("failed to decode grabbed frame: {err}")))?;
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        ensure_dimensions(width, height)?;
        if let Ok(mut guard) = self.dimensions.lock() {
            *guard = Some((width, height));
        }
        FrameBuffer::from_rgba(width, height, rgba.into_raw())
    }
}

#[async_trait]
impl MediaSource for CommandCamera {
    async fn initialize(&mut self) -> Result<()> {
        info!("Opening camera via {}", self.program.display());
        let frame = self
            .grab()
            .await
            .map_err(|err| capture_access_error(format!("camera unavailable: {err}")))?;
        info!("Camera streaming at {}x{}", frame.width, frame.height);
        Ok(())
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .unwrap_or((0, 0))
    }

    async fn capture_frame(&self) -> Result<FrameBuffer> {
        let start = Instant::now();
        let (width, height) = self.dimensions();
        let result = match ensure_dimensions(width, height) {
            Ok(()) => self.grab().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(frame) => {
                if (frame.width, frame.height) != (width, height) {
                    debug!(
                        "Stream resolution changed {}x{} -> {}x{}",
                        width,
                        height,
                        frame.width,
                        frame.height
                    );
                }
                record_success(&self.metrics, start);
                Ok(frame)
            }
            Err(err) => {
                record_failure(&self.metrics);
                Err(err)
            }
        }
    }

    async fn release(&self) -> Result<()> {
        if let Ok(mut guard) = self.dimensions.lock() {
            *guard = None;
        }
        info!("Camera released");
        Ok(())
    }

    fn metrics(&self) -> CaptureMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};
    use rollcall_types::RollcallError;

    fn write_png(name: &str, width: u32, height: u32) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let buffer = ImageBuffer::from_pixel(width, height, Rgba([10u8, 20, 30, 255]));
        buffer.save(&path).expect("write png");
        path
    }

    #[tokio::test]
    async fn missing_program_is_a_media_access_error() {
        let mut camera = CommandCamera::new("/nonexistent/rollcall-grabber", Vec::new());
        let err = camera.initialize().await.unwrap_err();
        assert!(matches!(err, RollcallError::MediaAccess(_)));
    }

    #[tokio::test]
    async fn failing_program_is_a_media_access_error() {
        let mut camera = CommandCamera::new("false", Vec::new());
        let err = camera.initialize().await.unwrap_err();
        assert!(matches!(err, RollcallError::MediaAccess(_)));
    }

    #[tokio::test]
    async fn capture_before_initialize_reports_empty_frame() {
        let path = write_png("rollcall-command-uninit.png", 4, 3);
        let camera = CommandCamera::new("cat", vec![path.display().to_string()]);
        let err = camera.capture_frame().await.unwrap_err();
        assert!(matches!(err, RollcallError::EmptyFrame { .. }));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn decodes_frames_written_to_stdout() {
        let path = write_png("rollcall-command-frame.png", 4, 3);
        let mut camera = CommandCamera::new("cat", vec![path.display().to_string()]);
        camera.initialize().await.expect("initialize");
        assert_eq!(camera.dimensions(), (4, 3));

        let frame = camera.capture_frame().await.expect("frame");
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(&frame.data[..4], &[10, 20, 30, 255]);
        assert_eq!(camera.metrics().frames_captured, 1);

        camera.release().await.expect("release");
        assert_eq!(camera.dimensions(), (0, 0));
        std::fs::remove_file(path).ok();
    }
}
