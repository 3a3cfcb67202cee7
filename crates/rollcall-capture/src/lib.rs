//! Camera access layer: the live stream every capture cycle reads from.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use rollcall_types::{
    config::CameraConfig,
    frame::{ensure_dimensions, FrameBuffer, RGBA_CHANNELS},
    Result, RollcallError,
};
use serde::Serialize;
use tracing::{debug, info};

mod command;

pub use command::CommandCamera;

/// Aggregated capture counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CaptureMetrics {
    pub frames_captured: u64,
    pub failed_captures: u64,
    pub last_capture_ms: Option<u64>,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Requests camera access and binds the live stream.
    async fn initialize(&mut self) -> Result<()>;
    /// Resolution the stream currently reports; `(0, 0)` until the first frame.
    fn dimensions(&self) -> (u32, u32);
    async fn capture_frame(&self) -> Result<FrameBuffer>;
    /// Releases the device. Later captures fail with an empty frame.
    async fn release(&self) -> Result<()>;
    fn metrics(&self) -> CaptureMetrics;
}

#[derive(Debug, Default)]
struct SyntheticState {
    ready: bool,
    frame_index: u64,
}

/// Deterministic moving test pattern, used for demos and tests.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    deny_access: bool,
    state: Arc<Mutex<SyntheticState>>,
    metrics: Arc<Mutex<CaptureMetrics>>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            deny_access: false,
            state: Arc::new(Mutex::new(SyntheticState::default())),
            metrics: Arc::new(Mutex::new(CaptureMetrics::default())),
        }
    }

    /// Makes `initialize` fail as if the permission prompt was declined.
    pub fn denying_access(mut self) -> Self {
        self.deny_access = true;
        self
    }

    fn render(&self, frame_index: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = (frame_index * 8) as usize;
        let mut data = Vec::with_capacity(w * h * RGBA_CHANNELS);
        for y in 0..h {
            for x in 0..w {
                data.push((((x + shift) * 255) / w.max(1)) as u8);
                data.push(((y * 255) / h.max(1)) as u8);
                data.push((frame_index % 256) as u8);
                data.push(u8::MAX);
            }
        }
        data
    }
}

#[async_trait]
impl MediaSource for SyntheticCamera {
    async fn initialize(&mut self) -> Result<()> {
        if self.deny_access {
            return Err(capture_access_error("synthetic camera: permission denied"));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| capture_error("failed to lock camera state"))?;
        state.ready = true;
        info!(
            "Synthetic camera streaming at {}x{}",
            self.width, self.height
        );
        Ok(())
    }

    fn dimensions(&self) -> (u32, u32) {
        match self.state.lock() {
            Ok(state) if state.ready => (self.width, self.height),
            _ => (0, 0),
        }
    }

    async fn capture_frame(&self) -> Result<FrameBuffer> {
        let start = Instant::now();
        let (width, height) = self.dimensions();
        if let Err(err) = ensure_dimensions(width, height) {
            record_failure(&self.metrics);
            return Err(err);
        }
        let frame_index = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| capture_error("failed to lock camera state"))?;
            state.frame_index += 1;
            state.frame_index
        };
        let frame = FrameBuffer::from_rgba(width, height, self.render(frame_index))?;
        record_success(&self.metrics, start);
        Ok(frame)
    }

    async fn release(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| capture_error("failed to lock camera state"))?;
        state.ready = false;
        debug!("Synthetic camera released");
        Ok(())
    }

    fn metrics(&self) -> CaptureMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

/// Config-selected camera.
pub enum CameraDevice {
    Synthetic(SyntheticCamera),
    Command(CommandCamera),
}

impl CameraDevice {
    pub fn from_config(config: &CameraConfig) -> Self {
        match config {
            CameraConfig::Synthetic { width, height } => {
                CameraDevice::Synthetic(SyntheticCamera::new(*width, *height))
            }
            CameraConfig::Command { program, args } => {
                CameraDevice::Command(CommandCamera::new(program, args.clone()))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CameraDevice::Synthetic(camera) => {
                format!("synthetic {}x{}", camera.width, camera.height)
            }
            CameraDevice::Command(camera) => format!("command '{}'", camera.program()),
        }
    }
}

#[async_trait]
impl MediaSource for CameraDevice {
    async fn initialize(&mut self) -> Result<()> {
        match self {
            CameraDevice::Synthetic(camera) => camera.initialize().await,
            CameraDevice::Command(camera) => camera.initialize().await,
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        match self {
            CameraDevice::Synthetic(camera) => camera.dimensions(),
            CameraDevice::Command(camera) => camera.dimensions(),
        }
    }

    async fn capture_frame(&self) -> Result<FrameBuffer> {
        match self {
            CameraDevice::Synthetic(camera) => camera.capture_frame().await,
            CameraDevice::Command(camera) => camera.capture_frame().await,
        }
    }

    async fn release(&self) -> Result<()> {
        match self {
            CameraDevice::Synthetic(camera) => camera.release().await,
            CameraDevice::Command(camera) => camera.release().await,
        }
    }

    fn metrics(&self) -> CaptureMetrics {
        match self {
            CameraDevice::Synthetic(camera) => camera.metrics(),
            CameraDevice::Command(camera) => camera.metrics(),
        }
    }
}

pub(crate) fn record_success(metrics: &Mutex<CaptureMetrics>, start: Instant) {
    if let Ok(mut guard) = metrics.lock() {
        guard.frames_captured += 1;
        guard.last_capture_ms = Some(start.elapsed().as_millis() as u64);
    }
}

pub(crate) fn record_failure(metrics: &Mutex<CaptureMetrics>) {
    if let Ok(mut guard) = metrics.lock() {
        guard.failed_captures += 1;
    }
}

/// Generate an error aligned with capture semantics.
pub fn capture_error(message: impl Into<String>) -> RollcallError {
    RollcallError::Capture(message.into())
}

/// Error for a camera that cannot be opened at all.
pub fn capture_access_error(message: impl Into<String>) -> RollcallError {
    RollcallError::MediaAccess(message.into())
}
