use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{RollcallError, Result};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:5000/mark_attendance";
pub const DEFAULT_INTERVAL_MS: u64 = 2000;
/// Cycles run for at most this many intervals unless `cycle_timeout_ms` says otherwise.
pub const CYCLE_TIMEOUT_INTERVALS: u64 = 5;
pub const DEFAULT_MAX_EVENTS: usize = 1000;

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraConfig {
    /// Generated test pattern; no hardware needed.
    Synthetic { width: u32, height: u32 },
    /// External grabber that writes one PNG frame to stdout per invocation.
    Command { program: String, args: Vec<String> },
}

impl CameraConfig {
    pub fn synthetic() -> Self {
        CameraConfig::Synthetic {
            width: 640,
            height: 480,
        }
    }

    pub fn v4l2(device: &str) -> Self {
        let args = [
            "-loglevel",
            "error",
            "-f",
            "v4l2",
            "-i",
            device,
            "-frames:v",
            "1",
            "-f",
            "image2pipe",
            "-vcodec",
            "png",
            "-",
        ];
        CameraConfig::Command {
            program: "ffmpeg".into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self::v4l2("/dev/video0")
    }
}

/// What a timer tick does while an earlier cycle is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Skip the tick; at most one cycle runs at a time.
    #[default]
    Skip,
    /// Start another cycle anyway; the last response to resolve wins the display.
    Overlap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interval_ms: u64,
    pub overlap: OverlapPolicy,
    pub stop_grace_ms: u64,
    /// Upper bound on one capture-to-report cycle. Defaults to
    /// `CYCLE_TIMEOUT_INTERVALS` intervals.
    pub cycle_timeout_ms: Option<u64>,
    /// Write `error: ...` to the display when a cycle fails.
    pub surface_errors: bool,
}

impl CaptureConfig {
    pub fn cycle_timeout(&self) -> Duration {
        let ms = self
            .cycle_timeout_ms
            .unwrap_or_else(|| self.interval_ms.saturating_mul(CYCLE_TIMEOUT_INTERVALS));
        Duration::from_millis(ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            overlap: OverlapPolicy::default(),
            stop_grace_ms: 2000,
            cycle_timeout_ms: None,
            surface_errors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    pub field_name: String,
    pub file_name: String,
    /// No timeout when unset.
    pub timeout_ms: Option<u64>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.into(),
            field_name: "image".into(),
            file_name: "frame.jpg".into(),
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
    pub telemetry_dir: String,
    /// Every encoded frame is also written here when set.
    pub capture_dir: Option<String>,
    /// Events kept in memory for export; oldest are dropped first.
    pub max_events: usize,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            telemetry_dir: "telemetry".into(),
            capture_dir: None,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollcallConfig {
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    pub endpoint: EndpointConfig,
    pub ops: OpsConfig,
}

impl RollcallConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            RollcallError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            RollcallError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.interval_ms == 0 {
            return Err(RollcallError::Configuration(
                "capture.interval_ms must be greater than zero".into(),
            ));
        }
        if self.capture.cycle_timeout_ms == Some(0) {
            return Err(RollcallError::Configuration(
                "capture.cycle_timeout_ms must be greater than zero when set".into(),
            ));
        }
        if self.ops.max_events == 0 {
            return Err(RollcallError::Configuration(
                "ops.max_events must be greater than zero".into(),
            ));
        }
        let url = self.endpoint.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(RollcallError::Configuration(format!(
                "endpoint.url must be an http(s) URL, got '{url}'"
            )));
        }
        if self.endpoint.field_name.trim().is_empty() {
            return Err(RollcallError::Configuration(
                "endpoint.field_name must not be empty".into(),
            ));
        }
        if self.endpoint.file_name.trim().is_empty() {
            return Err(RollcallError::Configuration(
                "endpoint.file_name must not be empty".into(),
            ));
        }
        if self.endpoint.timeout_ms == Some(0) {
            return Err(RollcallError::Configuration(
                "endpoint.timeout_ms must be greater than zero when set".into(),
            ));
        }
        match &self.camera {
            CameraConfig::Synthetic { width, height } if *width == 0 || *height == 0 => {
                return Err(RollcallError::Configuration(
                    "camera.width and camera.height must be greater than zero".into(),
                ));
            }
            CameraConfig::Command { program, .. } if program.trim().is_empty() => {
                return Err(RollcallError::Configuration(
                    "camera.program must not be empty".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}
