use thiserror::Error;

pub type Result<T, E = RollcallError> = std::result::Result<T, E>;

/// Unified error type covering every failure a capture cycle can hit.
#[derive(Debug, Error)]
pub enum RollcallError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("media access error: {0}")]
    MediaAccess(String),
    #[error("empty frame: stream reported {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },
    #[error("capture error: {0}")]
    Capture(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("response is missing field `{0}`")]
    MissingField(String),
    #[error("cycle timed out after {0}ms")]
    Timeout(u64),
    #[error("cycle aborted: {0}")]
    Aborted(String),
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RollcallError {
    /// Short machine-friendly label used in events and telemetry.
    pub fn label(&self) -> &'static str {
        match self {
            RollcallError::Configuration(_) => "configuration",
            RollcallError::MediaAccess(_) => "media_access",
            RollcallError::EmptyFrame { .. } => "empty_frame",
            RollcallError::Capture(_) => "capture",
            RollcallError::Encode(_) => "encode",
            RollcallError::Network(_) => "network",
            RollcallError::MissingField(_) => "missing_field",
            RollcallError::Timeout(_) => "timeout",
            RollcallError::Aborted(_) => "aborted",
            RollcallError::Orchestrator(_) => "orchestrator",
            RollcallError::Ops(_) => "ops",
            RollcallError::Other(_) => "other",
        }
    }
}
