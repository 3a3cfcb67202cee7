use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-stage timings of a single capture cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub capture_ms: u64,
    pub encode_ms: u64,
    pub upload_ms: u64,
    pub total_ms: u64,
    pub encoded_bytes: usize,
    pub captured_at: DateTime<Utc>,
}

/// Running counters for one loop lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LoopCounters {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoopTelemetry {
    pub counters: LoopCounters,
    pub last_metrics: Option<CycleMetrics>,
    pub last_error: Option<String>,
}
