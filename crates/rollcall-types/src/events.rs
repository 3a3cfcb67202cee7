use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::telemetry::CycleMetrics;

/// High-level event bus message kinds moving through the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Lifecycle,
    Cycle,
    Ops,
}

/// Immutable event envelope for logging, the UI feed and telemetry export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Lifecycle(LifecycleEvent),
    Cycle(CycleEvent),
    Ops(OpsEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub phase: LifecyclePhase,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecyclePhase {
    Boot,
    StreamReady,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEvent {
    pub cycle: u64,
    pub outcome: CycleOutcome,
    pub metrics: Option<CycleMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CycleOutcome {
    Reported { message: String },
    Failed { kind: String, reason: String },
    Skipped { in_flight: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsEvent {
    pub message: String,
    pub tags: Vec<String>,
}

impl SystemEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn lifecycle(phase: LifecyclePhase, details: Option<String>) -> Self {
        Self::new(
            EventKind::Lifecycle,
            EventPayload::Lifecycle(LifecycleEvent {
                phase,
                details,
            }),
        )
    }

    pub fn cycle(cycle: u64, outcome: CycleOutcome, metrics: Option<CycleMetrics>) -> Self {
        Self::new(
            EventKind::Cycle,
            EventPayload::Cycle(CycleEvent {
                cycle,
                outcome,
                metrics,
            }),
        )
    }

    pub fn ops(message: impl Into<String>, tags: &[&str]) -> Self {
        Self::new(
            EventKind::Ops,
            EventPayload::Ops(OpsEvent {
                message: message.into(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            }),
        )
    }
}
