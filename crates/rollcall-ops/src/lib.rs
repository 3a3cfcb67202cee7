//! Operational helpers: logging, telemetry bookkeeping and export.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use chrono::Utc;
use rollcall_types::{
    config::{OpsConfig, DEFAULT_MAX_EVENTS},
    events::{CycleOutcome, EventPayload, SystemEvent},
    telemetry::{CycleMetrics, LoopCounters, LoopTelemetry},
    Result, RollcallError,
};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Where formatted log lines go.
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    /// Appends to a file; used while the terminal UI owns the screen.
    File(PathBuf),
}

pub fn init_tracing(config: &OpsConfig, target: LogTarget) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_level.clone())
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| RollcallError::Ops(format!("failed to create log filter: {err}")))?;

    let result = match target {
        LogTarget::Stderr => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        LogTarget::File(path) => {
            let file = open_log_file(&path)?;
            fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(StdMutex::new(file))
                .try_init()
        }
    };
    result.map_err(|err| RollcallError::Ops(format!("tracing init error: {err}")))
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| RollcallError::Ops(format!("failed to create log dir: {err}")))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| RollcallError::Ops(format!("failed to open log file {:?}: {err}", path)))
}

/// In-memory record of the most recent events and the cycle counters for one run.
#[derive(Clone)]
pub struct TelemetryStore {
    events: Arc<Mutex<VecDeque<SystemEvent>>>,
    max_events: usize,
    telemetry: Arc<Mutex<LoopTelemetry>>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `max_events` events; counters are unaffected by the cap.
    pub fn with_capacity(max_events: usize) -> Self {
        let max_events = max_events.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events,
            telemetry: Arc::new(Mutex::new(LoopTelemetry::default())),
        }
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Stores the event and folds cycle outcomes into the counters.
    pub async fn record_event(&self, event: SystemEvent) -> Result<()> {
        if let EventPayload::Cycle(cycle) = &event.payload {
            let mut telemetry = self.telemetry.lock().await;
            match &cycle.outcome {
                CycleOutcome::Reported { .. } => telemetry.counters.succeeded += 1,
                CycleOutcome::Failed { reason, .. } => {
                    telemetry.counters.failed += 1;
                    telemetry.last_error = Some(reason.clone());
                }
                CycleOutcome::Skipped { .. } => telemetry.counters.skipped += 1,
            }
            if let Some(metrics) = &cycle.metrics {
                telemetry.last_metrics = Some(metrics.clone());
            }
        }
        let mut events = self.events.lock().await;
        if events.len() == self.max_events {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    pub async fn record_started(&self) {
        self.telemetry.lock().await.counters.started += 1;
    }

    pub async fn counters(&self) -> LoopCounters {
        self.telemetry.lock().await.counters.clone()
    }

    pub async fn last_metrics(&self) -> Option<CycleMetrics> {
        self.telemetry.lock().await.last_metrics.clone()
    }

    pub async fn snapshot(&self) -> LoopTelemetry {
        self.telemetry.lock().await.clone()
    }

    pub async fn snapshot_events(&self) -> Vec<SystemEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Writes every retained event as one JSON object per line.
    pub async fn export_events(&self, dir: &Path) -> Result<PathBuf> {
        let events = self.snapshot_events().await;
        let path = dir.join(format!("events_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S")));
        let mut file = File::create(&path)
            .map_err(|err| RollcallError::Ops(format!("failed to create {:?}: {err}", path)))?;
        for event in &events {
            let line = serde_json::to_string(event)
                .map_err(|err| RollcallError::Ops(format!("failed to encode event: {err}")))?;
            writeln!(file, "{line}")
                .map_err(|err| RollcallError::Ops(format!("failed to write {:?}: {err}", path)))?;
        }
        info!("Exported {} events to {:?}", events.len(), path);
        Ok(path)
    }
}

pub fn ensure_telemetry_dir(path: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(path);
    fs::create_dir_all(&dir)
        .map_err(|err| RollcallError::Ops(format!("failed to create telemetry dir: {err}")))?;
    info!("Telemetry directory ready at {:?}", dir);
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_types::events::LifecyclePhase;

    #[tokio::test]
    async fn cycle_events_update_counters() {
        let store = TelemetryStore::new();
        store.record_started().await;
        store.record_started().await;
        store
            .record_event(SystemEvent::cycle(
                1,
                CycleOutcome::Reported {
                    message: "Present: Alice".into(),
                },
                Some(CycleMetrics {
                    capture_ms: 1,
                    encode_ms: 2,
                    upload_ms: 3,
                    total_ms: 6,
                    encoded_bytes: 1024,
                    captured_at: Utc::now(),
                }),
            ))
            .await
            .unwrap();
        store
            .record_event(SystemEvent::cycle(
                2,
                CycleOutcome::Failed {
                    kind: "network".into(),
                    reason: "connection refused".into(),
                },
                None,
            ))
            .await
            .unwrap();
        store
            .record_event(SystemEvent::cycle(
                3,
                CycleOutcome::Skipped { in_flight: 1 },
                None,
            ))
            .await
            .unwrap();
        store
            .record_event(SystemEvent::lifecycle(LifecyclePhase::Stopped, None))
            .await
            .unwrap();

        assert_eq!(
            store.counters().await,
            LoopCounters {
                started: 2,
                succeeded: 1,
                failed: 1,
                skipped: 1,
            }
        );
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));
        assert_eq!(store.last_metrics().await.map(|m| m.encoded_bytes), Some(1024));
        assert_eq!(store.snapshot_events().await.len(), 4);
    }

    #[tokio::test]
    async fn export_writes_json_lines() {
        let dir = std::env::temp_dir().join("rollcall-telemetry-export");
        let dir = ensure_telemetry_dir(dir.to_str().unwrap()).expect("dir");
        let store = TelemetryStore::new();
        store
            .record_event(SystemEvent::lifecycle(LifecyclePhase::Boot, None))
            .await
            .unwrap();
        store
            .record_event(SystemEvent::ops("camera ready", &["media"]))
            .await
            .unwrap();

        let path = store.export_events(&dir).await.expect("export");
        let contents = fs::read_to_string(&path).expect("read export");
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<SystemEvent>(line).expect("valid event json");
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn event_log_stays_at_capacity() {
        let store = TelemetryStore::with_capacity(10);
        for cycle in 1..=25 {
            store
                .record_event(SystemEvent::cycle(
                    cycle,
                    CycleOutcome::Skipped { in_flight: 1 },
                    None,
                ))
                .await
                .unwrap();
        }

        let events = store.snapshot_events().await;
        assert_eq!(events.len(), 10);
        match &events[0].payload {
            EventPayload::Cycle(cycle) => assert_eq!(cycle.cycle, 16),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(store.counters().await.skipped, 25);
    }
}
