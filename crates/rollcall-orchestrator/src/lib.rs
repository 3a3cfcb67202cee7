//! Capture-and-report loop coordinating camera, codec, uploader and display.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex as StdMutex},
    time::Instant as StdInstant,
};

use chrono::Utc;
use rollcall_capture::MediaSource;
use rollcall_codec::{encode_frame, CaptureArchive};
use rollcall_network::{AttendanceClient, EventBus};
use rollcall_ops::TelemetryStore;
use rollcall_types::{
    attendance::AttendanceResponse,
    config::{CaptureConfig, OverlapPolicy},
    events::{CycleOutcome, LifecyclePhase, SystemEvent},
    telemetry::{CycleMetrics, LoopTelemetry},
    Result, RollcallError,
};
use tokio::{
    sync::watch,
    task::{self, JoinHandle, JoinSet},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

mod display;

pub use display::{LogDisplay, SharedDisplay, StatusDisplay};

/// Result of one successful capture → encode → upload → report sequence.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub message: String,
    pub response: AttendanceResponse,
    pub metrics: CycleMetrics,
}

/// Runs single cycles. Shared by every cycle task of a loop.
pub struct CycleRunner<S, U>
where
    S: MediaSource,
    U: AttendanceClient,
{
    source: S,
    uploader: U,
    display: Arc<dyn StatusDisplay>,
    bus: Arc<dyn EventBus>,
    telemetry: TelemetryStore,
    archive: Option<CaptureArchive>,
    surface_errors: bool,
    cycle_timeout: Option<Duration>,
}

impl<S, U> CycleRunner<S, U>
where
    S: MediaSource,
    U: AttendanceClient,
{
    pub fn new(
        source: S,
        uploader: U,
        display: Arc<dyn StatusDisplay>,
        bus: Arc<dyn EventBus>,
        telemetry: TelemetryStore,
    ) -> Self {
        Self {
            source,
            uploader,
            display,
            bus,
            telemetry,
            archive: None,
            surface_errors: false,
            cycle_timeout: None,
        }
    }

    pub fn with_archive(mut self, archive: Option<CaptureArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn surface_errors(mut self, enabled: bool) -> Self {
        self.surface_errors = enabled;
        self
    }

    /// Bounds `run_and_record`; an expired cycle is reported as a timeout.
    pub fn with_cycle_timeout(mut self, limit: Duration) -> Self {
        self.cycle_timeout = Some(limit);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub async fn initialize_stream(&mut self) -> Result<()> {
        self.source.initialize().await
    }

    pub async fn run_cycle(&self, cycle: u64) -> Result<CycleReport> {
        let start = StdInstant::now();
        let captured_at = Utc::now();

        let frame = self.source.capture_frame().await?;
        let capture_ms = start.elapsed().as_millis() as u64;

        // Preview scaling and JPEG encoding are CPU-bound.
        let encode_start = StdInstant::now();
        let display = Arc::clone(&self.display);
        let image = task::spawn_blocking(move || {
            display.show_preview(&frame);
            encode_frame(&frame)
        })
        .await
        .map_err(|err| orchestrator_error(format!("encode task failed: {err}")))??;
        let encode_ms = encode_start.elapsed().as_millis() as u64;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.persist(cycle, &image) {
                warn!(cycle, "Failed to archive frame: {err}");
            }
        }

        let upload_start = StdInstant::now();
        let response = self.uploader.mark_attendance(&image).await?;
        let upload_ms = upload_start.elapsed().as_millis() as u64;

        let message = self.report_status(&response)?;
        Ok(CycleReport {
            cycle,
            message,
            response,
            metrics: CycleMetrics {
                capture_ms,
                encode_ms,
                upload_ms,
                total_ms: start.elapsed().as_millis() as u64,
                encoded_bytes: image.len(),
                captured_at,
            },
        })
    }

    /// Writes `message` to the display; a missing message leaves it untouched.
    pub fn report_status(&self, response: &AttendanceResponse) -> Result<String> {
        let message = response.message()?;
        self.display.show_message(message);
        Ok(message.to_string())
    }

    /// Runs a cycle and turns its outcome into logs, telemetry and an event.
    /// Never fails: a broken cycle must not stop the loop.
    pub async fn run_and_record(&self, cycle: u64) -> CycleOutcome {
        self.telemetry.record_started().await;
        let result = match self.cycle_timeout {
            Some(limit) => time::timeout(limit, self.run_cycle(cycle))
                .await
                .unwrap_or_else(|_| Err(RollcallError::Timeout(limit.as_millis() as u64))),
            None => self.run_cycle(cycle).await,
        };
        match result {
            Ok(report) => {
                info!(
                    cycle,
                    total_ms = report.metrics.total_ms,
                    "Reported '{}'",
                    report.message
                );
                let outcome = CycleOutcome::Reported {
                    message: report.message,
                };
                self.publish(SystemEvent::cycle(
                    cycle,
                    outcome.clone(),
                    Some(report.metrics),
                ))
                .await;
                outcome
            }
            Err(err) => self.record_failure(cycle, &err).await,
        }
    }

    async fn record_failure(&self, cycle: u64, err: &RollcallError) -> CycleOutcome {
        warn!(cycle, kind = err.label(), "Cycle failed: {err}");
        if self.surface_errors {
            self.display.show_error(err);
        }
        let outcome = CycleOutcome::Failed {
            kind: err.label().to_string(),
            reason: err.to_string(),
        };
        self.publish(SystemEvent::cycle(cycle, outcome.clone(), None))
            .await;
        outcome
    }

    async fn record_skip(&self, cycle: u64, in_flight: usize) {
        debug!(cycle, in_flight, "Previous cycle still in flight; skipping tick");
        self.publish(SystemEvent::cycle(
            cycle,
            CycleOutcome::Skipped { in_flight },
            None,
        ))
        .await;
    }

    async fn publish(&self, event: SystemEvent) {
        let cloned = event.clone();
        if let Err(err) = self.bus.publish(event).await {
            warn!("Failed to publish event: {err}");
        }
        if let Err(err) = self.telemetry.record_event(cloned).await {
            warn!("Failed to record event: {err}");
        }
    }
}

/// Timer-driven loop owning its stream, uploader and display.
pub struct CaptureLoop<S, U>
where
    S: MediaSource,
    U: AttendanceClient,
{
    runner: CycleRunner<S, U>,
    config: CaptureConfig,
}

impl<S, U> CaptureLoop<S, U>
where
    S: MediaSource + 'static,
    U: AttendanceClient + 'static,
{
    /// Cycles started by this loop are bounded by `config.cycle_timeout()`.
    pub fn new(config: CaptureConfig, runner: CycleRunner<S, U>) -> Self {
        let runner = runner.with_cycle_timeout(config.cycle_timeout());
        Self { runner, config }
    }

    /// Opens the stream and starts scheduling cycles.
    /// The first cycle fires one interval after this returns.
    pub async fn start(mut self) -> Result<LoopHandle> {
        if self.config.interval_ms == 0 {
            return Err(orchestrator_error("capture interval must be non-zero"));
        }
        self.runner
            .publish(SystemEvent::lifecycle(LifecyclePhase::Boot, None))
            .await;

        if let Err(err) = self.runner.initialize_stream().await {
            error!("Camera unavailable: {err}");
            self.runner
                .publish(SystemEvent::ops(err.to_string(), &["media", err.label()]))
                .await;
            return Err(err);
        }

        let (width, height) = self.runner.source.dimensions();
        self.runner
            .publish(SystemEvent::lifecycle(
                LifecyclePhase::StreamReady,
                Some(format!("{width}x{height}")),
            ))
            .await;

        let telemetry = self.runner.telemetry.clone();
        let runner = Arc::new(self.runner);
        let (stop_tx, stop_rx) = watch::channel(false);
        runner
            .publish(SystemEvent::lifecycle(
                LifecyclePhase::Running,
                Some(format!(
                    "every {}ms, overlap policy {:?}",
                    self.config.interval_ms, self.config.overlap
                )),
            ))
            .await;
        let driver = tokio::spawn(drive(runner, self.config, stop_rx));
        Ok(LoopHandle {
            stop_tx,
            driver,
            telemetry,
        })
    }
}

/// Final counters of a stopped loop.
#[derive(Debug, Clone)]
pub struct LoopSummary {
    pub telemetry: LoopTelemetry,
}

/// Controls a running loop. Dropping it also stops the loop.
pub struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
    telemetry: TelemetryStore,
}

impl LoopHandle {
    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Stops ticking, lets in-flight cycles settle (up to the grace period),
    /// then releases the camera.
    pub async fn stop(self) -> Result<LoopSummary> {
        let _ = self.stop_tx.send(true);
        self.driver
            .await
            .map_err(|err| orchestrator_error(format!("capture loop task failed: {err}")))?;
        Ok(LoopSummary {
            telemetry: self.telemetry.snapshot().await,
        })
    }
}

/// Cycle numbers currently running, plus those dropped before they settled.
#[derive(Clone, Default)]
struct InFlightCycles {
    running: Arc<StdMutex<BTreeSet<u64>>>,
    unsettled: Arc<StdMutex<Vec<u64>>>,
}

impl InFlightCycles {
    fn enter(&self, cycle: u64) -> InFlight {
        if let Ok(mut running) = self.running.lock() {
            running.insert(cycle);
        }
        InFlight {
            cycles: self.clone(),
            cycle,
            settled: false,
        }
    }

    fn len(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn take_unsettled(&self) -> Vec<u64> {
        self.unsettled
            .lock()
            .map(|mut u| std::mem::take(&mut *u))
            .unwrap_or_default()
    }
}

/// Leaves the running set when a cycle task ends, even by abort or panic.
struct InFlight {
    cycles: InFlightCycles,
    cycle: u64,
    settled: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut running) = self.cycles.running.lock() {
            running.remove(&self.cycle);
        }
        if !self.settled {
            if let Ok(mut unsettled) = self.cycles.unsettled.lock() {
                unsettled.push(self.cycle);
            }
        }
    }
}

/// Reports cycles whose task ended without recording an outcome.
async fn record_unsettled<S, U>(
    runner: &CycleRunner<S, U>,
    in_flight: &InFlightCycles,
    why: &str,
) where
    S: MediaSource,
    U: AttendanceClient,
{
    for cycle in in_flight.take_unsettled() {
        runner
            .record_failure(cycle, &RollcallError::Aborted(why.to_string()))
            .await;
    }
}

async fn drive<S, U>(
    runner: Arc<CycleRunner<S, U>>,
    config: CaptureConfig,
    mut stop_rx: watch::Receiver<bool>,
) where
    S: MediaSource + 'static,
    U: AttendanceClient + 'static,
{
    let period = Duration::from_millis(config.interval_ms);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let in_flight = InFlightCycles::default();
    let mut cycles: JoinSet<()> = JoinSet::new();
    let mut cycle: u64 = 0;

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                cycle += 1;
                let busy = in_flight.len();
                if busy > 0 && config.overlap == OverlapPolicy::Skip {
                    runner.record_skip(cycle, busy).await;
                } else {
                    let mut guard = in_flight.enter(cycle);
                    let runner = Arc::clone(&runner);
                    cycles.spawn(async move {
                        runner.run_and_record(cycle).await;
                        guard.settled = true;
                    });
                }
            }
            Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(err) = joined {
                    error!("Cycle task ended abnormally: {err}");
                    record_unsettled(&*runner, &in_flight, "cycle task ended abnormally").await;
                }
            }
        }
    }

    runner
        .publish(SystemEvent::lifecycle(
            LifecyclePhase::Stopping,
            Some(format!("{} cycle(s) in flight", cycles.len())),
        ))
        .await;

    let grace = Duration::from_millis(config.stop_grace_ms);
    if time::timeout(grace, drain(&mut cycles)).await.is_err() {
        warn!("Aborting {} in-flight cycle(s) after {:?}", cycles.len(), grace);
        cycles.shutdown().await;
        let why = format!("still running {}ms after stop", grace.as_millis());
        record_unsettled(&*runner, &in_flight, &why).await;
    }

    if let Err(err) = runner.source.release().await {
        warn!("Failed to release camera: {err}");
    }
    runner
        .publish(SystemEvent::lifecycle(
            LifecyclePhase::Stopped,
            Some(format!("{cycle} tick(s)")),
        ))
        .await;
    info!("Capture loop stopped after {cycle} tick(s)");
}

async fn drain(cycles: &mut JoinSet<()>) {
    while let Some(joined) = cycles.join_next().await {
        if let Err(err) = joined {
            error!("Cycle task ended abnormally: {err}");
        }
    }
}

pub fn orchestrator_error(message: impl Into<String>) -> RollcallError {
    RollcallError::Orchestrator(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;
    use rollcall_capture::{CaptureMetrics, SyntheticCamera};
    use rollcall_network::{HttpAttendanceClient, LocalBus};
    use rollcall_types::{
        config::EndpointConfig,
        events::EventPayload,
        frame::{EncodedImage, FrameBuffer},
        telemetry::LoopCounters,
    };

    #[derive(Clone)]
    enum Scripted {
        Reply { delay_ms: u64, message: &'static str },
        Fail(&'static str),
        NoMessage,
    }

    /// Uploader with a fixed sequence of replies; records when each call arrived.
    struct ScriptedClient {
        calls: Arc<Mutex<Vec<Instant>>>,
        script: Mutex<VecDeque<Scripted>>,
        fallback: Scripted,
    }

    impl ScriptedClient {
        fn new(script: Vec<Scripted>, fallback: Scripted) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                script: Mutex::new(script.into()),
                fallback,
            }
        }

        fn replying(delay_ms: u64, message: &'static str) -> Self {
            Self::new(Vec::new(), Scripted::Reply { delay_ms, message })
        }

        fn calls(&self) -> Arc<Mutex<Vec<Instant>>> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl AttendanceClient for ScriptedClient {
        async fn mark_attendance(&self, image: &EncodedImage) -> Result<AttendanceResponse> {
            assert!(image.has_jpeg_header());
            self.calls.lock().unwrap().push(Instant::now());
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            match step {
                Scripted::Reply { delay_ms, message } => {
                    time::sleep(Duration::from_millis(delay_ms)).await;
                    Ok(AttendanceResponse::with_message(message))
                }
                Scripted::Fail(reason) => Err(RollcallError::Network(reason.into())),
                Scripted::NoMessage => Ok(AttendanceResponse::default()),
            }
        }
    }

    /// Synthetic camera that reports whether it was released.
    struct TrackingCamera {
        inner: SyntheticCamera,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MediaSource for TrackingCamera {
        async fn initialize(&mut self) -> Result<()> {
            self.inner.initialize().await
        }

        fn dimensions(&self) -> (u32, u32) {
            self.inner.dimensions()
        }

        async fn capture_frame(&self) -> Result<FrameBuffer> {
            self.inner.capture_frame().await
        }

        async fn release(&self) -> Result<()> {
            self.released.store(true, Ordering::SeqCst);
            self.inner.release().await
        }

        fn metrics(&self) -> CaptureMetrics {
            self.inner.metrics()
        }
    }

    fn loop_config(overlap: OverlapPolicy) -> CaptureConfig {
        CaptureConfig {
            interval_ms: 2000,
            overlap,
            stop_grace_ms: 1000,
            cycle_timeout_ms: None,
            surface_errors: false,
        }
    }

    fn runner_with<U: AttendanceClient>(
        client: U,
        display: SharedDisplay,
    ) -> CycleRunner<SyntheticCamera, U> {
        CycleRunner::new(
            SyntheticCamera::new(64, 48),
            client,
            Arc::new(display),
            Arc::new(LocalBus::new(64)),
            TelemetryStore::new(),
        )
    }

    async fn http_runner(
        server: &mockito::ServerGuard,
        display: SharedDisplay,
    ) -> CycleRunner<SyntheticCamera, HttpAttendanceClient> {
        let client = HttpAttendanceClient::new(&EndpointConfig {
            url: format!("{}/mark_attendance", server.url()),
            ..EndpointConfig::default()
        })
        .expect("client");
        let mut runner = runner_with(client, display);
        runner.initialize_stream().await.expect("camera");
        runner
    }

    fn lifecycle_phases(events: &[SystemEvent]) -> Vec<LifecyclePhase> {
        events
            .iter()
            .filter_map(|event| match &event.payload {
                EventPayload::Lifecycle(lifecycle) => Some(lifecycle.phase),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn reported_message_reaches_the_display() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mark_attendance")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message": "Present: Alice"}"#)
            .create_async()
            .await;

        let display = SharedDisplay::new();
        let runner = http_runner(&server, display.clone()).await;
        let report = runner.run_cycle(1).await.expect("cycle");

        assert_eq!(display.text().as_deref(), Some("Present: Alice"));
        assert_eq!(report.message, "Present: Alice");
        assert!(report.metrics.encoded_bytes > 0);
        assert_eq!(display.preview_dimensions(), Some((64, 48)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_keeps_previous_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/mark_attendance")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let display = SharedDisplay::with_text("Present: Alice");
        let runner = http_runner(&server, display.clone()).await;
        let err = runner.run_cycle(2).await.unwrap_err();

        assert!(matches!(err, RollcallError::Network(_)));
        assert_eq!(display.text().as_deref(), Some("Present: Alice"));
    }

    #[tokio::test]
    async fn malformed_json_keeps_previous_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/mark_attendance")
            .with_status(200)
            .with_body("{\"message\": ")
            .create_async()
            .await;

        let display = SharedDisplay::with_text("Present: Alice");
        let runner = http_runner(&server, display.clone()).await;
        let err = runner.run_cycle(3).await.unwrap_err();

        assert!(matches!(err, RollcallError::Network(_)));
        assert_eq!(display.history(), vec!["Present: Alice".to_string()]);
    }

    #[tokio::test]
    async fn missing_message_is_reported_and_display_unchanged() {
        let display = SharedDisplay::with_text("Present: Alice");
        let mut runner = runner_with(
            ScriptedClient::new(Vec::new(), Scripted::NoMessage),
            display.clone(),
        );
        runner.initialize_stream().await.expect("camera");

        let err = runner.run_cycle(1).await.unwrap_err();
        assert!(matches!(err, RollcallError::MissingField(ref field) if field == "message"));
        assert_eq!(display.text().as_deref(), Some("Present: Alice"));
    }

    #[tokio::test]
    async fn cycle_before_stream_ready_fails_with_empty_frame() {
        let client = ScriptedClient::replying(0, "unused");
        let calls = client.calls();
        let runner = runner_with(client, SharedDisplay::new());

        let err = runner.run_cycle(1).await.unwrap_err();
        assert!(matches!(err, RollcallError::EmptyFrame { .. }));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn surfaced_errors_replace_the_message() {
        let display = SharedDisplay::with_text("Present: Alice");
        let mut runner = runner_with(
            ScriptedClient::new(Vec::new(), Scripted::Fail("connection refused")),
            display.clone(),
        )
        .surface_errors(true);
        runner.initialize_stream().await.expect("camera");

        let outcome = runner.run_and_record(1).await;
        assert!(matches!(outcome, CycleOutcome::Failed { ref kind, .. } if kind == "network"));
        assert_eq!(
            display.text().as_deref(),
            Some("error: network error: connection refused")
        );
        let counters = runner.telemetry().counters().await;
        assert_eq!((counters.started, counters.failed), (1, 1));
    }

    #[tokio::test]
    async fn archive_keeps_uploaded_frames() {
        let dir = std::env::temp_dir().join("rollcall-orchestrator-archive");
        std::fs::remove_dir_all(&dir).ok();
        let mut runner = runner_with(ScriptedClient::replying(0, "ok"), SharedDisplay::new())
            .with_archive(Some(CaptureArchive::new(&dir)));
        runner.initialize_stream().await.expect("camera");

        runner.run_cycle(4).await.expect("cycle");
        let files: Vec<_> = std::fs::read_dir(&dir)
            .expect("archive dir")
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(files.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn denied_camera_fails_start() {
        let telemetry = TelemetryStore::new();
        let runner = CycleRunner::new(
            SyntheticCamera::new(64, 48).denying_access(),
            ScriptedClient::replying(0, "unused"),
            Arc::new(SharedDisplay::new()),
            Arc::new(LocalBus::new(8)),
            telemetry.clone(),
        );
        let err = CaptureLoop::new(loop_config(OverlapPolicy::Skip), runner)
            .start()
            .await
            .err()
            .expect("start must fail");
        assert!(matches!(err, RollcallError::MediaAccess(_)));

        let events = telemetry.snapshot_events().await;
        assert!(events
            .iter()
            .any(|event| matches!(&event.payload, EventPayload::Ops(ops) if ops.tags.contains(&"media_access".to_string()))));
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_once_per_period() {
        let client = ScriptedClient::replying(100, "Present: Alice");
        let calls = client.calls();
        let display = SharedDisplay::new();
        let runner = runner_with(client, display.clone());

        let start = Instant::now();
        let handle = CaptureLoop::new(loop_config(OverlapPolicy::Skip), runner)
            .start()
            .await
            .expect("start");
        time::sleep(Duration::from_millis(5 * 2000 + 1000)).await;
        let summary = handle.stop().await.expect("stop");

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 5);
        let tolerance = Duration::from_millis(10);
        let mut previous = start;
        for at in calls {
            let gap = at.duration_since(previous);
            assert!(
                gap >= Duration::from_millis(2000) - tolerance
                    && gap <= Duration::from_millis(2000) + tolerance,
                "unexpected gap {gap:?}"
            );
            previous = at;
        }
        assert_eq!(display.text().as_deref(), Some("Present: Alice"));
        assert_eq!(
            summary.telemetry.counters,
            LoopCounters {
                started: 5,
                succeeded: 5,
                failed: 0,
                skipped: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycles_show_last_resolved_response() {
        let client = ScriptedClient::new(
            vec![
                Scripted::Reply {
                    delay_ms: 3000,
                    message: "first",
                },
                Scripted::Reply {
                    delay_ms: 500,
                    message: "second",
                },
            ],
            Scripted::Reply {
                delay_ms: 0,
                message: "later",
            },
        );
        let calls = client.calls();
        let display = SharedDisplay::new();
        let runner = runner_with(client, display.clone());

        let handle = CaptureLoop::new(loop_config(OverlapPolicy::Overlap), runner)
            .start()
            .await
            .expect("start");
        time::sleep(Duration::from_millis(5500)).await;
        handle.stop().await.expect("stop");

        // Sent first, resolved last: its message wins.
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(display.text().as_deref(), Some("first"));
        assert_eq!(
            display.history(),
            vec!["second".to_string(), "first".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skip_policy_keeps_results_in_send_order() {
        let client = ScriptedClient::new(
            vec![
                Scripted::Reply {
                    delay_ms: 3000,
                    message: "first",
                },
                Scripted::Reply {
                    delay_ms: 500,
                    message: "second",
                },
            ],
            Scripted::Reply {
                delay_ms: 0,
                message: "later",
            },
        );
        let calls = client.calls();
        let display = SharedDisplay::new();
        let runner = runner_with(client, display.clone());

        let handle = CaptureLoop::new(loop_config(OverlapPolicy::Skip), runner)
            .start()
            .await
            .expect("start");
        time::sleep(Duration::from_millis(7000)).await;
        let summary = handle.stop().await.expect("stop");

        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(
            display.history(),
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(summary.telemetry.counters.skipped, 1);
        assert_eq!(summary.telemetry.counters.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_does_not_stop_the_loop() {
        let client = ScriptedClient::new(
            vec![Scripted::Fail("connection reset")],
            Scripted::Reply {
                delay_ms: 0,
                message: "Present: Bob",
            },
        );
        let display = SharedDisplay::new();
        let runner = runner_with(client, display.clone());

        let handle = CaptureLoop::new(loop_config(OverlapPolicy::Skip), runner)
            .start()
            .await
            .expect("start");
        time::sleep(Duration::from_millis(4500)).await;
        let summary = handle.stop().await.expect("stop");

        assert_eq!(display.text().as_deref(), Some("Present: Bob"));
        assert_eq!(summary.telemetry.counters.failed, 1);
        assert_eq!(summary.telemetry.counters.succeeded, 1);
        assert_eq!(
            summary.telemetry.last_error.as_deref(),
            Some("network error: connection reset")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_hung_upload_and_releases_camera() {
        let released = Arc::new(AtomicBool::new(false));
        let camera = TrackingCamera {
            inner: SyntheticCamera::new(32, 24),
            released: Arc::clone(&released),
        };
        let display = SharedDisplay::new();
        let telemetry = TelemetryStore::new();
        let runner = CycleRunner::new(
            camera,
            ScriptedClient::replying(60_000, "never"),
            Arc::new(display.clone()),
            Arc::new(LocalBus::new(64)),
            telemetry.clone(),
        );

        let handle = CaptureLoop::new(loop_config(OverlapPolicy::Skip), runner)
            .start()
            .await
            .expect("start");
        time::sleep(Duration::from_millis(2500)).await;
        let summary = handle.stop().await.expect("stop");

        assert!(released.load(Ordering::SeqCst));
        assert!(display.text().is_none());
        let counters = &summary.telemetry.counters;
        assert_eq!((counters.started, counters.succeeded, counters.failed), (1, 0, 1));
        assert!(summary
            .telemetry
            .last_error
            .as_deref()
            .is_some_and(|reason| reason.starts_with("cycle aborted")));
        assert_eq!(
            lifecycle_phases(&telemetry.snapshot_events().await),
            vec![
                LifecyclePhase::Boot,
                LifecyclePhase::StreamReady,
                LifecyclePhase::Running,
                LifecyclePhase::Stopping,
                LifecyclePhase::Stopped,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_upload_times_out_and_loop_recovers() {
        let client = ScriptedClient::new(
            vec![Scripted::Reply {
                delay_ms: 3_600_000,
                message: "never",
            }],
            Scripted::Reply {
                delay_ms: 0,
                message: "Present: Bob",
            },
        );
        let calls = client.calls();
        let display = SharedDisplay::new();
        let runner = runner_with(client, display.clone());

        // Default config: skip policy, no endpoint timeout, 10 s cycle bound.
        let handle = CaptureLoop::new(CaptureConfig::default(), runner)
            .start()
            .await
            .expect("start");
        time::sleep(Duration::from_millis(19_000)).await;
        let summary = handle.stop().await.expect("stop");

        let counters = &summary.telemetry.counters;
        assert_eq!(counters.failed, 1);
        assert!(counters.succeeded >= 3, "counters {counters:?}");
        assert!(counters.skipped >= 4, "counters {counters:?}");
        assert_eq!(
            counters.started,
            counters.succeeded + counters.failed,
            "every started cycle settles"
        );
        assert_eq!(
            summary.telemetry.last_error.as_deref(),
            Some("cycle timed out after 10000ms")
        );
        assert!(calls.lock().unwrap().len() >= 4);
        assert_eq!(display.text().as_deref(), Some("Present: Bob"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn encoding_runs_off_the_async_workers() {
        let display = SharedDisplay::new();
        let mut runner = runner_with(ScriptedClient::replying(0, "ok"), display.clone());
        runner.initialize_stream().await.expect("camera");

        for cycle in 1..=3 {
            runner.run_cycle(cycle).await.expect("cycle");
        }
        assert_eq!(display.preview_count(), 3);
        assert_eq!(display.history().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_loop() {
        let client = ScriptedClient::replying(0, "ok");
        let calls = client.calls();
        let runner = runner_with(client, SharedDisplay::new());

        let handle = CaptureLoop::new(loop_config(OverlapPolicy::Skip), runner)
            .start()
            .await
            .expect("start");
        drop(handle);
        time::sleep(Duration::from_millis(10_000)).await;
        assert!(calls.lock().unwrap().is_empty());
    }
}
