mod ui;

use std::{env, path::PathBuf, sync::mpsc, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use futures::{future, stream::BoxStream, StreamExt};
use rollcall_capture::CameraDevice;
use rollcall_codec::CaptureArchive;
use rollcall_network::{EventBus, HttpAttendanceClient, LocalBus};
use rollcall_ops::{ensure_telemetry_dir, init_tracing, LogTarget, TelemetryStore};
use rollcall_orchestrator::{CaptureLoop, CycleRunner, LogDisplay, StatusDisplay};
use rollcall_types::{
    config::{CameraConfig, RollcallConfig},
    events::{CycleOutcome, EventPayload, SystemEvent},
};
use tracing::{info, warn};

use crate::ui::{TerminalDisplay, UiMessage};

const DEFAULT_CONFIG_PATH: &str = "configs/rollcall.toml";

/// Periodically photographs the room and reports attendance.
#[derive(Debug, Parser)]
#[command(name = "rollcall", version)]
struct Args {
    /// Config file (falls back to ROLLCALL_CONFIG, then configs/rollcall.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Attendance endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Milliseconds between captures
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Use the generated test pattern instead of a camera
    #[arg(long)]
    synthetic: bool,

    /// Print status lines instead of drawing the terminal UI
    #[arg(long)]
    headless: bool,

    /// Exit after this many completed cycles (implies --headless)
    #[arg(long)]
    cycles: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut RollcallConfig) {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint.url = endpoint.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            config.capture.interval_ms = interval_ms;
        }
        if self.synthetic {
            config.camera = CameraConfig::synthetic();
        }
    }

    fn headless(&self) -> bool {
        self.headless || self.cycles.is_some()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.clone());
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let telemetry_dir = ensure_telemetry_dir(&config.ops.telemetry_dir)?;
    let log_target = if args.headless() {
        LogTarget::Stderr
    } else {
        LogTarget::File(telemetry_dir.join("rollcall.log"))
    };
    init_tracing(&config.ops, log_target)?;

    let camera = CameraDevice::from_config(&config.camera);
    let summary = camera.describe();
    let uploader = HttpAttendanceClient::new(&config.endpoint)?;
    let bus = LocalBus::new(256);
    let telemetry = TelemetryStore::with_capacity(config.ops.max_events);

    let (ui_tx, ui_rx) = mpsc::channel();
    let display: Arc<dyn StatusDisplay> = if args.headless() {
        Arc::new(LogDisplay)
    } else {
        Arc::new(TerminalDisplay::new(ui_tx.clone()))
    };

    let runner = CycleRunner::new(
        camera,
        uploader,
        display,
        Arc::new(bus.clone()),
        telemetry.clone(),
    )
    .with_archive(CaptureArchive::from_option(config.ops.capture_dir.as_deref()))
    .surface_errors(config.capture.surface_errors);

    let events = bus.subscribe();
    info!(
        "Reporting to {} every {}ms using {}",
        config.endpoint.url, config.capture.interval_ms, summary
    );
    let handle = CaptureLoop::new(config.capture.clone(), runner)
        .start()
        .await
        .with_context(|| format!("failed to start capture from {summary}"))?;

    if args.headless() {
        wait_headless(args.cycles, events).await?;
    } else {
        run_terminal_ui(ui_tx, ui_rx, events, summary).await?;
    }

    let summary = handle.stop().await?;
    let counters = &summary.telemetry.counters;
    info!(
        "Stopped: {} cycle(s), {} reported, {} failed, {} skipped",
        counters.started, counters.succeeded, counters.failed, counters.skipped
    );
    if let Err(err) = telemetry.export_events(&telemetry_dir).await {
        warn!("Telemetry export failed: {err}");
    }
    Ok(())
}

/// Blocks until Ctrl-C, or until `cycles` cycles have run to completion.
async fn wait_headless(
    cycles: Option<u64>,
    events: BoxStream<'static, SystemEvent>,
) -> Result<()> {
    let Some(cycles) = cycles else {
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };

    let completed = events
        .filter(|event| future::ready(is_completed_cycle(event)))
        .take(cycles as usize)
        .count();
    tokio::select! {
        done = completed => info!("Completed {done} cycle(s)"),
        signal = tokio::signal::ctrl_c() => signal?,
    }
    Ok(())
}

fn is_completed_cycle(event: &SystemEvent) -> bool {
    matches!(
        &event.payload,
        EventPayload::Cycle(cycle) if !matches!(cycle.outcome, CycleOutcome::Skipped { .. })
    )
}

async fn run_terminal_ui(
    ui_tx: mpsc::Sender<UiMessage>,
    ui_rx: mpsc::Receiver<UiMessage>,
    mut events: BoxStream<'static, SystemEvent>,
    summary: String,
) -> Result<()> {
    let forward_tx = ui_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if forward_tx.send(UiMessage::Event(event)).is_err() {
                break;
            }
        }
    });

    let mut ui_task = tokio::task::spawn_blocking(move || ui::run(ui_rx, summary));
    let result = tokio::select! {
        joined = &mut ui_task => joined?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            let _ = ui_tx.send(UiMessage::Shutdown);
            ui_task.await?
        }
    };
    forwarder.abort();
    result
}

fn load_config(from_args: Option<PathBuf>) -> RollcallConfig {
    let from_env = env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
    let path = from_args
        .or(from_env)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    match RollcallConfig::from_file(&path) {
        Ok(cfg) => {
            if let Err(err) = cfg.validate() {
                eprintln!(
                    "Invalid config in '{}': {err}. Falling back to internal defaults.",
                    path.display()
                );
                RollcallConfig::default()
            } else {
                cfg
            }
        }
        Err(err) => {
            eprintln!(
                "Failed to load config from '{}': {err}. Falling back to internal defaults.",
                path.display()
            );
            RollcallConfig::default()
        }
    }
}
