use std::{
    collections::VecDeque,
    sync::mpsc::{Receiver, Sender, TryRecvError},
    time::Duration,
};

use anyhow::Result;
use crossterm::{
    event::{self, Event as CEvent, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Terminal,
};
use rollcall_codec::PreviewFrame;
use rollcall_orchestrator::StatusDisplay;
use rollcall_types::{
    events::{CycleOutcome, EventPayload, SystemEvent},
    frame::FrameBuffer,
    RollcallError,
};

const MAX_LOG_ENTRIES: usize = 120;
/// Preview resolution in pixels; two pixel rows share one terminal row.
const PREVIEW_MAX_WIDTH: u32 = 96;
const PREVIEW_MAX_HEIGHT: u32 = 72;

pub enum UiMessage {
    Event(SystemEvent),
    Status(String),
    Error(String),
    Preview(PreviewFrame),
    Shutdown,
}

/// Display surface that feeds the terminal UI thread.
pub struct TerminalDisplay {
    tx: Sender<UiMessage>,
}

impl TerminalDisplay {
    pub fn new(tx: Sender<UiMessage>) -> Self {
        Self { tx }
    }
}

impl StatusDisplay for TerminalDisplay {
    fn show_message(&self, message: &str) {
        let _ = self.tx.send(UiMessage::Status(message.to_string()));
    }

    fn show_error(&self, error: &RollcallError) {
        let _ = self.tx.send(UiMessage::Error(error.to_string()));
    }

    fn show_preview(&self, frame: &FrameBuffer) {
        match PreviewFrame::from_frame(frame, PREVIEW_MAX_WIDTH, PREVIEW_MAX_HEIGHT) {
            Ok(preview) => {
                let _ = self.tx.send(UiMessage::Preview(preview));
            }
            Err(err) => tracing::debug!("Preview skipped: {err}"),
        }
    }
}

#[derive(Default)]
struct ViewState {
    logs: VecDeque<String>,
    status: Option<String>,
    status_is_error: bool,
    preview: Option<PreviewFrame>,
}

impl ViewState {
    fn apply(&mut self, message: UiMessage) -> bool {
        match message {
            UiMessage::Event(event) => {
                if self.logs.len() == MAX_LOG_ENTRIES {
                    self.logs.pop_front();
                }
                self.logs.push_back(format_event(&event));
            }
            UiMessage::Status(text) => {
                self.status = Some(text);
                self.status_is_error = false;
            }
            UiMessage::Error(text) => {
                self.status = Some(format!("error: {text}"));
                self.status_is_error = true;
            }
            UiMessage::Preview(preview) => self.preview = Some(preview),
            UiMessage::Shutdown => return true,
        }
        false
    }
}

pub fn run(receiver: Receiver<UiMessage>, summary: String) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;

    let res = run_loop(&mut terminal, receiver, summary.as_str());

    terminal.show_cursor()?;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    res
}

fn run_loop<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    receiver: Receiver<UiMessage>,
    summary: &str,
) -> Result<()> {
    let mut view = ViewState::default();

    loop {
        let mut should_close = false;
        loop {
            match receiver.try_recv() {
                Ok(message) => {
                    if view.apply(message) {
                        should_close = true;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    should_close = true;
                    break;
                }
            }
        }
        if should_close {
            break;
        }

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
                .split(f.size());

            let status_style = if view.status_is_error {
                Style::default().fg(Color::Red)
            } else {
                Style::default().add_modifier(Modifier::BOLD)
            };
            let header = Paragraph::new(Line::from(vec![
                Span::styled(
                    "Attendance",
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw("  "),
                Span::styled(
                    view.status.clone().unwrap_or_else(|| "waiting...".into()),
                    status_style,
                ),
                Span::raw("  "),
                Span::styled("camera:", Style::default().fg(Color::Magenta)),
                Span::raw(" "),
                Span::raw(summary),
                Span::raw("  "),
                Span::styled("q", Style::default().fg(Color::Yellow)),
                Span::raw(" to quit"),
            ]))
            .block(Block::default().borders(Borders::ALL).title("Status"));
            f.render_widget(header, chunks[0]);

            let body = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)].as_ref())
                .split(chunks[1]);

            let preview_block = Block::default().borders(Borders::ALL).title("Camera");
            let inner = preview_block.inner(body[0]);
            let preview = Paragraph::new(match &view.preview {
                Some(frame) => preview_lines(frame, inner),
                None => vec![Line::from("no frame yet")],
            })
            .block(preview_block);
            f.render_widget(preview, body[0]);

            let items: Vec<ListItem> = view
                .logs
                .iter()
                .rev()
                .map(|entry| ListItem::new(entry.clone()))
                .collect();
            let list = List::new(items)
                .block(Block::default().borders(Borders::ALL).title("Recent events"));
            f.render_widget(list, body[1]);
        })?;

        if event::poll(Duration::from_millis(100))? {
            if let CEvent::Key(key) = event::read()? {
                let ctrl_c = key.code == KeyCode::Char('c')
                    && key.modifiers.contains(KeyModifiers::CONTROL);
                if ctrl_c || matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Half-block rendering: each cell shows two stacked pixels.
fn preview_lines(frame: &PreviewFrame, area: Rect) -> Vec<Line<'static>> {
    let cols = frame.width.min(area.width as u32);
    let rows = ((frame.height + 1) / 2).min(area.height as u32);
    (0..rows)
        .map(|row| {
            let spans: Vec<Span<'static>> = (0..cols)
                .map(|col| {
                    let top = frame.pixel(col, row * 2).unwrap_or([0, 0, 0]);
                    let bottom = frame.pixel(col, row * 2 + 1).unwrap_or([0, 0, 0]);
                    Span::styled(
                        "\u{2580}",
                        Style::default().fg(rgb(top)).bg(rgb(bottom)),
                    )
                })
                .collect();
            Line::from(spans)
        })
        .collect()
}

fn rgb([r, g, b]: [u8; 3]) -> Color {
    Color::Rgb(r, g, b)
}

fn format_event(event: &SystemEvent) -> String {
    let timestamp = event.timestamp.format("%H:%M:%S");
    match &event.payload {
        EventPayload::Lifecycle(lifecycle) => format!(
            "[{}] Lifecycle::{:?} {}",
            timestamp,
            lifecycle.phase,
            lifecycle.details.clone().unwrap_or_default()
        ),
        EventPayload::Cycle(cycle) => match &cycle.outcome {
            CycleOutcome::Reported { message } => format!(
                "[{}] #{} {} ({} ms)",
                timestamp,
                cycle.cycle,
                message,
                cycle.metrics.as_ref().map(|m| m.total_ms).unwrap_or_default()
            ),
            CycleOutcome::Failed { kind, reason } => {
                format!("[{}] #{} failed [{}] {}", timestamp, cycle.cycle, kind, reason)
            }
            CycleOutcome::Skipped { in_flight } => format!(
                "[{}] #{} skipped, {} in flight",
                timestamp, cycle.cycle, in_flight
            ),
        },
        EventPayload::Ops(ops) => format!(
            "[{}] Ops {} [{}]",
            timestamp,
            ops.message,
            ops.tags.join(", ")
        ),
    }
}
