//! Surfaces that show the latest attendance status.

use std::sync::{Arc, Mutex};

use rollcall_types::{frame::FrameBuffer, RollcallError};
use tracing::info;

pub trait StatusDisplay: Send + Sync {
    /// Replaces the visible status text.
    fn show_message(&self, message: &str);

    /// Called for failed cycles only when error surfacing is enabled.
    fn show_error(&self, _error: &RollcallError) {}

    /// Live preview of the frame being uploaded.
    fn show_preview(&self, _frame: &FrameBuffer) {}
}

#[derive(Debug, Default, Clone)]
struct DisplayState {
    text: Option<String>,
    history: Vec<String>,
    preview: Option<(u32, u32)>,
    previews: u64,
}

/// In-memory display, cheap to clone and inspect.
#[derive(Debug, Default, Clone)]
pub struct SharedDisplay {
    state: Arc<Mutex<DisplayState>>,
}

impl SharedDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        let display = Self::new();
        display.set_text(text);
        display
    }

    pub fn text(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.text.clone())
    }

    /// Every text written, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn preview_dimensions(&self) -> Option<(u32, u32)> {
        self.state.lock().ok().and_then(|s| s.preview)
    }

    pub fn preview_count(&self) -> u64 {
        self.state.lock().map(|s| s.previews).unwrap_or_default()
    }

    fn set_text(&self, text: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            let text = text.into();
            state.history.push(text.clone());
            state.text = Some(text);
        }
    }
}

impl StatusDisplay for SharedDisplay {
    fn show_message(&self, message: &str) {
        self.set_text(message);
    }

    fn show_error(&self, error: &RollcallError) {
        self.set_text(format!("error: {error}"));
    }

    fn show_preview(&self, frame: &FrameBuffer) {
        if let Ok(mut state) = self.state.lock() {
            state.preview = Some((frame.width, frame.height));
            state.previews += 1;
        }
    }
}

/// Headless display: prints each status line to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show_message(&self, message: &str) {
        info!(status = message, "Status updated");
        println!("{message}");
    }

    fn show_error(&self, error: &RollcallError) {
        println!("error: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_display_tracks_text_and_history() {
        let display = SharedDisplay::with_text("waiting");
        display.show_message("Present: Alice");
        display.show_error(&RollcallError::Network("503".into()));
        assert_eq!(display.text().as_deref(), Some("error: network error: 503"));
        assert_eq!(
            display.history(),
            vec![
                "waiting".to_string(),
                "Present: Alice".to_string(),
                "error: network error: 503".to_string()
            ]
        );
    }

    #[test]
    fn clones_share_state() {
        let display = SharedDisplay::new();
        let observer = display.clone();
        display.show_preview(&FrameBuffer::from_rgba(2, 1, vec![0; 8]).unwrap());
        assert_eq!(observer.preview_dimensions(), Some((2, 1)));
        assert_eq!(observer.preview_count(), 1);
        assert!(observer.text().is_none());
    }
}
