//! Networking: the attendance upload client and the in-process event bus.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use rollcall_types::{events::SystemEvent, Result, RollcallError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

mod http;

pub use http::{AttendanceClient, HttpAttendanceClient};

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: SystemEvent) -> Result<()>;
    fn subscribe(&self) -> BoxStream<'static, SystemEvent>;
}

/// In-process bus backed by a broadcast channel. Slow subscribers drop events.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, event: SystemEvent) -> Result<()> {
        // No subscribers is not an error.
        if self.tx.send(event).is_err() {
            debug!("Event dropped: no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, SystemEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }
}

pub fn network_error(message: impl Into<String>) -> RollcallError {
    RollcallError::Network(message.into())
}
