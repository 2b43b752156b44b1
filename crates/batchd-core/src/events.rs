//! Batch lifecycle event bus
//!
//! Emits one event per committed batch transition on a broadcast channel.
//! Subscribers (admin UIs, log tails) are external; a full channel drops
//! the oldest events rather than blocking the workflow.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::state::BatchState;

/// One committed batch state change.
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub batch_id: String,
    pub from: BatchState,
    pub to: BatchState,
    pub at: DateTime<Utc>,
}

/// Broadcast bus for batch events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; send errors just mean nobody is listening.
    pub fn emit(&self, batch_id: &str, from: BatchState, to: BatchState) {
        let _ = self.tx.send(BatchEvent {
            batch_id: batch_id.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit("b1", BatchState::Building, BatchState::Uploading);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.batch_id, "b1");
        assert_eq!(event.to, BatchState::Uploading);
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit("b1", BatchState::Building, BatchState::Uploading);
    }
}
