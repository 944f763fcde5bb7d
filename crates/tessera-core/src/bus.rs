use std::sync::Arc;

use crate::event::Event;
use crate::types::RunId;

/// An appended event tagged with the run it belongs to.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub run_id: RunId,
    pub event: Arc<Event>,
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, run_id: &RunId, event: Arc<Event>) {
        // Ignore error if no receivers
        let _ = self.tx.send(BusEvent {
            run_id: run_id.clone(),
            event,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
