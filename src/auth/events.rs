// Session event bus

use tokio::sync::broadcast;

use super::types::AuthEvent;

/// Fire-and-forget bus for session lifecycle events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AuthEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: AuthEvent) {
        tracing::info!(event = %event, "Auth event");
        if self.tx.send(event).is_err() {
            tracing::trace!(event = %event, "No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }
}
