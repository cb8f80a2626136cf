//! Lifecycle event fan-out
//!
//! The registry commits a state change and hands the matching broadcast to
//! the broker in the same critical section, so subscribers observe events in
//! commit order per device. The broker holds no references to signaling
//! channels; observers subscribe and the embedder forwards to sockets.

use crate::signaling::FabricEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Default fan-out buffer
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcast broker for lifecycle events
#[derive(Debug)]
pub struct EventBroker {
    tx: broadcast::Sender<FabricEvent>,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBroker {
    /// Create a broker with a given fan-out buffer
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one event to all current subscribers
    ///
    /// Lagging or absent subscribers never block the fabric; a send with no
    /// receivers is a no-op.
    pub fn emit(&self, event: FabricEvent) {
        debug!(?event, "lifecycle event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
