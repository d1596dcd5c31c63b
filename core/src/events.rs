//! Best-effort fan-out of accepted transitions.
//!
//! One broadcast channel; lagged receivers drop events. The channel is a
//! latency optimization, never the source of truth: clients reconcile by
//! re-fetching state.

use tokio::sync::broadcast;
use vigil_protocol::SwitchEvent;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SwitchEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitchEvent> {
        self.tx.subscribe()
    }

    /// Send to whoever is listening; no receivers is not an error.
    pub fn emit(&self, event: SwitchEvent) {
        tracing::debug!(event = event.name(), "fan-out");
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
