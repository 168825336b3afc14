use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

use super::EngineEvent;

/// Envelope wrapping an engine event with metadata
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: EngineEvent,
}

/// Handle for emitting engine events
///
/// This is cheaply cloneable and can be shared across tasks.
/// Events go to the EventWriter for persistence and to every live subscriber.
#[derive(Clone)]
pub struct EventHandle {
    tx: mpsc::Sender<EventEnvelope>,
    live: broadcast::Sender<EventEnvelope>,
}

impl EventHandle {
    /// Create a new event handle from a channel sender
    pub fn new(tx: mpsc::Sender<EventEnvelope>, subscriber_capacity: usize) -> Self {
        let (live, _) = broadcast::channel(subscriber_capacity.max(1));
        Self { tx, live }
    }

    /// Observe events as they are emitted. Slow receivers lag and skip.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.live.subscribe()
    }

    fn envelope(event: EngineEvent) -> EventEnvelope {
        EventEnvelope {
            timestamp: Utc::now(),
            event,
        }
    }

    /// Emit an event asynchronously
    ///
    /// If the channel is closed, the error is logged but the caller is not failed.
    pub async fn emit(&self, event: EngineEvent) {
        let envelope = Self::envelope(event);
        // No subscribers is fine.
        let _ = self.live.send(envelope.clone());
        if let Err(e) = self.tx.send(envelope).await {
            tracing::error!("Failed to emit engine event: {}", e);
        }
    }

    /// Try to emit an event without blocking
    ///
    /// Returns true if the event was queued for persistence, false otherwise.
    pub fn try_emit(&self, event: EngineEvent) -> bool {
        let envelope = Self::envelope(event);
        let _ = self.live.send(envelope.clone());
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to emit engine event: {}", e);
                false
            }
        }
    }
}
