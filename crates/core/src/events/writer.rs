use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{EventEnvelope, EventHandle, EventRecord, EventStore};
use crate::metrics;

/// Most events persisted in one store transaction.
const WRITE_BATCH: usize = 64;

/// Background task that persists emitted events.
///
/// Events already waiting in the channel are written together, so a burst of
/// dispatches costs one transaction instead of one per event.
pub struct EventWriter {
    rx: mpsc::Receiver<EventEnvelope>,
    store: Arc<dyn EventStore>,
}

impl EventWriter {
    pub fn new(rx: mpsc::Receiver<EventEnvelope>, store: Arc<dyn EventStore>) -> Self {
        Self { rx, store }
    }

    /// Run until every [`EventHandle`] is dropped and the channel is drained.
    pub async fn run(mut self) {
        info!("Event writer started");

        let mut pending = Vec::with_capacity(WRITE_BATCH);
        let mut stored: u64 = 0;
        while self.rx.recv_many(&mut pending, WRITE_BATCH).await > 0 {
            let records: Vec<EventRecord> = pending.drain(..).map(EventRecord::from).collect();
            stored += self.persist(&records);
        }

        info!(stored, "Event writer shutting down");
    }

    fn persist(&self, records: &[EventRecord]) -> u64 {
        let count = records.len() as u64;
        match self.store.insert_batch(records) {
            Ok(_) => {
                debug!(count, "Persisted engine events");
                metrics::EVENT_WRITES
                    .with_label_values(&["stored"])
                    .inc_by(count);
                count
            }
            Err(e) => {
                let types: Vec<&str> = records.iter().map(|r| r.event_type.as_str()).collect();
                error!(count, ?types, "Failed to persist engine events: {}", e);
                metrics::EVENT_WRITES
                    .with_label_values(&["dropped"])
                    .inc_by(count);
                0
            }
        }
    }
}

/// Wire an [`EventHandle`] to a new [`EventWriter`].
///
/// `buffer_size` bounds both the persistence channel and the live subscriber
/// backlog. Spawn the writer with `tokio::spawn(writer.run())`.
pub fn create_event_system(
    store: Arc<dyn EventStore>,
    buffer_size: usize,
) -> (EventHandle, EventWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = EventHandle::new(tx, buffer_size);
    let writer = EventWriter::new(rx, store);
    (handle, writer)
}
