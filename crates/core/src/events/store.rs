//! Event store trait and query filter.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{EventRecord, EventSubject};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event store database error: {0}")]
    Database(String),

    #[error("event payload could not be encoded or decoded: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for EventError {
    fn from(err: rusqlite::Error) -> Self {
        EventError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

/// Which events to read back. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub subject: Option<EventSubject>,
    /// Batch, job or submission the event is about.
    pub entity_id: Option<String>,
    /// Job the event concerns, including its submissions' events.
    pub job_id: Option<String>,
    pub event_type: Option<String>,
    /// Inclusive time window.
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl EventFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: EventSubject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_time_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Page window; `count` ignores it.
    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Durable, append-only engine event log.
pub trait EventStore: Send + Sync {
    /// Append one record. Returns the assigned id.
    fn insert(&self, record: &EventRecord) -> Result<i64, EventError>;

    /// Append records in order. Returns how many were stored.
    fn insert_batch(&self, records: &[EventRecord]) -> Result<usize, EventError> {
        for record in records {
            self.insert(record)?;
        }
        Ok(records.len())
    }

    /// Matching records, newest first.
    fn query(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, EventError>;

    fn count(&self, filter: &EventFilter) -> Result<i64, EventError>;
}
