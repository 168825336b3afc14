use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::{Action, EntityKind, WorkStatus};
use crate::retry::GiveUpReason;
use crate::work::SubmissionError;

use super::EventEnvelope;

/// Level of the work tree an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSubject {
    Service,
    Batch,
    Job,
    Submission,
}

impl EventSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSubject::Service => "service",
            EventSubject::Batch => "batch",
            EventSubject::Job => "job",
            EventSubject::Submission => "submission",
        }
    }
}

impl From<EntityKind> for EventSubject {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Batch => EventSubject::Batch,
            EntityKind::Job => EventSubject::Job,
        }
    }
}

impl fmt::Display for EventSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSubject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(EventSubject::Service),
            "batch" => Ok(EventSubject::Batch),
            "job" => Ok(EventSubject::Job),
            "submission" => Ok(EventSubject::Submission),
            other => Err(format!("unknown event subject: {}", other)),
        }
    }
}

/// Engine event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Work tree
    BatchCreated {
        batch_id: String,
        name: String,
        priority: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
    JobCreated {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
        provider: String,
    },
    /// A batch or job moved between statuses.
    StatusChanged {
        entity: EntityKind,
        entity_id: String,
        from: WorkStatus,
        to: WorkStatus,
        /// Operation that caused the move (e.g. "pause", "settle").
        action: String,
    },
    Duplicated {
        entity: EntityKind,
        source_id: String,
        new_id: String,
    },

    // Submissions
    SubmissionDispatched {
        submission_id: String,
        job_id: String,
        provider: String,
        /// Retries consumed before this call
        attempt: u32,
    },
    SubmissionCompleted {
        submission_id: String,
        job_id: String,
        duration_ms: u64,
    },
    SubmissionRetryScheduled {
        submission_id: String,
        job_id: String,
        /// New attempt count
        attempt: u32,
        delay_ms: u64,
        error: SubmissionError,
    },
    SubmissionFailed {
        submission_id: String,
        job_id: String,
        reason: GiveUpReason,
        error: SubmissionError,
    },
    /// An in-flight result arrived after its submission was cancelled.
    SubmissionResultDiscarded {
        submission_id: String,
        job_id: String,
    },
    SubmissionsReset {
        job_id: String,
        count: u32,
    },
}

impl EngineEvent {
    pub fn status_changed(
        entity: EntityKind,
        entity_id: impl Into<String>,
        from: WorkStatus,
        to: WorkStatus,
        action: Action,
    ) -> Self {
        Self::StatusChanged {
            entity,
            entity_id: entity_id.into(),
            from,
            to,
            action: action.as_str().to_string(),
        }
    }

    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::BatchCreated { .. } => "batch_created",
            Self::JobCreated { .. } => "job_created",
            Self::StatusChanged { .. } => "status_changed",
            Self::Duplicated { .. } => "duplicated",
            Self::SubmissionDispatched { .. } => "submission_dispatched",
            Self::SubmissionCompleted { .. } => "submission_completed",
            Self::SubmissionRetryScheduled { .. } => "submission_retry_scheduled",
            Self::SubmissionFailed { .. } => "submission_failed",
            Self::SubmissionResultDiscarded { .. } => "submission_result_discarded",
            Self::SubmissionsReset { .. } => "submissions_reset",
        }
    }

    pub fn subject(&self) -> EventSubject {
        match self {
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => EventSubject::Service,
            Self::BatchCreated { .. } => EventSubject::Batch,
            Self::JobCreated { .. } | Self::SubmissionsReset { .. } => EventSubject::Job,
            Self::StatusChanged { entity, .. } | Self::Duplicated { entity, .. } => {
                EventSubject::from(*entity)
            }
            Self::SubmissionDispatched { .. }
            | Self::SubmissionCompleted { .. }
            | Self::SubmissionRetryScheduled { .. }
            | Self::SubmissionFailed { .. }
            | Self::SubmissionResultDiscarded { .. } => EventSubject::Submission,
        }
    }

    /// The entity the event is primarily about.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => None,
            Self::BatchCreated { batch_id, .. } => Some(batch_id),
            Self::JobCreated { job_id, .. } | Self::SubmissionsReset { job_id, .. } => Some(job_id),
            Self::StatusChanged { entity_id, .. } => Some(entity_id),
            Self::Duplicated { new_id, .. } => Some(new_id),
            Self::SubmissionDispatched { submission_id, .. }
            | Self::SubmissionCompleted { submission_id, .. }
            | Self::SubmissionRetryScheduled { submission_id, .. }
            | Self::SubmissionFailed { submission_id, .. }
            | Self::SubmissionResultDiscarded { submission_id, .. } => Some(submission_id),
        }
    }

    /// Extract job_id if this event concerns a job or its submissions
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobCreated { job_id, .. }
            | Self::SubmissionsReset { job_id, .. }
            | Self::SubmissionDispatched { job_id, .. }
            | Self::SubmissionCompleted { job_id, .. }
            | Self::SubmissionRetryScheduled { job_id, .. }
            | Self::SubmissionFailed { job_id, .. }
            | Self::SubmissionResultDiscarded { job_id, .. } => Some(job_id),
            Self::StatusChanged {
                entity: EntityKind::Job,
                entity_id,
                ..
            } => Some(entity_id),
            _ => None,
        }
    }
}

/// Stored event with its indexed columns pulled out of the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Assigned by the store; 0 before insertion.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub subject: EventSubject,
    pub event_type: String,
    pub entity_id: Option<String>,
    pub job_id: Option<String>,
    pub data: EngineEvent,
}

impl From<EventEnvelope> for EventRecord {
    fn from(envelope: EventEnvelope) -> Self {
        let event = envelope.event;
        Self {
            id: 0,
            timestamp: envelope.timestamp,
            subject: event.subject(),
            event_type: event.event_type().to_string(),
            entity_id: event.entity_id().map(String::from),
            job_id: event.job_id().map(String::from),
            data: event,
        }
    }
}
