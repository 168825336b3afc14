//! Work item types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::{ErrorKind, ExecutionError};
use crate::lifecycle::{SubmissionStatus, WorkStatus};
use crate::retry::RetryPolicy;

/// Lowest accepted priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest accepted priority; aging never goes past it either.
pub const MAX_PRIORITY: u8 = 10;
/// Priority used when nothing else is specified.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Rolled-up child counters of a batch or job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl Progress {
    /// Share of children that reached a terminal outcome, 0.0 to 1.0.
    pub fn fraction_done(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.completed + self.failed) / f64::from(self.total)
    }
}

/// A named collection of jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub status: WorkStatus,
    /// 1 to 10, higher is dispatched sooner.
    pub priority: u8,
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn progress(&self) -> Progress {
        Progress {
            total: self.total_jobs,
            completed: self.completed_jobs,
            failed: self.failed_jobs,
        }
    }
}

/// A unit of grading work bound to one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Owning batch, `None` for a standalone job.
    pub batch_id: Option<String>,
    pub name: String,
    pub status: WorkStatus,
    /// Override; `None` inherits the batch priority.
    pub priority: Option<u8>,
    pub provider: String,
    pub retry_policy: RetryPolicy,
    pub total_submissions: u32,
    pub completed_submissions: u32,
    pub failed_submissions: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn progress(&self) -> Progress {
        Progress {
            total: self.total_submissions,
            completed: self.completed_submissions,
            failed: self.failed_submissions,
        }
    }

    /// Priority used for dispatch ordering: the higher of the job override and
    /// the owning batch priority.
    pub fn scheduling_priority(&self, batch_priority: Option<u8>) -> u8 {
        match (self.priority, batch_priority) {
            (Some(own), Some(batch)) => own.max(batch),
            (Some(own), None) => own,
            (None, Some(batch)) => batch,
            (None, None) => DEFAULT_PRIORITY,
        }
    }
}

/// Classified error recorded on a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ExecutionError> for SubmissionError {
    fn from(err: &ExecutionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

/// One document to grade; one executor call per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub job_id: String,
    pub status: SubmissionStatus,
    /// Retries consumed so far.
    pub attempt_count: u32,
    pub payload: serde_json::Value,
    /// Result reference once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SubmissionError>,
    pub enqueued_at: DateTime<Utc>,
    /// Not dispatched before this instant (retry backoff).
    pub ready_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
