//! Work store trait and request types.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::lifecycle::{ChildTally, SubmissionStatus, TransitionError, WorkStatus};
use crate::retry::RetryPolicy;

use super::types::{Batch, Job, Progress, Submission, SubmissionError};

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A compare-and-set lost against a concurrent writer.
    #[error("{kind} {id} changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Database(format!("serialization: {}", err))
    }
}

/// Request to create a new batch. Batches start in `draft`.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub name: String,
    pub priority: u8,
    pub tags: BTreeSet<String>,
    pub owner: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Request to create a new job. Jobs start in `draft`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub batch_id: Option<String>,
    pub name: String,
    pub priority: Option<u8>,
    pub provider: String,
    pub retry_policy: RetryPolicy,
}

/// Request to add a queued submission to a job.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub job_id: String,
    pub payload: serde_json::Value,
}

/// A validated change to one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionUpdate {
    /// `queued -> in_progress`; dispatch claim.
    Claim,
    /// `in_progress -> completed`.
    Complete { output: String },
    /// `in_progress -> failed`.
    Fail { error: SubmissionError },
    /// `in_progress -> queued`; consumes one retry.
    Requeue {
        ready_at: DateTime<Utc>,
        error: SubmissionError,
    },
    /// `queued | in_progress -> cancelled`.
    Cancel,
    /// `failed -> queued`; keeps the attempt count.
    Reset,
}

impl SubmissionUpdate {
    /// Status the submission ends up in.
    pub fn target(&self) -> SubmissionStatus {
        match self {
            SubmissionUpdate::Claim => SubmissionStatus::InProgress,
            SubmissionUpdate::Complete { .. } => SubmissionStatus::Completed,
            SubmissionUpdate::Fail { .. } => SubmissionStatus::Failed,
            SubmissionUpdate::Requeue { .. } | SubmissionUpdate::Reset => SubmissionStatus::Queued,
            SubmissionUpdate::Cancel => SubmissionStatus::Cancelled,
        }
    }
}

/// Filter for querying batches.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub status: Option<WorkStatus>,
    pub min_priority: Option<u8>,
    pub max_priority: Option<u8>,
    /// Batches carrying this tag.
    pub tag: Option<String>,
    pub owner: Option<String>,
    /// Maximum number of results; negative means unbounded.
    pub limit: i64,
    pub offset: i64,
}

impl BatchFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: WorkStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_priority_range(mut self, min: Option<u8>, max: Option<u8>) -> Self {
        self.min_priority = min;
        self.max_priority = max;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set offset.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub batch_id: Option<String>,
    pub status: Option<WorkStatus>,
    pub provider: Option<String>,
    /// Bounds on the scheduling priority (override or inherited).
    pub min_priority: Option<u8>,
    pub max_priority: Option<u8>,
    /// Maximum number of results; negative means unbounded.
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_status(mut self, status: WorkStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_priority_range(mut self, min: Option<u8>, max: Option<u8>) -> Self {
        self.min_priority = min;
        self.max_priority = max;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Drop the page size limit.
    pub fn unbounded(mut self) -> Self {
        self.limit = -1;
        self.offset = 0;
        self
    }
}

/// Filter for querying submissions.
#[derive(Debug, Clone, Default)]
pub struct SubmissionFilter {
    pub job_id: Option<String>,
    pub status: Option<SubmissionStatus>,
    /// Maximum number of results; negative means unbounded.
    pub limit: i64,
    pub offset: i64,
}

impl SubmissionFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_status(mut self, status: SubmissionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Drop the page size limit.
    pub fn unbounded(mut self) -> Self {
        self.limit = -1;
        self.offset = 0;
        self
    }
}

/// Durable storage for the batch/job/submission tree.
///
/// Status writes are compare-and-set against the expected current status, so
/// a concurrent writer makes the call fail with [`StoreError::Conflict`]
/// instead of being overwritten.
pub trait WorkStore: Send + Sync {
    // Batches

    fn create_batch(&self, batch: NewBatch) -> Result<Batch, StoreError>;

    fn get_batch(&self, id: &str) -> Result<Option<Batch>, StoreError>;

    fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<Batch>, StoreError>;

    fn count_batches(&self, filter: &BatchFilter) -> Result<i64, StoreError>;

    /// Move a batch from `from` to `to` if it is still in `from`.
    fn transition_batch(&self, id: &str, from: WorkStatus, to: WorkStatus)
        -> Result<Batch, StoreError>;

    fn set_batch_progress(&self, id: &str, progress: Progress) -> Result<Batch, StoreError>;

    /// Count the batch's jobs by outcome.
    fn job_tally(&self, batch_id: &str) -> Result<ChildTally, StoreError>;

    // Jobs

    fn create_job(&self, job: NewJob) -> Result<Job, StoreError>;

    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, StoreError>;

    /// Move a job from `from` to `to` if it is still in `from`.
    fn transition_job(&self, id: &str, from: WorkStatus, to: WorkStatus)
        -> Result<Job, StoreError>;

    fn set_job_progress(&self, id: &str, progress: Progress) -> Result<Job, StoreError>;

    /// Count the job's submissions by outcome.
    fn submission_tally(&self, job_id: &str) -> Result<ChildTally, StoreError>;

    // Submissions

    fn add_submission(&self, submission: NewSubmission) -> Result<Submission, StoreError>;

    fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError>;

    fn list_submissions(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>, StoreError>;

    fn count_submissions(&self, filter: &SubmissionFilter) -> Result<i64, StoreError>;

    /// Apply `update` to a submission currently in `from`.
    fn transition_submission(
        &self,
        id: &str,
        from: SubmissionStatus,
        update: SubmissionUpdate,
    ) -> Result<Submission, StoreError>;

    /// Cancel every queued or in-progress submission of a job.
    /// Returns how many were cancelled.
    fn cancel_open_submissions(&self, job_id: &str) -> Result<u32, StoreError>;

    /// Put every failed submission of a job back in the queue, keeping attempt
    /// counts. Returns the reset submissions.
    fn reset_failed_submissions(&self, job_id: &str) -> Result<Vec<Submission>, StoreError>;

    /// Return every in-progress submission not listed in `keep` to `queued`
    /// (crash recovery). Returns how many were released.
    fn release_in_progress(&self, keep: &HashSet<String>) -> Result<u32, StoreError>;
}
