//! Status enums shared by the work item types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which kind of parent entity a lifecycle applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Batch,
    Job,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Batch => "batch",
            EntityKind::Job => "job",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a batch or a job.
///
/// State machine flow:
/// ```text
/// Draft -> Pending -> Processing <-> Paused
///                          |
///                          v
///     Completed | CompletedWithErrors | Failed | Cancelled -> Archived
/// ```
///
/// Jobs never reach `Archived`; only batches are archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Created, still being assembled.
    Draft,
    /// Marked ready, waiting for `start`.
    Pending,
    /// Eligible for dispatch.
    Processing,
    /// Dispatch suspended; in-flight work still completes.
    Paused,
    /// Every child completed.
    Completed,
    /// Children settled with a mix of completions and failures.
    CompletedWithErrors,
    /// No child completed.
    Failed,
    /// Cancelled by the control surface.
    Cancelled,
    /// Frozen; no further mutation.
    Archived,
}

impl WorkStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [WorkStatus; 9] = [
        WorkStatus::Draft,
        WorkStatus::Pending,
        WorkStatus::Processing,
        WorkStatus::Paused,
        WorkStatus::Completed,
        WorkStatus::CompletedWithErrors,
        WorkStatus::Failed,
        WorkStatus::Cancelled,
        WorkStatus::Archived,
    ];

    /// Returns true if no automatic transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Completed
                | WorkStatus::CompletedWithErrors
                | WorkStatus::Failed
                | WorkStatus::Cancelled
                | WorkStatus::Archived
        )
    }

    /// Returns true while children may still be dispatched or finish.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkStatus::Processing | WorkStatus::Paused)
    }

    /// Returns true if the scheduler may dispatch children right now.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, WorkStatus::Processing)
    }

    /// Stable string form, used for storage and filtering.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Draft => "draft",
            WorkStatus::Pending => "pending",
            WorkStatus::Processing => "processing",
            WorkStatus::Paused => "paused",
            WorkStatus::Completed => "completed",
            WorkStatus::CompletedWithErrors => "completed_with_errors",
            WorkStatus::Failed => "failed",
            WorkStatus::Cancelled => "cancelled",
            WorkStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown work status: {}", s))
    }
}

/// Status of a single submission.
///
/// ```text
/// Queued -> InProgress -> Completed | Failed
/// Queued | InProgress -> Cancelled
/// InProgress -> Queued   (scheduled retry)
/// Failed -> Queued       (manual retry_failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 5] = [
        SubmissionStatus::Queued,
        SubmissionStatus::InProgress,
        SubmissionStatus::Completed,
        SubmissionStatus::Failed,
        SubmissionStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed | SubmissionStatus::Failed | SubmissionStatus::Cancelled
        )
    }

    /// Completed and cancelled submissions can never change again.
    pub fn is_immutable(&self) -> bool {
        matches!(self, SubmissionStatus::Completed | SubmissionStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::InProgress => "in_progress",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubmissionStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown submission status: {}", s))
    }
}
