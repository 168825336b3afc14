//! Pure transition rules.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::status::{EntityKind, SubmissionStatus, WorkStatus};

/// An operation that moves a batch or job between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum Action {
    MarkReady,
    Start,
    Pause,
    Resume,
    Cancel,
    RetryFailed,
    Archive,
    /// Automatic move to a terminal status once every child has settled.
    Settle(WorkStatus),
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::MarkReady => "mark_ready",
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Cancel => "cancel",
            Action::RetryFailed => "retry_failed",
            Action::Archive => "archive",
            Action::Settle(_) => "settle",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Settle(target) => write!(f, "settle as {}", target),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {action} {kind} in status {from}")]
    Work {
        kind: EntityKind,
        from: WorkStatus,
        action: Action,
    },

    #[error("submission cannot move from {from} to {to}")]
    Submission {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
}

impl WorkStatus {
    /// Apply `action` to an entity of `kind` currently in `self`.
    pub fn apply(self, kind: EntityKind, action: Action) -> Result<WorkStatus, TransitionError> {
        use WorkStatus::*;

        let next = match (action, self) {
            (Action::MarkReady, Draft) => Some(Pending),
            (Action::Start, Pending) => Some(Processing),
            (Action::Pause, Processing) => Some(Paused),
            (Action::Resume, Paused) => Some(Processing),
            (Action::Cancel, Draft | Pending | Processing | Paused) => Some(Cancelled),
            (Action::RetryFailed, CompletedWithErrors | Failed) => Some(Processing),
            (Action::RetryFailed, Processing | Paused) => Some(self),
            (Action::Archive, Completed | CompletedWithErrors | Failed | Cancelled)
                if kind == EntityKind::Batch =>
            {
                Some(Archived)
            }
            (
                Action::Settle(target @ (Completed | CompletedWithErrors | Failed | Cancelled)),
                Processing | Paused,
            ) => Some(target),
            _ => None,
        };

        next.ok_or(TransitionError::Work {
            kind,
            from: self,
            action,
        })
    }
}

impl SubmissionStatus {
    /// Validate a move to `to`.
    pub fn transition(self, to: SubmissionStatus) -> Result<SubmissionStatus, TransitionError> {
        use SubmissionStatus::*;

        let allowed = matches!(
            (self, to),
            (Queued, InProgress)
                | (Queued, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, Queued)
                | (Failed, Queued)
        );

        if allowed {
            Ok(to)
        } else {
            Err(TransitionError::Submission { from: self, to })
        }
    }
}

/// Children of one parent, counted by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTally {
    pub total: u32,
    /// Children that have not reached a terminal status.
    pub open: u32,
    pub completed: u32,
    /// Subset of `completed` that finished with errors of their own.
    pub degraded: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl ChildTally {
    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.open == 0
    }
}

/// Terminal status a parent settles into, or `None` while children are open.
///
/// A parent is `Failed` only when none of its children completed. Cancelled
/// children count toward `total` but not toward `completed` or `failed`, so
/// `completed + failed == total` holds for settled parents without cancelled
/// children only.
pub fn settle_outcome(tally: &ChildTally) -> Option<WorkStatus> {
    if !tally.all_terminal() {
        return None;
    }

    let outcome = if tally.completed == tally.total && tally.degraded == 0 {
        WorkStatus::Completed
    } else if tally.completed == 0 && tally.failed > 0 {
        WorkStatus::Failed
    } else if tally.completed == 0 {
        WorkStatus::Cancelled
    } else {
        WorkStatus::CompletedWithErrors
    };

    Some(outcome)
}
