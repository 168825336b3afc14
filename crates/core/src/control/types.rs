//! Control surface types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::{EntityKind, TransitionError};
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerError;
use crate::work::StoreError;

/// Errors returned by control and query operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// The operation needs at least one dispatchable or retryable child.
    #[error("{kind} {id} has no eligible work")]
    NoEligibleWork { kind: EntityKind, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {id} changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => EngineError::NotFound { kind, id },
            StoreError::Conflict {
                kind,
                id,
                expected,
                actual,
            } => EngineError::Conflict {
                kind,
                id,
                expected,
                actual,
            },
            StoreError::InvalidTransition(e) => EngineError::InvalidTransition(e),
            StoreError::Database(msg) => EngineError::Store(msg),
        }
    }
}

impl From<SchedulerError> for EngineError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Store(e) => e.into(),
            other => EngineError::Scheduler(other.to_string()),
        }
    }
}

fn default_priority() -> u8 {
    crate::work::DEFAULT_PRIORITY
}

/// Request to create a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl CreateBatchRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: default_priority(),
            tags: BTreeSet::new(),
            owner: None,
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Request to create a job, standalone or inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub priority: Option<u8>,
    /// Falls back to the engine's configured policy.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Payloads added as queued submissions right away.
    #[serde(default)]
    pub submissions: Vec<serde_json::Value>,
}

impl CreateJobRequest {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            batch_id: None,
            name: name.into(),
            provider: provider.into(),
            priority: None,
            retry_policy: None,
            submissions: Vec::new(),
        }
    }

    pub fn in_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_submissions(mut self, payloads: Vec<serde_json::Value>) -> Self {
        self.submissions = payloads;
        self
    }
}

/// Request to add one submission to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddSubmissionRequest {
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Action, WorkStatus};

    #[test]
    fn test_store_errors_map_to_engine_errors() {
        let err: EngineError = StoreError::NotFound {
            kind: "batch",
            id: "b1".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::NotFound { kind: "batch", .. }));

        let transition = TransitionError::Work {
            kind: EntityKind::Job,
            from: WorkStatus::Completed,
            action: Action::Pause,
        };
        let err: EngineError = StoreError::InvalidTransition(transition.clone()).into();
        assert!(matches!(err, EngineError::InvalidTransition(e) if e == transition));

        let err: EngineError = SchedulerError::Store(StoreError::Database("locked".into())).into();
        assert_eq!(err.to_string(), "store error: locked");
    }

    #[test]
    fn test_create_batch_request_defaults() {
        let req: CreateBatchRequest = serde_json::from_str(r#"{"name": "Midterms"}"#).unwrap();
        assert_eq!(req.priority, 5);
        assert!(req.tags.is_empty());
        assert!(req.owner.is_none());
    }

    #[test]
    fn test_create_job_request_parses_submissions() {
        let req: CreateJobRequest = serde_json::from_str(
            r#"{"name": "Essays", "provider": "openai", "submissions": [{"doc": 1}, {"doc": 2}]}"#,
        )
        .unwrap();
        assert_eq!(req.submissions.len(), 2);
        assert!(req.batch_id.is_none());
        assert!(req.retry_policy.is_none());
    }
}
