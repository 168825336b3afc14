//! Trait definitions for the execution layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ExecutionError;

/// Everything an executor needs to score one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub submission_id: String,
    pub job_id: String,
    /// Provider the owning job targets.
    pub provider: String,
    /// Retries consumed before this call.
    pub attempt: u32,
    /// Opaque document reference.
    pub payload: serde_json::Value,
}

/// Successful result of one scoring call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Result reference recorded on the submission.
    pub output: String,
}

impl ExecutionOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// An external scoring call.
///
/// Timeouts are the implementation's responsibility and must surface as
/// [`ExecutionError::Transient`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Returns the name of this executor implementation.
    fn name(&self) -> &str;

    /// Perform the call for one submission.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError>;
}
