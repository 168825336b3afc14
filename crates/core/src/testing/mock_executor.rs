//! Mock executor for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::executor::{ExecutionError, ExecutionOutput, ExecutionRequest, Executor};

type Outcome = Result<ExecutionOutput, ExecutionError>;

/// Mock implementation of the Executor trait.
///
/// Provides controllable behavior for testing:
/// - Script per-submission outcomes (success, transient, permanent)
/// - Hold every call on a gate until released
/// - Record call order and peak concurrency
///
/// # Example
///
/// ```rust,ignore
/// use gradeflow_core::testing::MockExecutor;
///
/// let executor = MockExecutor::new();
///
/// // First call fails transiently, the retry succeeds
/// executor.script(&submission_id, vec![
///     Err(ExecutionError::transient("HTTP 503")),
///     Ok(ExecutionOutput::new("grade:B")),
/// ]).await;
///
/// // Freeze calls in flight
/// executor.hold();
/// // ...
/// executor.release();
/// ```
#[derive(Debug)]
pub struct MockExecutor {
    /// Scripted outcomes by submission id, consumed front to back.
    scripts: Arc<RwLock<HashMap<String, VecDeque<Outcome>>>>,
    /// Every request seen, in call order.
    calls: Arc<RwLock<Vec<ExecutionRequest>>>,
    /// Simulated call duration.
    latency: Arc<RwLock<Duration>>,
    /// Calls proceed only while the gate is open.
    gate: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// Create a new mock executor. Unscripted calls succeed immediately.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            scripts: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            latency: Arc::new(RwLock::new(Duration::ZERO)),
            gate,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue outcomes for a submission. Once exhausted, calls succeed.
    pub async fn script(&self, submission_id: &str, outcomes: Vec<Outcome>) {
        self.scripts
            .write()
            .await
            .entry(submission_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Set the simulated call duration.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    /// Close the gate: new and pending calls wait until `release`.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Open the gate.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Get all recorded requests in call order.
    pub async fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.read().await.clone()
    }

    /// Submission ids in call order.
    pub async fn call_order(&self) -> Vec<String> {
        self.calls
            .read()
            .await
            .iter()
            .map(|r| r.submission_id.clone())
            .collect()
    }

    /// Number of calls started.
    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Calls currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Number of calls that returned.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        self.calls.write().await.push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        // The sender lives as long as self, so this only fails on teardown.
        let _ = gate.wait_for(|open| *open).await;

        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let outcome = self
            .scripts
            .write()
            .await
            .get_mut(&request.submission_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(ExecutionOutput::new(format!("graded:{}", request.submission_id))));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> ExecutionRequest {
        ExecutionRequest {
            submission_id: id.to_string(),
            job_id: "job-1".to_string(),
            provider: "mock".to_string(),
            attempt: 0,
            payload: serde_json::json!({"doc": id}),
        }
    }

    #[tokio::test]
    async fn test_scripted_outcomes_then_default() {
        let executor = MockExecutor::new();
        executor
            .script("s1", vec![Err(ExecutionError::transient("HTTP 503"))])
            .await;

        let first = executor.execute(&request("s1")).await;
        assert_eq!(first, Err(ExecutionError::transient("HTTP 503")));

        let second = executor.execute(&request("s1")).await.unwrap();
        assert_eq!(second.output, "graded:s1");
        assert_eq!(executor.call_order().await, vec!["s1", "s1"]);
    }

    #[tokio::test]
    async fn test_gate_holds_calls() {
        let executor = Arc::new(MockExecutor::new());
        executor.hold();

        let task = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.execute(&request("s1")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executor.in_flight(), 1);
        assert_eq!(executor.completed(), 0);

        executor.release();
        let result = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(executor.in_flight(), 0);
        assert_eq!(executor.peak_in_flight(), 1);
    }
}
