//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Scheduler (dispatches, lane occupancy, execution results)
//! - Retry controller (scheduled retries, give-ups)
//! - Progress aggregation and control operations
//! - Event log persistence

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

// =============================================================================
// Scheduler
// =============================================================================

/// Submissions handed to an executor, by provider.
pub static SUBMISSIONS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gradeflow_submissions_dispatched_total",
            "Total submissions dispatched to an executor",
        ),
        &["provider"],
    )
    .unwrap()
});

/// Execution results by provider and outcome.
pub static SUBMISSION_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gradeflow_submission_results_total",
            "Execution results by outcome",
        ),
        &["provider", "outcome"], // "completed", "retry", "failed", "discarded"
    )
    .unwrap()
});

/// Execution call duration in seconds.
pub static EXECUTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "gradeflow_execution_duration_seconds",
            "Duration of executor calls",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["provider"],
    )
    .unwrap()
});

/// Executions currently in flight per provider lane.
pub static LANE_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "gradeflow_lane_in_flight",
            "Executor calls currently in flight",
        ),
        &["provider"],
    )
    .unwrap()
});

/// Entries waiting in each provider lane.
pub static LANE_QUEUED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("gradeflow_lane_queued", "Queue entries waiting per lane"),
        &["provider"],
    )
    .unwrap()
});

/// Dispatch attempts deferred because a lane was full.
pub static CAPACITY_DEFERRALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gradeflow_capacity_deferrals_total",
            "Dispatches deferred for lack of lane capacity",
        ),
        &["provider"],
    )
    .unwrap()
});

// =============================================================================
// Lifecycle
// =============================================================================

/// Batches and jobs reaching a terminal status through aggregation.
pub static ENTITIES_SETTLED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gradeflow_entities_settled_total",
            "Batches and jobs settled by the progress aggregator",
        ),
        &["entity", "status"],
    )
    .unwrap()
});

/// Control surface operations by entity and action.
pub static CONTROL_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gradeflow_control_operations_total",
            "Control operations applied",
        ),
        &["entity", "action"],
    )
    .unwrap()
});

// =============================================================================
// Event log
// =============================================================================

/// Engine events handed to the event store, by outcome.
pub static EVENT_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gradeflow_event_writes_total", "Engine events persisted or dropped"),
        &["outcome"], // "stored", "dropped"
    )
    .unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Scheduler
        Box::new(SUBMISSIONS_DISPATCHED.clone()),
        Box::new(SUBMISSION_RESULTS.clone()),
        Box::new(EXECUTION_DURATION.clone()),
        Box::new(LANE_IN_FLIGHT.clone()),
        Box::new(LANE_QUEUED.clone()),
        Box::new(CAPACITY_DEFERRALS.clone()),
        // Lifecycle
        Box::new(ENTITIES_SETTLED.clone()),
        Box::new(CONTROL_OPERATIONS.clone()),
        // Event log
        Box::new(EVENT_WRITES.clone()),
    ]
}
