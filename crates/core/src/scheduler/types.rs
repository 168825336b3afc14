//! Types for the dispatch scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while dispatching.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The provider lane has no free slot; the entry stays queued.
    #[error("provider {provider} is at capacity ({max_concurrent} in flight)")]
    CapacityExceeded {
        provider: String,
        max_concurrent: usize,
    },

    /// Work store error.
    #[error("work store error: {0}")]
    Store(#[from] crate::work::StoreError),
}

/// Occupancy of one provider lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStatus {
    pub provider: String,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub queued: usize,
}

/// Current status of the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Whether the background loop is running.
    pub running: bool,
    /// Lanes sorted by provider name.
    pub lanes: Vec<LaneStatus>,
}

impl SchedulerStatus {
    pub fn in_flight(&self) -> usize {
        self.lanes.iter().map(|l| l.in_flight).sum()
    }

    pub fn queued(&self) -> usize {
        self.lanes.iter().map(|l| l.queued).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_totals() {
        let status = SchedulerStatus {
            running: true,
            lanes: vec![
                LaneStatus {
                    provider: "anthropic".to_string(),
                    max_concurrent: 3,
                    in_flight: 2,
                    queued: 5,
                },
                LaneStatus {
                    provider: "openai".to_string(),
                    max_concurrent: 3,
                    in_flight: 1,
                    queued: 0,
                },
            ],
        };
        assert_eq!(status.in_flight(), 3);
        assert_eq!(status.queued(), 5);
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::CapacityExceeded {
            provider: "openai".to_string(),
            max_concurrent: 3,
        };
        assert_eq!(err.to_string(), "provider openai is at capacity (3 in flight)");
    }
}
