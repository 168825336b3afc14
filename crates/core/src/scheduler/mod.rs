//! Priority dispatch of queued submissions.
//!
//! Each provider gets a lane with its own queue, concurrency cap and stagger
//! interval. The scheduler loop wakes on a timer or when work arrives, walks
//! every lane best-first and claims what it can.

mod config;
mod queue;
mod runner;
mod types;

pub use config::{LaneConfig, LaneSettings, SchedulerConfig};
pub use queue::{DispatchQueue, QueueEntry};
pub use runner::Scheduler;
pub use types::{LaneStatus, SchedulerError, SchedulerStatus};
