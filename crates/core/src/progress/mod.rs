//! Progress rollup from submissions to jobs to batches.

mod aggregator;
mod locks;

pub use aggregator::ProgressAggregator;
pub use locks::EntityLocks;
