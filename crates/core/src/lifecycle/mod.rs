//! Status state machines for batches, jobs and submissions.
//!
//! Everything here is pure: no I/O, no clocks. The store, the progress
//! aggregator and the control surface all validate through these functions
//! before writing anything.

mod status;
mod transition;

pub use status::{EntityKind, SubmissionStatus, WorkStatus};
pub use transition::{settle_outcome, Action, ChildTally, TransitionError};
