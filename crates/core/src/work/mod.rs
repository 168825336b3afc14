//! Work item store: batches, jobs and submissions.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteWorkStore;
pub use store::{
    BatchFilter, JobFilter, NewBatch, NewJob, NewSubmission, StoreError, SubmissionFilter,
    SubmissionUpdate, WorkStore,
};
pub use types::{
    Batch, Job, Progress, Submission, SubmissionError, DEFAULT_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY,
};
