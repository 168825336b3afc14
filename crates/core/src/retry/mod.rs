//! Retry and backoff decisions for failed submissions.
//!
//! Transient failures are retried with exponential backoff until the job's
//! retry budget runs out; permanent failures are never retried.

mod policy;

pub use policy::{GiveUpReason, RetryDecision, RetryPolicy};
