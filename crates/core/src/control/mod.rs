//! Control surface: the operations that create and steer work, and the
//! queries that read it back.

mod controller;
mod query;
mod types;

pub use controller::WorkController;
pub use query::{BatchAnalytics, Page, ProviderBreakdown, WorkQuery};
pub use types::{AddSubmissionRequest, CreateBatchRequest, CreateJobRequest, EngineError};
