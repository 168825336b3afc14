//! Execution layer boundary.
//!
//! The engine hands each claimed submission to an [`Executor`] and treats the
//! call as opaque: any implementation (LLM API, local model, mock) works as
//! long as it reports success or a classified failure.

mod config;
mod error;
mod http;
mod traits;

pub use config::{ExecutorBackend, ExecutorConfig, HttpExecutorConfig};
pub use error::{ErrorKind, ExecutionError};
pub use http::HttpExecutor;
pub use traits::{ExecutionOutput, ExecutionRequest, Executor};
