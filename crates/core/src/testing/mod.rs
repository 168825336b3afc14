//! Testing utilities and mock implementations.
//!
//! Lets the scheduler and control surface run end to end without a real
//! scoring provider.

mod mock_executor;

pub use mock_executor::MockExecutor;
