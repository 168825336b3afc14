pub mod batches;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod routes;
pub mod submissions;

pub use error::{ApiError, ErrorResponse};
pub use routes::create_router;
