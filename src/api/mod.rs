//! Control API over the orchestrator.

pub mod auth;
pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{ApiState, api_routes};
