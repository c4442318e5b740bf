//! HTTP API — client submission endpoints and the worker task protocol.

pub mod routes;
pub mod types;

pub use routes::{AppState, OWNER_HEADER, OwnerId, api_routes};
pub use types::ApiError;
