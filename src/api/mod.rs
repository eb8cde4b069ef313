//! HTTP surface — axum routes, auth, and error mapping.

pub mod auth;
pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{AppState, api_routes};
