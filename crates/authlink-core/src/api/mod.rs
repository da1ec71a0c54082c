//! HTTP side of the session.
//!
//! - `BackendClient`: login entrypoint, refresh, revocation and validation
//! - `ApiClient`: the authorization interceptor for protected endpoints

pub mod backend;
pub mod client;
pub mod error;

pub use backend::{BackendClient, RefreshFailure, RefreshResponse};
pub use client::{classify, ApiClient, InterceptOutcome};
pub use error::ApiError;
