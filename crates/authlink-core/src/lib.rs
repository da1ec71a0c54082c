//! authlink-core: OAuth2 redirect login for native clients.
//!
//! Login goes through the backend's `/oauth2/auth/{provider}` entrypoint and
//! comes back as an allow-listed redirect carrying a bearer token. The token
//! is kept in secure storage and attached to every API call, with a single
//! shared refresh when the backend answers 401.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod store;

pub use api::{ApiClient, ApiError};
pub use auth::{CallbackEvent, LoginOutcome, SessionCoordinator, SessionStatus};
pub use config::Config;
pub use error::{AuthFailure, ErrorKind, SessionError};
pub use store::{open_token_store, TokenStore};
