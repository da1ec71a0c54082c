//! Authentication session management.
//!
//! This module provides:
//! - `SessionCoordinator`: the state machine driving login, refresh and logout
//! - `CallbackReceiver`: allow-listed parsing of login redirects
//! - `LoopbackListener`: localhost transport for the redirect on desktop hosts
//! - Token types whose `Debug` output never shows the secret

pub mod callback;
pub mod coordinator;
pub mod loopback;
pub mod session;
pub mod token;

pub use callback::{AllowedOrigin, CallbackEvent, CallbackReceiver, CallbackResult};
pub use coordinator::{LoginOutcome, SessionCoordinator};
pub use loopback::LoopbackListener;
pub use session::{PendingLogin, Session, SessionState, SessionStatus};
pub use token::{AccessToken, RefreshToken, TokenSet};
