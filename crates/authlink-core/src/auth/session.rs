use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::token::{AccessToken, TokenSet};
use crate::error::{AuthFailure, SessionError};

/// A login that was started and is waiting for the provider callback.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLogin {
    pub provider: String,
    pub login_url: Url,
    pub started_at: DateTime<Utc>,
}

impl PendingLogin {
    pub fn new(provider: impl Into<String>, login_url: Url) -> Self {
        Self {
            provider: provider.into(),
            login_url,
            started_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        Utc::now() - self.started_at > timeout
    }
}

/// Authentication state. Tokens only exist inside the variants that are
/// allowed to hold them, so an authenticated session can't lack a token.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    LoginPending(PendingLogin),
    Authenticated(TokenSet),
    RefreshPending(TokenSet),
    Error(SessionError),
}

/// Token-free view of the session for UIs and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum SessionStatus {
    Unauthenticated,
    LoginPending { provider: String },
    Authenticated { can_refresh: bool },
    RefreshPending,
    Error { error: AuthFailure },
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Unauthenticated => "Unauthenticated",
            SessionStatus::LoginPending { .. } => "LoginPending",
            SessionStatus::Authenticated { .. } => "Authenticated",
            SessionStatus::RefreshPending => "RefreshPending",
            SessionStatus::Error { .. } => "Error",
        }
    }
}

/// The process-wide session. Only the coordinator holds one.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unauthenticated,
        }
    }

    /// Build the startup session from whatever the token store held.
    pub fn rehydrate(stored: Option<TokenSet>) -> Self {
        let state = match stored {
            Some(tokens) => SessionState::Authenticated(tokens),
            None => SessionState::Unauthenticated,
        };
        Self { state }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn set(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Tokens held in memory, if the state carries any.
    pub fn tokens(&self) -> Option<&TokenSet> {
        match &self.state {
            SessionState::Authenticated(tokens) | SessionState::RefreshPending(tokens) => {
                Some(tokens)
            }
            _ => None,
        }
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.tokens().map(|t| &t.access_token)
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        match &self.state {
            SessionState::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn pending_login(&self) -> Option<&PendingLogin> {
        match &self.state {
            SessionState::LoginPending(pending) => Some(pending),
            _ => None,
        }
    }

    /// Drop back to `Unauthenticated` if a pending login has outlived
    /// `timeout`. Returns whether it did.
    pub fn expire_stale_login(&mut self, timeout: Duration) -> bool {
        let expired = self
            .pending_login()
            .map(|p| p.is_expired(timeout))
            .unwrap_or(false);
        if expired {
            self.state = SessionState::Unauthenticated;
        }
        expired
    }

    pub fn status(&self) -> SessionStatus {
        match &self.state {
            SessionState::Unauthenticated => SessionStatus::Unauthenticated,
            SessionState::LoginPending(pending) => SessionStatus::LoginPending {
                provider: pending.provider.clone(),
            },
            SessionState::Authenticated(tokens) => SessionStatus::Authenticated {
                can_refresh: tokens.can_refresh(),
            },
            SessionState::RefreshPending(_) => SessionStatus::RefreshPending,
            SessionState::Error(err) => SessionStatus::Error {
                error: err.to_failure(),
            },
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
