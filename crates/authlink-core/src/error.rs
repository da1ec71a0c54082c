//! Error taxonomy for the session subsystem.
//!
//! `SessionError` is what the coordinator surfaces. Before it crosses into a
//! UI it is flattened into an [`AuthFailure`] (kind + optional code) so the
//! presentation layer never has to match on strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Callback origin is not on the allow-list: {origin}")]
    UntrustedOrigin { origin: String },

    #[error("Callback carried neither a token nor an error")]
    MalformedCallback,

    #[error("Identity provider reported an error: {code}")]
    ProviderError {
        code: String,
        description: Option<String>,
    },

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Secure storage failure: {0}")]
    StorageFailure(String),

    #[error("Already authenticated - log out first")]
    AlreadyAuthenticated,

    #[error("Login timed out waiting for the provider callback")]
    LoginTimedOut,

    #[error("Network error: {0}")]
    Network(String),
}

/// Discriminant of [`SessionError`] without any payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum ErrorKind {
    UntrustedOrigin,
    MalformedCallback,
    ProviderError,
    SessionExpired,
    StorageFailure,
    AlreadyAuthenticated,
    LoginTimedOut,
    Network,
}

/// Structured error as seen by a UI: kind plus the provider code, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct AuthFailure {
    pub kind: ErrorKind,
    pub code: Option<String>,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::UntrustedOrigin { .. } => ErrorKind::UntrustedOrigin,
            SessionError::MalformedCallback => ErrorKind::MalformedCallback,
            SessionError::ProviderError { .. } => ErrorKind::ProviderError,
            SessionError::SessionExpired => ErrorKind::SessionExpired,
            SessionError::StorageFailure(_) => ErrorKind::StorageFailure,
            SessionError::AlreadyAuthenticated => ErrorKind::AlreadyAuthenticated,
            SessionError::LoginTimedOut => ErrorKind::LoginTimedOut,
            SessionError::Network(_) => ErrorKind::Network,
        }
    }

    /// Provider error code, the only payload a UI is allowed to show verbatim.
    pub fn code(&self) -> Option<&str> {
        match self {
            SessionError::ProviderError { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn to_failure(&self) -> AuthFailure {
        AuthFailure {
            kind: self.kind(),
            code: self.code().map(str::to_string),
        }
    }

    /// Whether the user has to go through the login flow again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::SessionExpired
                | SessionError::MalformedCallback
                | SessionError::ProviderError { .. }
                | SessionError::LoginTimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_keeps_code() {
        let err = SessionError::ProviderError {
            code: "access_denied".to_string(),
            description: Some("user cancelled".to_string()),
        };
        let failure = err.to_failure();
        assert_eq!(failure.kind, ErrorKind::ProviderError);
        assert_eq!(failure.code.as_deref(), Some("access_denied"));
    }

    #[test]
    fn test_storage_failure_has_no_code() {
        let failure = SessionError::StorageFailure("locked".to_string()).to_failure();
        assert_eq!(failure.kind, ErrorKind::StorageFailure);
        assert!(failure.code.is_none());
    }

    #[test]
    fn test_failure_serializes_snake_case_kind() {
        let json = serde_json::to_value(SessionError::SessionExpired.to_failure()).unwrap();
        assert_eq!(json["kind"], "session_expired");
        assert!(json["code"].is_null());
    }

    #[test]
    fn test_requires_login() {
        assert!(SessionError::SessionExpired.requires_login());
        assert!(!SessionError::UntrustedOrigin {
            origin: "evil://x".to_string()
        }
        .requires_login());
        assert!(!SessionError::Network("reset".to_string()).requires_login());
    }
}
