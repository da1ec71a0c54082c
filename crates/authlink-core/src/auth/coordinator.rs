//! The session state machine.
//!
//! [`SessionCoordinator`] is the only writer of session state. It is built
//! once at startup, rehydrated from the token store, and shared by `Arc`
//! with the API client and whatever UI drives the login flow.
//!
//! Locking: the session lives behind a `tokio::sync::Mutex`, and every
//! read-modify-write that touches the token store happens while holding it.
//! Network calls never run under that lock.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use super::callback::{CallbackEvent, CallbackReceiver, CallbackResult};
use super::session::{PendingLogin, Session, SessionState, SessionStatus};
use super::token::{AccessToken, RefreshToken, TokenSet};
use crate::api::backend::{BackendClient, RefreshFailure};
use crate::config::Config;
use crate::error::SessionError;
use crate::store::{StoreError, TokenStore};

/// Upper bound for the configurable login timeout (one year).
const MAX_LOGIN_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

type SharedRefresh = Shared<BoxFuture<'static, Result<AccessToken, SessionError>>>;

/// What a callback did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Tokens were persisted and the session is authenticated.
    Authenticated,
    /// No login was pending; the callback was dropped.
    Ignored,
    /// An embedded-browser navigation that isn't a callback. Let it load.
    NotACallback,
}

pub struct SessionCoordinator {
    session: Mutex<Session>,
    in_flight: StdMutex<Option<SharedRefresh>>,
    store: Arc<dyn TokenStore>,
    backend: BackendClient,
    receiver: CallbackReceiver,
    provider: String,
    login_timeout: Duration,
    rotate_refresh_tokens: bool,
}

impl SessionCoordinator {
    pub fn new(config: &Config, store: Arc<dyn TokenStore>) -> Result<Self, SessionError> {
        let backend = BackendClient::new(config)?;
        Ok(Self::with_backend(config, store, backend))
    }

    /// Build with an existing backend client (shared connection pool).
    pub fn with_backend(config: &Config, store: Arc<dyn TokenStore>, backend: BackendClient) -> Self {
        let session = match with_storage_retry(store.as_ref(), "load", |s| s.load()) {
            Ok(stored) => {
                let session = Session::rehydrate(stored);
                info!(
                    store = store.name(),
                    state = session.status().label(),
                    "Session rehydrated"
                );
                session
            }
            Err(err) => {
                let mut session = Session::new();
                session.set(SessionState::Error(err));
                session
            }
        };

        let timeout_secs = config.login_timeout_secs.min(MAX_LOGIN_TIMEOUT_SECS) as i64;

        Self {
            session: Mutex::new(session),
            in_flight: StdMutex::new(None),
            store,
            backend,
            receiver: CallbackReceiver::new(config.allow_list()),
            provider: config.provider.clone(),
            login_timeout: Duration::seconds(timeout_secs),
            rotate_refresh_tokens: config.rotate_refresh_tokens,
        }
    }

    /// Provider the next login goes through.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub async fn status(&self) -> SessionStatus {
        let mut session = self.session.lock().await;
        self.expire_stale_login(&mut session);
        session.status()
    }

    /// Begin a login and return the URL to open in a browser.
    ///
    /// Repeated calls while a login is pending return the pending URL.
    pub async fn start_login(&self) -> Result<Url, SessionError> {
        self.begin_login(None).await
    }

    /// Like [`start_login`](Self::start_login), asking the backend to
    /// redirect to `redirect_uri` (the loopback listener) instead of the
    /// application scheme.
    pub async fn start_login_with_redirect(&self, redirect_uri: &str) -> Result<Url, SessionError> {
        self.begin_login(Some(redirect_uri)).await
    }

    async fn begin_login(&self, redirect_uri: Option<&str>) -> Result<Url, SessionError> {
        let mut session = self.session.lock().await;
        self.expire_stale_login(&mut session);

        match session.state() {
            SessionState::LoginPending(pending) => {
                debug!(provider = %pending.provider, "Login already pending");
                return Ok(pending.login_url.clone());
            }
            SessionState::Authenticated(_) | SessionState::RefreshPending(_) => {
                return Err(SessionError::AlreadyAuthenticated);
            }
            SessionState::Error(err) => {
                debug!(kind = ?err.kind(), "Clearing previous error before login");
            }
            SessionState::Unauthenticated => {}
        }

        let login_url = self.backend.login_url(&self.provider, redirect_uri)?;
        session.set(SessionState::LoginPending(PendingLogin::new(
            self.provider.as_str(),
            login_url.clone(),
        )));
        info!(provider = %self.provider, "Login started");
        Ok(login_url)
    }

    /// Feed a callback from any transport into the state machine.
    ///
    /// `UntrustedOrigin` is returned without touching state, so a spoofed
    /// link can't abort a real pending login.
    pub async fn handle_callback(&self, event: CallbackEvent) -> Result<LoginOutcome, SessionError> {
        let parsed = match self.receiver.receive(&event) {
            Ok(Some(result)) => Ok(result),
            Ok(None) => return Ok(LoginOutcome::NotACallback),
            Err(err @ SessionError::UntrustedOrigin { .. }) => return Err(err),
            Err(err) => Err(err),
        };

        let mut session = self.session.lock().await;
        self.expire_stale_login(&mut session);

        if session.pending_login().is_none() {
            warn!(
                transport = event.transport(),
                state = session.status().label(),
                "Callback received while no login is pending, ignoring"
            );
            return Ok(LoginOutcome::Ignored);
        }

        match parsed {
            Ok(CallbackResult::Token {
                token,
                refresh_token,
            }) => {
                let tokens = TokenSet::new(token, refresh_token);
                if let Err(err) = with_storage_retry(self.store.as_ref(), "save", |s| s.save(&tokens)) {
                    session.set(SessionState::Error(err.clone()));
                    return Err(err);
                }
                info!(
                    transport = event.transport(),
                    can_refresh = tokens.can_refresh(),
                    "Login completed"
                );
                session.set(SessionState::Authenticated(tokens));
                Ok(LoginOutcome::Authenticated)
            }
            Ok(CallbackResult::Error { code, description }) => {
                warn!(code = %code, "Provider reported a login failure");
                let err = SessionError::ProviderError { code, description };
                session.set(SessionState::Error(err.clone()));
                Err(err)
            }
            Err(err) => {
                warn!(transport = event.transport(), "Malformed login callback");
                session.set(SessionState::Error(err.clone()));
                Err(err)
            }
        }
    }

    /// Leave the `Error` state. Other states are left alone.
    pub async fn retry(&self) -> SessionStatus {
        let mut session = self.session.lock().await;
        if let Some(err) = session.last_error() {
            debug!(kind = ?err.kind(), "Clearing session error");
            session.set(SessionState::Unauthenticated);
        }
        session.status()
    }

    /// Clear local credentials, then revoke the old token on a best-effort
    /// basis. Accepted from every state.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let revoke_token = {
            let mut session = self.session.lock().await;
            let token = session.access_token().cloned();
            self.clear_and_set(&mut session, SessionState::Unauthenticated)?;
            info!("Logged out");
            token
        };

        if let Some(token) = revoke_token {
            if let Err(e) = self.backend.revoke(&token).await {
                warn!(error = %e, "Token revocation failed, local logout already complete");
            }
        }
        Ok(())
    }

    /// The token the interceptor should attach, read from the store.
    pub async fn current_access_token(&self) -> Result<Option<AccessToken>, SessionError> {
        let _session = self.session.lock().await;
        let stored = with_storage_retry(self.store.as_ref(), "load", |s| s.load())?;
        Ok(stored.map(|tokens| tokens.access_token))
    }

    /// Local check: does a non-empty token exist in the store.
    pub async fn is_session_valid(&self) -> Result<bool, SessionError> {
        Ok(self.current_access_token().await?.is_some())
    }

    /// Ask the backend whether the stored token is still accepted.
    pub async fn validate_remote(&self) -> Result<bool, SessionError> {
        let Some(token) = self.current_access_token().await? else {
            return Ok(false);
        };
        self.backend
            .validate(&token)
            .await
            .map_err(|e| SessionError::Network(e.to_string()))
    }

    /// Called by the interceptor after a 401 on a request that carried
    /// `stale`. Concurrent callers share one refresh.
    pub async fn refresh_after_unauthorized(
        self: &Arc<Self>,
        stale: &AccessToken,
    ) -> Result<AccessToken, SessionError> {
        let flight = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            // A finished future left behind by cancelled callers is not reused.
            let running = slot.as_ref().filter(|f| f.peek().is_none()).cloned();
            match running {
                Some(flight) => {
                    debug!("Joining in-flight refresh");
                    flight
                }
                None => {
                    let this = Arc::clone(self);
                    let stale = stale.clone();
                    // Spawned so a cancelled caller can't leave the session
                    // stuck in RefreshPending.
                    let handle = tokio::spawn(async move { this.run_refresh(stale).await });
                    let flight = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(SessionError::Network(format!("refresh task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&flight)) {
            *slot = None;
        }
        result
    }

    async fn run_refresh(&self, stale: AccessToken) -> Result<AccessToken, SessionError> {
        let refresh_token = {
            let mut session = self.session.lock().await;
            let tokens = match session.state() {
                SessionState::Authenticated(tokens) => tokens.clone(),
                _ => return Err(SessionError::SessionExpired),
            };

            if tokens.access_token != stale {
                debug!("Access token already replaced, skipping refresh");
                return Ok(tokens.access_token);
            }

            match tokens.refresh_token.clone() {
                Some(refresh_token) => {
                    session.set(SessionState::RefreshPending(tokens));
                    refresh_token
                }
                None => {
                    info!("Unauthorized with no refresh token, ending session");
                    return self.expire(&mut session);
                }
            }
        };

        let outcome = self.backend.refresh(&refresh_token).await;

        let mut session = self.session.lock().await;
        let previous = match session.state() {
            SessionState::RefreshPending(tokens) => tokens.clone(),
            _ => {
                info!("Session changed during refresh, discarding result");
                return Err(SessionError::SessionExpired);
            }
        };

        match outcome {
            Ok(response) => {
                let Some(access_token) = AccessToken::new(response.access_token) else {
                    warn!("Refresh response carried an empty access token");
                    return self.expire(&mut session);
                };
                let refresh_token = match response.refresh_token.and_then(RefreshToken::new) {
                    Some(rotated) => Some(rotated),
                    None if self.rotate_refresh_tokens => None,
                    None => previous.refresh_token,
                };
                let tokens = TokenSet::new(access_token.clone(), refresh_token);
                if let Err(err) = with_storage_retry(self.store.as_ref(), "save", |s| s.save(&tokens)) {
                    session.set(SessionState::Error(err.clone()));
                    return Err(err);
                }
                info!(expires_in = ?response.expires_in, "Session refreshed");
                session.set(SessionState::Authenticated(tokens));
                Ok(access_token)
            }
            Err(RefreshFailure::Rejected(status)) => {
                info!(status, "Refresh token rejected, session expired");
                self.expire(&mut session)
            }
            Err(RefreshFailure::Transient(reason)) if self.rotate_refresh_tokens => {
                warn!(reason = %reason, "Refresh failed, refresh token may be consumed");
                self.expire(&mut session)
            }
            Err(RefreshFailure::Transient(reason)) => {
                warn!(reason = %reason, "Refresh failed, keeping current tokens");
                session.set(SessionState::Authenticated(previous));
                Err(SessionError::Network(reason))
            }
        }
    }

    /// Clear the store and end up `Unauthenticated`, reporting `SessionExpired`.
    fn expire(&self, session: &mut Session) -> Result<AccessToken, SessionError> {
        self.clear_and_set(session, SessionState::Unauthenticated)?;
        Err(SessionError::SessionExpired)
    }

    fn clear_and_set(&self, session: &mut Session, next: SessionState) -> Result<(), SessionError> {
        match with_storage_retry(self.store.as_ref(), "clear", |s| s.clear()) {
            Ok(()) => {
                session.set(next);
                Ok(())
            }
            Err(err) => {
                session.set(SessionState::Error(err.clone()));
                Err(err)
            }
        }
    }

    fn expire_stale_login(&self, session: &mut Session) {
        if session.expire_stale_login(self.login_timeout) {
            info!(
                timeout_secs = self.login_timeout.num_seconds(),
                "Pending login timed out"
            );
        }
    }
}

/// Run a store operation, retrying once before surfacing `StorageFailure`.
fn with_storage_retry<T>(
    store: &dyn TokenStore,
    op: &'static str,
    f: impl Fn(&dyn TokenStore) -> Result<T, StoreError>,
) -> Result<T, SessionError> {
    match f(store) {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(store = store.name(), op, error = %first, "Storage operation failed, retrying once");
            f(store).map_err(|e| {
                error!(store = store.name(), op, error = %e, "Storage operation failed");
                SessionError::from(e)
            })
        }
    }
}
