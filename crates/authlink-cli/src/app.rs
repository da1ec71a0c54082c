//! Command implementations.
//!
//! `App` owns the one `SessionCoordinator` for the process and the API
//! client that shares it.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use authlink_core::auth::{AllowedOrigin, LoopbackListener};
use authlink_core::config::{StorageBackend, APP_SCHEME, CALLBACK_HOST};
use authlink_core::{
    open_token_store, ApiClient, CallbackEvent, Config, LoginOutcome, SessionCoordinator,
    SessionError, SessionStatus,
};

// ============================================================================
// Constants
// ============================================================================

const BACKEND_URL_ENV: &str = "AUTHLINK_BACKEND_URL";
const PROVIDER_ENV: &str = "AUTHLINK_PROVIDER";
const VAULT_PASSPHRASE_ENV: &str = "AUTHLINK_VAULT_PASSPHRASE";

/// Maximum length for the pasted redirect URI.
/// Real redirects carry one JWT; 8 KiB leaves plenty of room.
const MAX_REDIRECT_LENGTH: usize = 8192;

pub struct App {
    config: Config,
    api: ApiClient,
}

/// Apply environment overrides on top of the config file.
fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(BACKEND_URL_ENV).filter(|v| !v.trim().is_empty()) {
        config.backend_url = url;
    }
    if let Some(provider) = lookup(PROVIDER_ENV).filter(|v| !v.trim().is_empty()) {
        config.provider = provider;
    }
}

/// The loopback listener's origin has to be trusted for its callback to be
/// accepted.
fn trust_loopback(config: &mut Config) {
    let origin = AllowedOrigin::new("http", "127.0.0.1");
    if !config.allowed_origins.contains(&origin) {
        config.allowed_origins.push(origin);
    }
}

fn vault_passphrase() -> Result<String> {
    if let Ok(passphrase) = std::env::var(VAULT_PASSPHRASE_ENV) {
        if !passphrase.is_empty() {
            return Ok(passphrase);
        }
    }
    let passphrase = rpassword::prompt_password("Vault passphrase: ")?;
    Ok(passphrase)
}

/// Errors that only a fresh login clears get a hint telling the user so.
fn with_login_hint(err: SessionError) -> anyhow::Error {
    if err.requires_login() {
        anyhow::anyhow!("{}. Run `authlink login` to sign in again", err)
    } else {
        err.into()
    }
}

fn describe(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Unauthenticated => "Not logged in".to_string(),
        SessionStatus::LoginPending { provider } => format!("Login with {} in progress", provider),
        SessionStatus::Authenticated { can_refresh: true } => {
            "Logged in (refreshable)".to_string()
        }
        SessionStatus::Authenticated { can_refresh: false } => "Logged in".to_string(),
        SessionStatus::RefreshPending => "Refreshing session".to_string(),
        SessionStatus::Error { error } => match &error.code {
            Some(code) => format!("Error: {:?} ({})", error.kind, code),
            None => format!("Error: {:?}", error.kind),
        },
    }
}

impl App {
    /// Load config, open the token store and rehydrate the session.
    pub fn load(loopback: bool) -> Result<Self> {
        let mut config = Config::load().context("Failed to load config")?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        if loopback {
            trust_loopback(&mut config);
        }

        let passphrase = match config.storage {
            StorageBackend::Vault => Some(vault_passphrase()?),
            StorageBackend::Keyring => None,
        };
        let store = open_token_store(&config, passphrase).context("Failed to open token store")?;
        debug!(store = store.name(), "Token store opened");

        let session = Arc::new(SessionCoordinator::new(&config, store)?);
        let api = ApiClient::new(&config, session)?;

        Ok(Self { config, api })
    }

    /// The coordinator shared with the API client.
    fn session(&self) -> &SessionCoordinator {
        self.api.session()
    }

    pub async fn login(&self, loopback: bool, port: u16) -> Result<()> {
        if loopback {
            self.login_with_loopback(port).await
        } else {
            self.login_with_paste().await
        }
    }

    async fn login_with_paste(&self) -> Result<()> {
        let url = self.session().start_login().await?;
        println!("Logging in with {}", self.session().provider());
        open_browser(url.as_str());

        print!("Paste the redirect URI ({}://{}?...): ", APP_SCHEME, CALLBACK_HOST);
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        let uri = line.trim();
        if uri.len() > MAX_REDIRECT_LENGTH {
            anyhow::bail!("Redirect URI is too long");
        }

        self.finish_login(CallbackEvent::DeepLink(uri.to_string())).await
    }

    async fn login_with_loopback(&self, port: u16) -> Result<()> {
        let listener = LoopbackListener::bind(port).await?;
        let url = self
            .session()
            .start_login_with_redirect(&listener.redirect_uri())
            .await?;
        println!("Logging in with {}", self.session().provider());
        open_browser(url.as_str());

        println!("Waiting for the browser to finish logging in...");
        let timeout = Duration::from_secs(self.config.login_timeout_secs);
        let event = listener
            .wait_for_callback(timeout)
            .await
            .map_err(with_login_hint)?;
        self.finish_login(event).await
    }

    async fn finish_login(&self, event: CallbackEvent) -> Result<()> {
        match self.session().handle_callback(event).await {
            Ok(LoginOutcome::Authenticated) => {
                println!("Login successful!");
                Ok(())
            }
            Ok(LoginOutcome::Ignored) => {
                anyhow::bail!("Login timed out, run `authlink login` again")
            }
            Ok(LoginOutcome::NotACallback) => anyhow::bail!("That is not a login redirect"),
            Err(SessionError::UntrustedOrigin { origin }) => {
                anyhow::bail!("Refusing redirect from untrusted origin {}", origin)
            }
            Err(e) => Err(with_login_hint(e)),
        }
    }

    pub async fn status(&self) -> Result<()> {
        let status = self.session().status().await;
        println!("{}", describe(&status));
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.session().logout().await?;
        println!("Logged out.");
        Ok(())
    }

    pub async fn validate(&self) -> Result<()> {
        if !self.session().is_session_valid().await? {
            println!("No stored session.");
            return Ok(());
        }
        match self.session().validate_remote().await {
            Ok(true) => println!("Session is valid."),
            Ok(false) => println!("The backend no longer accepts this session. Log in again."),
            Err(e) => {
                warn!(error = %e, "Remote validation failed");
                println!("Stored session found, but the backend could not be reached.");
            }
        }
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<()> {
        let value: serde_json::Value = match self.api.get_json(path).await {
            Ok(value) => value,
            Err(e) => {
                let err = match e.session_error() {
                    Some(session_err) => with_login_hint(session_err.clone()),
                    None => e.into(),
                };
                return Err(err.context(format!("GET {} failed", path)));
            }
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }
}

fn open_browser(url: &str) {
    if let Err(e) = open::that(url) {
        warn!(error = %e, "Could not open a browser");
    }
    println!("If the browser did not open, visit:\n  {}", url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use authlink_core::{AuthFailure, ErrorKind};

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            BACKEND_URL_ENV => Some("https://api.example.com".to_string()),
            PROVIDER_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.backend_url, "https://api.example.com");
        assert_eq!(config.provider, "kakao");
    }

    #[test]
    fn test_trust_loopback_once() {
        let mut config = Config::default();
        trust_loopback(&mut config);
        trust_loopback(&mut config);
        assert_eq!(config.allowed_origins.len(), 1);
    }

    #[test]
    fn test_login_hint_only_for_relogin_errors() {
        let expired = with_login_hint(SessionError::SessionExpired).to_string();
        assert!(expired.contains("authlink login"));

        let network = with_login_hint(SessionError::Network("reset".to_string())).to_string();
        assert!(!network.contains("authlink login"));
    }

    #[test]
    fn test_describe_error_with_code() {
        let status = SessionStatus::Error {
            error: AuthFailure {
                kind: ErrorKind::ProviderError,
                code: Some("access_denied".to_string()),
            },
        };
        assert_eq!(describe(&status), "Error: ProviderError (access_denied)");
    }
}
