//! Application configuration management.
//!
//! Holds the backend location, the login provider, the callback allow-list
//! and the token storage choice.
//!
//! Configuration is stored at `~/.config/authlink/config.json`. Missing fields
//! take their defaults, so an empty `{}` file is valid.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::auth::AllowedOrigin;

/// Application name used for config/data directory paths
const APP_NAME: &str = "authlink";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Vault file name in the data directory
const VAULT_FILE: &str = "session.vault";

/// Application scheme the backend redirects to. Fixed at build time
/// (`AUTHLINK_APP_SCHEME`); a config file can add origins but cannot change
/// the app's own.
pub const APP_SCHEME: &str = match option_env!("AUTHLINK_APP_SCHEME") {
    Some(scheme) => scheme,
    None => "authlink",
};

/// Host part of the application callback, `{scheme}://auth?token=...`
pub const CALLBACK_HOST: &str = "auth";

/// An abandoned login stops counting as pending after 10 minutes.
const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 600;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Keyring,
    Vault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend root, e.g. `https://api.example.com`
    pub backend_url: String,
    /// Prefix for business API calls made through the authorized client
    pub api_base_path: String,
    /// Identity provider used in `/oauth2/auth/{provider}`
    pub provider: String,
    /// Extra trusted callback origins (e.g. the loopback listener)
    pub allowed_origins: Vec<AllowedOrigin>,
    pub login_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Whether the backend invalidates a refresh token once it is used
    pub rotate_refresh_tokens: bool,
    pub refresh_path: String,
    pub revoke_path: String,
    pub validate_path: String,
    pub storage: StorageBackend,
    pub keyring_account: String,
    pub vault_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8080".to_string(),
            api_base_path: "/api".to_string(),
            provider: "kakao".to_string(),
            allowed_origins: Vec::new(),
            login_timeout_secs: DEFAULT_LOGIN_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            rotate_refresh_tokens: true,
            refresh_path: "/api/auth/refresh".to_string(),
            revoke_path: "/api/auth/logout".to_string(),
            validate_path: "/api/auth/validate-token".to_string(),
            storage: StorageBackend::Keyring,
            keyring_account: "session".to_string(),
            vault_path: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn vault_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.vault_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find local data directory"))?;
        Ok(data_dir.join(APP_NAME).join(VAULT_FILE))
    }

    /// The app's own callback origin followed by any configured extras.
    pub fn allow_list(&self) -> Vec<AllowedOrigin> {
        let mut origins = vec![AllowedOrigin::new(APP_SCHEME, CALLBACK_HOST)];
        for origin in &self.allowed_origins {
            if !origins.contains(origin) {
                origins.push(origin.clone());
            }
        }
        origins
    }

    /// Backend root without a trailing slash.
    pub fn backend_root(&self) -> &str {
        self.backend_url.trim_end_matches('/')
    }

    pub fn api_base_url(&self) -> String {
        format!("{}{}", self.backend_root(), self.api_base_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.provider, "kakao");
        assert_eq!(config.login_timeout_secs, DEFAULT_LOGIN_TIMEOUT_SECS);
        assert!(config.rotate_refresh_tokens);
        assert_eq!(config.storage, StorageBackend::Keyring);
    }

    #[test]
    fn test_allow_list_starts_with_app_origin() {
        let config = Config {
            allowed_origins: vec![
                AllowedOrigin::new("http", "127.0.0.1"),
                AllowedOrigin::new(APP_SCHEME, CALLBACK_HOST),
            ],
            ..Config::default()
        };
        let origins = config.allow_list();
        assert_eq!(origins[0], AllowedOrigin::new(APP_SCHEME, "auth"));
        assert_eq!(origins.len(), 2);
    }

    #[test]
    fn test_config_file_cannot_replace_app_scheme() {
        let config: Config =
            serde_json::from_str(r#"{"app_scheme":"evil","provider":"google"}"#).unwrap();
        assert_eq!(config.provider, "google");
        let origins = config.allow_list();
        assert_eq!(origins, vec![AllowedOrigin::new(APP_SCHEME, CALLBACK_HOST)]);
        assert!(!origins.contains(&AllowedOrigin::new("evil", CALLBACK_HOST)));
    }

    #[test]
    fn test_api_base_url_trims_trailing_slash() {
        let config = Config {
            backend_url: "https://api.example.com/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.api_base_url(), "https://api.example.com/api");
    }

    #[test]
    fn test_storage_backend_parses_snake_case() {
        let config: Config = serde_json::from_str(r#"{"storage":"vault"}"#).unwrap();
        assert_eq!(config.storage, StorageBackend::Vault);
    }
}
