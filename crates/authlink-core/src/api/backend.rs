//! Calls to the backend's token endpoints: login entrypoint URL, refresh,
//! revocation and remote validation.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::ApiError;
use crate::auth::{AccessToken, RefreshToken};
use crate::config::Config;
use crate::error::SessionError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Body of a successful refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Why a refresh did not produce a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The backend refused the refresh token (any 4xx).
    Rejected(u16),
    /// The request did not get a usable answer (transport error, 5xx,
    /// unparseable body).
    Transient(String),
}

/// Client for the backend's token-issuing endpoints.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    backend_root: String,
    refresh_path: String,
    revoke_path: String,
    validate_path: String,
}

impl BackendClient {
    pub fn new(config: &Config) -> Result<Self, SessionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SessionError::Network(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            backend_root: config.backend_root().to_string(),
            refresh_path: config.refresh_path.clone(),
            revoke_path: config.revoke_path.clone(),
            validate_path: config.validate_path.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.backend_root, path)
    }

    /// `GET {backend}/oauth2/auth/{provider}`, optionally telling the backend
    /// where to send the browser afterwards.
    pub fn login_url(&self, provider: &str, redirect_uri: Option<&str>) -> Result<Url, SessionError> {
        let mut url = Url::parse(&self.url(&format!("/oauth2/auth/{}", provider)))
            .map_err(|e| SessionError::Network(format!("Invalid backend URL: {}", e)))?;
        if let Some(redirect) = redirect_uri {
            url.query_pairs_mut().append_pair("redirect_uri", redirect);
        }
        Ok(url)
    }

    pub async fn refresh(&self, refresh_token: &RefreshToken) -> Result<RefreshResponse, RefreshFailure> {
        let url = self.url(&self.refresh_path);
        debug!(url = %url, "Requesting token refresh");

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: refresh_token.as_str(),
            })
            .send()
            .await
            .map_err(|e| RefreshFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            warn!(status = status.as_u16(), "Refresh token rejected");
            return Err(RefreshFailure::Rejected(status.as_u16()));
        }
        if !status.is_success() {
            return Err(RefreshFailure::Transient(format!("refresh returned {}", status)));
        }

        response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| RefreshFailure::Transient(format!("invalid refresh response: {}", e)))
    }

    /// Best-effort server-side revocation of `token`.
    pub async fn revoke(&self, token: &AccessToken) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&self.revoke_path))
            .bearer_auth(token.as_str())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Ask the backend whether `token` is still accepted.
    pub async fn validate(&self, token: &AccessToken) -> Result<bool, ApiError> {
        let response = self
            .client
            .post(self.url(&self.validate_path))
            .bearer_auth(token.as_str())
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::from_status(s, &body))
            }
        }
    }
}
