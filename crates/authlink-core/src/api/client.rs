//! Authorized API client.
//!
//! Every request reads the current token from the session coordinator and
//! attaches it as a bearer credential. A 401 on a request that carried a
//! token triggers one refresh and one retry; anything after that is the
//! caller's problem.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{AccessToken, SessionCoordinator};
use crate::config::Config;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// What to do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptOutcome {
    Success,
    /// Refresh the session and send the request again.
    RetryWithRefresh,
    Fail(StatusCode),
}

/// Decide the fate of a response. Only a 401 on a first attempt that
/// carried a token is worth a refresh.
pub fn classify(status: StatusCode, already_retried: bool, token_attached: bool) -> InterceptOutcome {
    if status.is_success() {
        InterceptOutcome::Success
    } else if status == StatusCode::UNAUTHORIZED && token_attached && !already_retried {
        InterceptOutcome::RetryWithRefresh
    } else {
        InterceptOutcome::Fail(status)
    }
}

/// API client for protected backend endpoints.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Arc<SessionCoordinator>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(config: &Config, session: Arc<SessionCoordinator>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config, session))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, config: &Config, session: Arc<SessionCoordinator>) -> Self {
        Self {
            client,
            base_url: config.api_base_url(),
            session,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the first 429 backoff delay. It doubles on each retry.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn session(&self) -> &Arc<SessionCoordinator> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send a request through the interceptor and return the successful
    /// response.
    pub async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut token = self.session.current_access_token().await?;
        let mut retried = false;

        loop {
            let response = self
                .send_with_backoff(&method, &url, token.as_ref(), body)
                .await?;

            match classify(response.status(), retried, token.is_some()) {
                InterceptOutcome::Success => return Ok(response),
                InterceptOutcome::RetryWithRefresh => {
                    if let Some(stale) = token.clone() {
                        debug!(url = %url, "Unauthorized, refreshing session");
                        let fresh = self.session.refresh_after_unauthorized(&stale).await?;
                        token = Some(fresh);
                    }
                    retried = true;
                }
                InterceptOutcome::Fail(status) => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ApiError::from_status(status, &body));
                }
            }
        }
    }

    async fn send_with_backoff<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        url: &str,
        token: Option<&AccessToken>,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header(header::ACCEPT, "application/json");
            if let Some(token) = token {
                request = request.bearer_auth(token.as_str());
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.execute::<()>(Method::GET, path, None).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", path, e)))
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.execute(Method::POST, path, Some(body)).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", path, e)))
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }
}
