//! Turns a provider/backend redirect into a [`CallbackResult`].
//!
//! The same redirect can reach the client three ways: the OS routes the
//! application scheme to us (deep link), an embedded browser reports a
//! navigation, or the loopback listener receives it over HTTP. All of them
//! are wrapped in a [`CallbackEvent`] and parsed by one [`CallbackReceiver`].
//!
//! The allow-list check happens before any parameter is looked at. Anything
//! that can issue a navigation (a compromised page, another app registering
//! our scheme) must not be able to hand us a token.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use super::token::{AccessToken, RefreshToken};
use crate::error::SessionError;

const TOKEN_PARAM: &str = "token";
const REFRESH_TOKEN_PARAM: &str = "refresh_token";
const ERROR_PARAM: &str = "error";
const ERROR_DESCRIPTION_PARAM: &str = "error_description";

/// A trusted `(scheme, host)` pair. Ports and paths are not part of the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedOrigin {
    pub scheme: String,
    pub host: String,
}

impl AllowedOrigin {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        self.scheme.eq_ignore_ascii_case(url.scheme()) && self.host.eq_ignore_ascii_case(host)
    }
}

/// How a redirect reached the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// The OS launched/focused us with a URI on our registered scheme.
    DeepLink(String),
    /// An embedded browser is about to navigate somewhere.
    Navigation(String),
    /// The localhost listener received the redirect.
    Loopback(String),
}

impl CallbackEvent {
    pub fn uri(&self) -> &str {
        match self {
            CallbackEvent::DeepLink(uri)
            | CallbackEvent::Navigation(uri)
            | CallbackEvent::Loopback(uri) => uri,
        }
    }

    pub fn transport(&self) -> &'static str {
        match self {
            CallbackEvent::DeepLink(_) => "deep_link",
            CallbackEvent::Navigation(_) => "navigation",
            CallbackEvent::Loopback(_) => "loopback",
        }
    }
}

/// What the redirect told us. Never both a token and an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    Token {
        token: AccessToken,
        refresh_token: Option<RefreshToken>,
    },
    Error {
        code: String,
        description: Option<String>,
    },
}

#[derive(Debug, Default)]
struct CallbackParams {
    token: Option<String>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    /// Collect recognized parameters. Query values win over fragment values,
    /// empty values count as absent.
    fn collect(url: &Url) -> Self {
        let mut params = Self::default();
        let query = url.query_pairs();
        let fragment = url
            .fragment()
            .map(|f| form_urlencoded::parse(f.as_bytes()))
            .into_iter()
            .flatten();

        for (key, value) in query.chain(fragment) {
            if value.trim().is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                TOKEN_PARAM => &mut params.token,
                REFRESH_TOKEN_PARAM => &mut params.refresh_token,
                ERROR_PARAM => &mut params.error,
                ERROR_DESCRIPTION_PARAM => &mut params.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }

    fn into_result(self) -> Result<CallbackResult, SessionError> {
        // A provider failure is never masked by a token that came along with it.
        if let Some(code) = self.error {
            return Ok(CallbackResult::Error {
                code,
                description: self.error_description,
            });
        }
        match self.token.and_then(AccessToken::new) {
            Some(token) => Ok(CallbackResult::Token {
                token,
                refresh_token: self.refresh_token.and_then(RefreshToken::new),
            }),
            None => Err(SessionError::MalformedCallback),
        }
    }
}

/// Parses redirects against a closed allow-list of origins.
#[derive(Debug, Clone)]
pub struct CallbackReceiver {
    allow_list: Vec<AllowedOrigin>,
}

impl CallbackReceiver {
    pub fn new(allow_list: Vec<AllowedOrigin>) -> Self {
        Self { allow_list }
    }

    pub fn allow_list(&self) -> &[AllowedOrigin] {
        &self.allow_list
    }

    pub fn is_trusted(&self, url: &Url) -> bool {
        self.allow_list.iter().any(|origin| origin.matches(url))
    }

    /// Parse a raw redirect URI regardless of transport.
    pub fn parse(&self, raw_uri: &str) -> Result<CallbackResult, SessionError> {
        let url = Url::parse(raw_uri.trim()).map_err(|e| {
            debug!(error = %e, "Callback URI did not parse");
            SessionError::MalformedCallback
        })?;

        if !self.is_trusted(&url) {
            let origin = describe_origin(&url);
            warn!(origin = %origin, "Rejected callback from untrusted origin");
            return Err(SessionError::UntrustedOrigin { origin });
        }

        CallbackParams::collect(&url).into_result()
    }

    /// Handle a callback event.
    ///
    /// Returns `Ok(None)` for embedded-browser navigations to ordinary web
    /// pages (the provider's login form, the backend), which are not callbacks
    /// and should be allowed to load. A navigation to any non-web scheme is
    /// treated as a callback attempt and goes through the allow-list.
    pub fn receive(&self, event: &CallbackEvent) -> Result<Option<CallbackResult>, SessionError> {
        if let CallbackEvent::Navigation(uri) = event {
            match Url::parse(uri.trim()) {
                Ok(url) if is_web_scheme(url.scheme()) && !self.is_trusted(&url) => {
                    return Ok(None);
                }
                _ => {}
            }
        }

        debug!(transport = event.transport(), "Parsing callback");
        self.parse(event.uri()).map(Some)
    }
}

fn is_web_scheme(scheme: &str) -> bool {
    scheme == "http" || scheme == "https"
}

/// `scheme://host` only. Never includes the query, which may carry a token.
fn describe_origin(url: &Url) -> String {
    format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> CallbackReceiver {
        CallbackReceiver::new(vec![
            AllowedOrigin::new("authlink", "auth"),
            AllowedOrigin::new("http", "127.0.0.1"),
        ])
    }

    fn token_of(result: CallbackResult) -> String {
        match result {
            CallbackResult::Token { token, .. } => token.as_str().to_string(),
            other => panic!("expected token, got {:?}", other),
        }
    }

    #[test]
    fn test_token_in_query() {
        let result = receiver().parse("authlink://auth?token=abc.def.ghi").unwrap();
        assert_eq!(token_of(result), "abc.def.ghi");
    }

    #[test]
    fn test_token_in_fragment() {
        let result = receiver()
            .parse("authlink://auth#token=abc.def.ghi&refresh_token=r1")
            .unwrap();
        match result {
            CallbackResult::Token {
                token,
                refresh_token,
            } => {
                assert_eq!(token.as_str(), "abc.def.ghi");
                assert_eq!(refresh_token.unwrap().as_str(), "r1");
            }
            other => panic!("expected token, got {:?}", other),
        }
    }

    #[test]
    fn test_percent_encoded_token_is_decoded() {
        let result = receiver().parse("authlink://auth?token=a%2Bb%3D").unwrap();
        assert_eq!(token_of(result), "a+b=");
    }

    #[test]
    fn test_error_parameter() {
        let result = receiver()
            .parse("authlink://auth?error=access_denied&error_description=User%20cancelled")
            .unwrap();
        assert_eq!(
            result,
            CallbackResult::Error {
                code: "access_denied".to_string(),
                description: Some("User cancelled".to_string()),
            }
        );
    }

    #[test]
    fn test_error_wins_over_token() {
        let result = receiver()
            .parse("authlink://auth?token=abc&error=server_error")
            .unwrap();
        assert!(matches!(result, CallbackResult::Error { ref code, .. } if code == "server_error"));
    }

    #[test]
    fn test_missing_parameters_is_malformed() {
        assert_eq!(
            receiver().parse("authlink://auth?state=xyz"),
            Err(SessionError::MalformedCallback)
        );
        assert_eq!(
            receiver().parse("authlink://auth?token="),
            Err(SessionError::MalformedCallback)
        );
    }

    #[test]
    fn test_unparseable_uri_is_malformed() {
        assert_eq!(
            receiver().parse("not a uri"),
            Err(SessionError::MalformedCallback)
        );
    }

    #[test]
    fn test_untrusted_origin_regardless_of_params() {
        let cases = [
            "evil://auth?token=abc.def.ghi",
            "authlink://evil?token=abc.def.ghi",
            "authlink://auth@evil.example?token=abc",
            "https://auth?token=abc",
            "authlink://evil?error=access_denied",
            "authlink://evil",
        ];
        for uri in cases {
            match receiver().parse(uri) {
                Err(SessionError::UntrustedOrigin { origin }) => {
                    assert!(!origin.contains("abc"), "origin leaked query: {}", origin)
                }
                other => panic!("{} should be untrusted, got {:?}", uri, other),
            }
        }
    }

    #[test]
    fn test_origin_match_is_case_insensitive() {
        let result = receiver().parse("AUTHLINK://Auth?token=abc").unwrap();
        assert_eq!(token_of(result), "abc");
    }

    #[test]
    fn test_loopback_origin_ignores_port() {
        let event = CallbackEvent::Loopback("http://127.0.0.1:53682/callback?token=abc".to_string());
        let result = receiver().receive(&event).unwrap().unwrap();
        assert_eq!(token_of(result), "abc");
    }

    #[test]
    fn test_navigation_to_web_page_is_not_a_callback() {
        let event = CallbackEvent::Navigation(
            "https://kauth.kakao.com/oauth/authorize?client_id=x".to_string(),
        );
        assert_eq!(receiver().receive(&event), Ok(None));
    }

    #[test]
    fn test_navigation_to_foreign_scheme_is_rejected() {
        let event = CallbackEvent::Navigation("other-app://auth?token=abc".to_string());
        assert!(matches!(
            receiver().receive(&event),
            Err(SessionError::UntrustedOrigin { .. })
        ));
    }

    #[test]
    fn test_deep_link_and_navigation_parse_identically() {
        let uri = "authlink://auth?token=abc.def.ghi";
        let from_link = receiver()
            .receive(&CallbackEvent::DeepLink(uri.to_string()))
            .unwrap();
        let from_nav = receiver()
            .receive(&CallbackEvent::Navigation(uri.to_string()))
            .unwrap();
        assert_eq!(from_link, from_nav);
    }
}
