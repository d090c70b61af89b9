//! Credential exchange for the token-appended connection variant.
//!
//! The session layer only consumes [`AuthSession::login`]; [`HttpAuthSession`]
//! is the implementation talking to the cloud login endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::Credentials;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production login endpoint.
pub const LOGIN_URL: &str = "https://l4hfront-prod.chacon.cloud/api/session/login";

/// Exchanges credentials for a session token.
#[async_trait]
pub trait AuthSession: Send + Sync {
    /// Returns a session token, or [`AuthError::InvalidCredentials`] on rejection.
    async fn login(&self, credentials: &Credentials) -> Result<SecretString, AuthError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthDefaults;

impl AuthDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct HttpAuthOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for HttpAuthOptions {
    fn default() -> Self {
        Self {
            connect_timeout: AuthDefaults::CONNECT_TIMEOUT,
            attempt_timeout: AuthDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::login(),
        }
    }
}

/// [`AuthSession`] backed by the cloud HTTP login endpoint.
#[derive(Clone, Debug)]
pub struct HttpAuthSession {
    http: Client,
    login_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl HttpAuthSession {
    pub fn new() -> Result<Self, AuthError> {
        Self::with_options(HttpAuthOptions::default())
    }

    pub fn with_options(options: HttpAuthOptions) -> Result<Self, AuthError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(AuthError::Transport)?;

        Ok(Self {
            http,
            login_url: LOGIN_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Overrides the login endpoint, mostly useful against a local server.
    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into().trim_end().to_string();
        self
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    async fn login_attempt(&self, body: &LoginRequest<'_>) -> Result<SecretString, AuthError> {
        let response = self
            .http
            .post(&self.login_url)
            .timeout(self.attempt_timeout)
            .header("Cache-Control", "no-cache")
            .json(body)
            .send()
            .await
            .map_err(AuthError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(AuthError::Transport)?;

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        parse_login_response(&text)
    }
}

#[async_trait]
impl AuthSession for HttpAuthSession {
    async fn login(&self, credentials: &Credentials) -> Result<SecretString, AuthError> {
        let body = LoginRequest {
            email: &credentials.email,
            password: credentials.password.expose_secret(),
            installation_id: &credentials.service_name,
        };
        debug!(event = "login_request", email = %credentials.email);

        retry_async(
            &self.retry_policy,
            |_| self.login_attempt(&body),
            AuthError::is_retryable,
        )
        .await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    installation_id: &'a str,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse login response: {0}")]
    Parse(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::InvalidCredentials(_) | Self::Parse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    status: i64,
    #[serde(default)]
    data: Value,
}

fn parse_login_response(body: &str) -> Result<SecretString, AuthError> {
    let envelope: LoginEnvelope = serde_json::from_str(body)
        .map_err(|_| AuthError::Parse(summarize_error_body(body)))?;

    match envelope.status {
        200 => envelope
            .data
            .get("sessionToken")
            .and_then(token_as_string)
            .map(SecretString::new)
            .ok_or_else(|| AuthError::Parse("status=200 payload missing sessionToken".to_string())),
        400 | 401 | 403 => {
            let detail = match envelope.data {
                Value::String(message) => message,
                Value::Null => "login rejected".to_string(),
                other => other.to_string(),
            };
            Err(AuthError::InvalidCredentials(detail))
        }
        other => Err(AuthError::Parse(format!(
            "unexpected login status {other}: {}",
            summarize_error_body(body)
        ))),
    }
}

fn token_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(token) if !token.is_empty() => Some(token.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn summarize_error_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::{parse_login_response, AuthError, HttpAuthSession, LoginRequest, LOGIN_URL};

    #[test]
    fn parse_successful_login_envelope() {
        let payload = r#"{"status":200,"data":{"sessionToken":"r:myfakesessionToken"}}"#;
        let token = parse_login_response(payload).expect("token");
        assert_eq!(token.expose_secret(), "r:myfakesessionToken");
    }

    #[test]
    fn parse_rejected_login_as_invalid_credentials() {
        let payload = r#"{"status":400,"data":"Invalid username/password."}"#;
        match parse_login_response(payload).expect_err("rejected") {
            AuthError::InvalidCredentials(detail) => {
                assert_eq!(detail, "Invalid username/password.")
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn parse_missing_token_is_parse_error() {
        let payload = r#"{"status":200,"data":{}}"#;
        assert!(matches!(
            parse_login_response(payload),
            Err(AuthError::Parse(_))
        ));
    }

    #[test]
    fn parse_garbage_is_not_retryable() {
        let err = parse_login_response("<html>").expect_err("garbage");
        assert!(!err.is_retryable());
    }

    #[test]
    fn login_body_uses_camel_case_installation_id() {
        let body = LoginRequest {
            email: "toto@toto.com",
            password: "DUMMY_PASS",
            installation_id: "NOID",
        };
        let encoded = serde_json::to_string(&body).expect("encode");
        assert_eq!(
            encoded,
            r#"{"email":"toto@toto.com","password":"DUMMY_PASS","installationId":"NOID"}"#
        );
    }

    #[test]
    fn login_url_override_is_trimmed() {
        let session = HttpAuthSession::new()
            .expect("client")
            .with_login_url("http://localhost:38080/api/session/login \n");
        assert_eq!(session.login_url(), "http://localhost:38080/api/session/login");
        assert_ne!(session.login_url(), LOGIN_URL);
    }
}
