//! Error taxonomy shared by the session layer and the client facade.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthError;
use crate::session::proto::RequestId;

/// Errors surfaced by connection, correlation and API calls.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server (or the login endpoint) rejected the credentials. Never retried.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// No connection acknowledgement arrived within the handshake timeout.
    #[error("no connection acknowledgement received within {0:?}")]
    ConnectionTimeout(Duration),

    /// Transport failure while the reconnect loop still had retries left.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// No response frame was received for the request id.
    #[error("no response received for request id {0}")]
    ResponseTimeout(RequestId),

    /// A frame or a connection exchange did not follow the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with a non-success status. Carries the full raw payload.
    #[error("api error (status {status}): {payload}")]
    Api { status: i64, payload: Value },

    /// A caller-supplied argument is out of range; nothing was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session is not connected; a new `connect()` is required.
    #[error("not connected")]
    NotConnected,

    /// Credential exchange failed for a reason other than rejected credentials.
    #[error("authentication request failed: {0}")]
    Auth(#[source] AuthError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection URL could not be parsed.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials(message) => Self::InvalidCredentials(message),
            other => Self::Auth(other),
        }
    }
}
