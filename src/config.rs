//! Client configuration and connection-URL construction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::auth::AuthSession;
use crate::retry::ReconnectPolicy;

/// Production websocket endpoint.
pub const WS_URL: &str = "wss://l4hfront-prod.chacon.cloud/ws";
/// Service name sent when the caller does not pick one.
pub const DEFAULT_SERVICE_NAME: &str = "rust_generic";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RESPONSE_GRACE: Duration = Duration::from_millis(500);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
}

/// Account credentials.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
    /// Arbitrary string identifying this installation to the server.
    pub service_name: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: SecretString) -> Self {
        Self {
            email: email.into(),
            password,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }
}

/// How credentials reach the websocket server.
#[derive(Clone)]
pub enum ConnectMode {
    /// Exchange credentials for a token first, then append `sessionToken=<token>`.
    SessionToken(Arc<dyn AuthSession>),
    /// Embed the credentials directly in the connection URL's query string.
    InlineCredentials,
}

impl fmt::Debug for ConnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionToken(_) => f.write_str("SessionToken"),
            Self::InlineCredentials => f.write_str("InlineCredentials"),
        }
    }
}

/// Everything the session layer needs to open and keep a connection.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ws_url: String,
    pub credentials: Credentials,
    pub connect_mode: ConnectMode,
    /// Bound on waiting for the connection acknowledgement after opening the socket.
    pub handshake_timeout: Duration,
    /// Second-phase wait applied once when a response is not yet buffered.
    pub response_grace: Duration,
    /// Ping period on a connected socket; a ping left unanswered for one period drops the link.
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Production configuration using the given connection variant.
    pub fn new(credentials: Credentials, connect_mode: ConnectMode) -> Self {
        Self {
            ws_url: WS_URL.to_string(),
            credentials,
            connect_mode,
            handshake_timeout: SessionDefaults::HANDSHAKE_TIMEOUT,
            response_grace: SessionDefaults::RESPONSE_GRACE,
            heartbeat_interval: SessionDefaults::HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Sets an explicit websocket endpoint.
    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into().trim_end().to_string();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_response_grace(mut self, grace: Duration) -> Self {
        self.response_grace = grace;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Appends the session token to the websocket endpoint.
pub fn token_url(ws_url: &str, token: &SecretString) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(ws_url)?;
    url.query_pairs_mut()
        .append_pair("sessionToken", token.expose_secret());
    Ok(url)
}

/// Embeds the credentials in the websocket endpoint's query string.
pub fn inline_credentials_url(
    ws_url: &str,
    credentials: &Credentials,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(ws_url)?;
    url.query_pairs_mut()
        .append_pair("email", &credentials.email)
        .append_pair("password", credentials.password.expose_secret())
        .append_pair("serviceName", &credentials.service_name);
    Ok(url)
}

/// URL without query string or credentials, safe to log.
pub(crate) fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    let _ = shown.set_password(None);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{
        inline_credentials_url, redacted, token_url, ClientConfig, ConnectMode, Credentials,
        SessionDefaults, DEFAULT_SERVICE_NAME, WS_URL,
    };

    fn credentials() -> Credentials {
        Credentials::new("toto@toto.com", SecretString::new("p&ss word".to_string()))
    }

    #[test]
    fn config_uses_production_endpoint_and_defaults() {
        let config = ClientConfig::new(credentials(), ConnectMode::InlineCredentials);
        assert_eq!(config.ws_url, WS_URL);
        assert_eq!(config.handshake_timeout, SessionDefaults::HANDSHAKE_TIMEOUT);
        assert_eq!(config.response_grace, SessionDefaults::RESPONSE_GRACE);
        assert_eq!(config.heartbeat_interval, SessionDefaults::HEARTBEAT_INTERVAL);
        assert_eq!(config.credentials.service_name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn ws_url_override_is_trimmed() {
        let config = ClientConfig::new(credentials(), ConnectMode::InlineCredentials)
            .with_ws_url("ws://localhost:38080/ws  \n");
        assert_eq!(config.ws_url, "ws://localhost:38080/ws");
    }

    #[test]
    fn token_is_appended_as_query_parameter() {
        let url = token_url(WS_URL, &SecretString::new("r:abc".to_string())).expect("url");
        assert_eq!(
            url.as_str(),
            "wss://l4hfront-prod.chacon.cloud/ws?sessionToken=r%3Aabc"
        );
    }

    #[test]
    fn inline_credentials_are_url_encoded() {
        let creds = credentials().with_service_name("ha");
        let url = inline_credentials_url("ws://localhost:1/ws", &creds).expect("url");
        assert_eq!(
            url.query(),
            Some("email=toto%40toto.com&password=p%26ss+word&serviceName=ha")
        );
    }

    #[test]
    fn redacted_url_hides_query() {
        let url = inline_credentials_url("ws://localhost:1/ws", &credentials()).expect("url");
        assert_eq!(redacted(&url), "ws://localhost:1/ws");
    }
}
