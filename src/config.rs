//! Client configuration.
//!
//! A [`ClientConfig`] is built explicitly by the caller, either with
//! [`ClientConfig::new`] plus the `with_*` builders or from environment
//! variables (or a `.env` file via `dotenvy`) with
//! [`ClientConfig::from_env`]. Nothing is cached process-wide.

use std::fmt;
use std::time::Duration;

use crate::error::ClientError;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default transport/handshake timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default keep-alive ping interval in seconds.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Default time to wait for a keep-alive pong, in seconds.
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 10;

/// Default upper bound on a single inbound message (20 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 20 * 1024 * 1024;

/// Path of the WebSocket endpoint on the server.
const WEBSOCKET_PATH: &str = "/api/websocket";

/// Connection settings for one [`WebSocketClient`](crate::ws::WebSocketClient).
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the server (e.g. `http://homeassistant.local:8123`).
    pub url: String,

    /// Long-lived access token sent during the handshake.
    pub token: String,

    /// Default deadline for a single command reply.
    pub request_timeout: Duration,

    /// Deadline for opening the transport and for the handshake.
    pub connect_timeout: Duration,

    /// Whether TLS certificates are verified for `wss://` endpoints.
    pub verify_ssl: bool,

    /// Interval between keep-alive pings.
    pub ping_interval: Duration,

    /// How long to wait for a pong before treating the link as dead.
    pub ping_timeout: Duration,

    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl ClientConfig {
    /// Creates a configuration with default timeouts for the given server.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            verify_ssl: true,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    /// Numeric settings fall back to their defaults when missing or invalid.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if `HAB_URL` or `HAB_TOKEN` is not set.
    pub fn from_env() -> Result<Self, ClientError> {
        dotenvy::dotenv().ok();

        let url = std::env::var("HAB_URL")
            .map_err(|_| ClientError::Config("HAB_URL is not set".to_string()))?;
        let token = std::env::var("HAB_TOKEN")
            .map_err(|_| ClientError::Config("HAB_TOKEN is not set".to_string()))?;

        Ok(Self {
            request_timeout: Duration::from_secs(parse_env("HAB_TIMEOUT", DEFAULT_TIMEOUT_SECS)),
            connect_timeout: Duration::from_secs(parse_env(
                "HAB_CONNECT_TIMEOUT",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            verify_ssl: parse_env_bool("HAB_VERIFY_SSL", true),
            ping_interval: Duration::from_secs(parse_env(
                "HAB_PING_INTERVAL",
                DEFAULT_PING_INTERVAL_SECS,
            )),
            ping_timeout: Duration::from_secs(parse_env(
                "HAB_PING_TIMEOUT",
                DEFAULT_PING_TIMEOUT_SECS,
            )),
            max_message_size: parse_env("HAB_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE),
            ..Self::new(url, token)
        })
    }

    /// Sets the default request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the transport/handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub fn with_verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = verify;
        self
    }

    /// Sets the keep-alive ping interval and pong timeout.
    #[must_use]
    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    /// Sets the maximum inbound message size in bytes.
    #[must_use]
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Builds the WebSocket endpoint from the base URL.
    ///
    /// `http` becomes `ws`, `https` becomes `wss`, a bare host gets `ws://`
    /// and `/api/websocket` is appended.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the URL is empty or uses a scheme
    /// other than `http`, `https`, `ws` or `wss`.
    pub fn websocket_url(&self) -> Result<String, ClientError> {
        let base = self.url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(ClientError::Config("server URL is empty".to_string()));
        }

        let base = match base.split_once("://") {
            Some(("https" | "wss", rest)) => format!("wss://{rest}"),
            Some(("http" | "ws", rest)) => format!("ws://{rest}"),
            Some((scheme, _)) => {
                return Err(ClientError::Config(format!(
                    "unsupported URL scheme: {scheme}"
                )));
            }
            None => format!("ws://{base}"),
        };

        Ok(format!("{base}{WEBSOCKET_PATH}"))
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("verify_ssl", &self.verify_ssl)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean flag.
fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map_or(default, |v| parse_flag(&v))
}

/// `"0"`, `"false"` and `"no"` (case-insensitive) are false; anything else
/// is true.
fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no"
    )
}
