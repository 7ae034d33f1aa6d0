//! Client error types with CLI exit code mapping.
//!
//! [`ClientError`] is the central error type for the client. Each variant
//! maps to a stable string code and to the exit code the command-line
//! layer reports for it.

use std::time::Duration;

use crate::ws::session::SessionState;

/// Process exit codes reported by the command-line layer.
///
/// | Code | Meaning           |
/// |------|-------------------|
/// | 0    | Success           |
/// | 1    | General error     |
/// | 2    | Invalid arguments |
/// | 3    | Authentication    |
/// | 4    | Resource not found|
/// | 5    | Permission denied |
/// | 6    | Connection        |
/// | 7    | Validation        |
/// | 8    | Timeout           |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Command completed.
    Success = 0,
    /// Any failure without a more specific code.
    GeneralError = 1,
    /// Bad command-line arguments.
    InvalidArguments = 2,
    /// Token rejected or handshake failed.
    AuthenticationError = 3,
    /// Server reported the resource does not exist.
    ResourceNotFound = 4,
    /// Server refused the operation for this user.
    PermissionDenied = 5,
    /// Transport could not be opened or was lost.
    ConnectionError = 6,
    /// Server rejected the command's parameters.
    ValidationError = 7,
    /// No reply within the deadline.
    Timeout = 8,
}

impl ExitCode {
    /// Returns the numeric process exit code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Client-side error enum.
///
/// Handshake errors abort [`connect`](crate::ws::WebSocketClient::connect)
/// entirely. Per-command errors are only ever observed by the caller that
/// issued the command.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The transport could not be opened, or a frame could not be written.
    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    /// The server sent something unexpected during the handshake.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server explicitly rejected the access token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The transport dropped while the request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply arrived within the deadline.
    #[error("no reply within {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Well-formed error result from the server.
    #[error("server error [{code}]: {message}")]
    Server {
        /// Server error code (e.g. `not_found`).
        code: String,
        /// Human-readable server message.
        message: String,
    },

    /// The operation is not allowed in the current session state.
    #[error("client is not ready (state: {0})")]
    NotReady(SessionState),

    /// Invalid or missing configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A typed wrapper received a result of the wrong JSON shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// A message could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns the stable string code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailure(_) | Self::ConnectionClosed => "CONNECTION_ERROR",
            Self::Protocol(_) | Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Server { .. } => "SERVER_ERROR",
            Self::NotReady(_) => "NOT_READY",
            Self::Config(_) => "INVALID_ARGUMENTS",
            Self::UnexpectedResponse(_) | Self::Serialization(_) => "GENERAL_ERROR",
        }
    }

    /// Returns the process exit code for this variant.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::ConnectionFailure(_) | Self::ConnectionClosed => ExitCode::ConnectionError,
            Self::Protocol(_) | Self::Authentication(_) => ExitCode::AuthenticationError,
            Self::Timeout(_) => ExitCode::Timeout,
            Self::Server { code, .. } => match code.as_str() {
                "not_found" => ExitCode::ResourceNotFound,
                "unauthorized" => ExitCode::PermissionDenied,
                "invalid_format" => ExitCode::ValidationError,
                "timeout" => ExitCode::Timeout,
                _ => ExitCode::GeneralError,
            },
            Self::Config(_) => ExitCode::InvalidArguments,
            Self::NotReady(_) | Self::UnexpectedResponse(_) | Self::Serialization(_) => {
                ExitCode::GeneralError
            }
        }
    }

    /// Returns `true` for caller mistakes (wrong session state) as opposed
    /// to network or server failures.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }
}
