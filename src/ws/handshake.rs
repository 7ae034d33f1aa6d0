//! Authentication prologue run once per connection.
//!
//! ```text
//! server: {"type":"auth_required"}
//! client: {"type":"auth","access_token":"..."}
//! server: {"type":"auth_ok"} | {"type":"auth_invalid","message":"..."}
//! ```

use super::messages::{InboundMessage, MessageType, auth_message};
use super::transport::{self, WsSink, WsSource};
use crate::error::ClientError;

/// Runs the handshake on a freshly opened transport.
///
/// # Errors
///
/// - [`ClientError::Protocol`] if the first frame is not `auth_required`,
///   the reply is neither `auth_ok` nor `auth_invalid`, or a frame is not
///   valid JSON.
/// - [`ClientError::Authentication`] if the server answers `auth_invalid`.
/// - [`ClientError::ConnectionClosed`] if the server hangs up mid-way.
pub(crate) async fn authenticate(
    sink: &mut WsSink,
    source: &mut WsSource,
    token: &str,
) -> Result<(), ClientError> {
    let first = receive(source).await?;
    if first.msg_type != MessageType::AuthRequired {
        return Err(ClientError::Protocol(format!(
            "expected auth_required, got {:?}",
            first.msg_type
        )));
    }

    tracing::debug!("received auth_required, sending auth");
    transport::send_json(sink, &auth_message(token)).await?;

    let reply = receive(source).await?;
    check_auth_reply(reply)
}

/// Interprets the server's answer to the `auth` frame.
pub(crate) fn check_auth_reply(reply: InboundMessage) -> Result<(), ClientError> {
    match reply.msg_type {
        MessageType::AuthOk => Ok(()),
        MessageType::AuthInvalid => Err(ClientError::Authentication(
            reply
                .message
                .unwrap_or_else(|| "invalid access token".to_string()),
        )),
        other => Err(ClientError::Protocol(format!(
            "unexpected auth response: {other:?}"
        ))),
    }
}

async fn receive(source: &mut WsSource) -> Result<InboundMessage, ClientError> {
    let text = transport::next_text(source).await?;
    InboundMessage::parse(&text)
        .map_err(|e| ClientError::Protocol(format!("malformed handshake frame: {e}")))
}
