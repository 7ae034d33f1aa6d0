//! Duplex WebSocket transport.
//!
//! [`open`] dials the endpoint with `tokio-tungstenite` and splits the
//! stream. The read half goes to the handshake and then to the receive
//! loop; the write half lives in a [`Transport`] whose mutex is the single
//! writer path, so outbound frames never interleave.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of an open connection.
pub(crate) type WsSink = SplitSink<WsStream, Message>;

/// Read half of an open connection.
pub(crate) type WsSource = SplitStream<WsStream>;

/// Opens the WebSocket connection described by `config`.
///
/// Applies the connect timeout, the inbound size limit, and disables
/// certificate verification when `verify_ssl` is off.
///
/// # Errors
///
/// Returns [`ClientError::ConnectionFailure`] if the endpoint cannot be
/// reached in time or the upgrade is refused, and [`ClientError::Config`]
/// if the URL is invalid.
pub(crate) async fn open(config: &ClientConfig) -> Result<(WsSink, WsSource), ClientError> {
    let url = config.websocket_url()?;
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_size))
        .max_frame_size(Some(config.max_message_size));
    let connector = tls_connector(config.verify_ssl)?;

    tracing::debug!(url = %url, "connecting websocket");

    let connect = tokio_tungstenite::connect_async_tls_with_config(
        url.as_str(),
        Some(ws_config),
        true,
        connector,
    );
    let (stream, _response) = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| {
            ClientError::ConnectionFailure(format!(
                "timed out after {} ms connecting to {url}",
                config.connect_timeout.as_millis()
            ))
        })?
        .map_err(|e| connect_error(&url, &e))?;

    Ok(stream.split())
}

fn tls_connector(verify_ssl: bool) -> Result<Option<Connector>, ClientError> {
    if verify_ssl {
        return Ok(None);
    }
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| ClientError::ConnectionFailure(format!("TLS setup failed: {e}")))?;
    Ok(Some(Connector::NativeTls(tls)))
}

fn connect_error(url: &str, err: &WsError) -> ClientError {
    let reason = match err {
        WsError::Http(resp) => format!("HTTP status {}", resp.status()),
        WsError::Url(e) => format!("invalid URL: {e}"),
        other => other.to_string(),
    };
    ClientError::ConnectionFailure(format!("{url}: {reason}"))
}

/// Maps a write/read error on an established connection.
pub(crate) fn io_error(err: WsError) -> ClientError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) => {
            ClientError::ConnectionClosed
        }
        other => ClientError::ConnectionFailure(other.to_string()),
    }
}

/// Owner of the write half.
#[derive(Default)]
pub(crate) struct Transport {
    sink: Mutex<Option<WsSink>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs the write half of a freshly authenticated connection.
    pub(crate) async fn attach(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Locks the writer. Hold the returned guard across ID allocation,
    /// registration and the send so wire order matches ID order.
    pub(crate) async fn writer(&self) -> Writer<'_> {
        Writer {
            sink: self.sink.lock().await,
        }
    }

    /// Sends a close frame and releases the write half. Safe to call in
    /// any state and more than once.
    pub(crate) async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink
            && let Err(e) = sink.close().await
        {
            tracing::debug!(error = %e, "error while closing websocket");
        }
    }
}

/// Exclusive access to the write half.
pub(crate) struct Writer<'a> {
    sink: MutexGuard<'a, Option<WsSink>>,
}

impl Writer<'_> {
    /// Serializes `value` and sends it as one text frame.
    pub(crate) async fn send_json(&mut self, value: &Value) -> Result<(), ClientError> {
        let text = serde_json::to_string(value)?;
        self.send(Message::text(text)).await
    }

    /// Sends a raw frame.
    pub(crate) async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(ClientError::ConnectionFailure(
                "transport is not open".to_string(),
            ));
        };
        sink.send(message).await.map_err(io_error)
    }
}

/// Sends one JSON frame on a sink that is not yet shared (handshake).
pub(crate) async fn send_json(sink: &mut WsSink, value: &Value) -> Result<(), ClientError> {
    let text = serde_json::to_string(value)?;
    sink.send(Message::text(text)).await.map_err(io_error)
}

/// One item read from the stream, reduced to what the client cares about.
#[derive(Debug)]
pub(crate) enum Frame {
    /// A text frame, or a binary frame holding valid UTF-8.
    Text(String),
    /// A keep-alive pong.
    Pong,
    /// Anything else (pings are answered by tungstenite itself).
    Control,
}

/// Reduces one stream item to a [`Frame`].
///
/// # Errors
///
/// Returns [`ClientError::ConnectionClosed`] when the peer closes or the
/// stream ends.
pub(crate) fn classify(item: Option<Result<Message, WsError>>) -> Result<Frame, ClientError> {
    match item {
        Some(Ok(Message::Text(text))) => Ok(Frame::Text(text.as_str().to_owned())),
        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Ok(Frame::Text(text)),
            Err(_) => {
                tracing::debug!(len = data.len(), "ignoring non-utf8 binary frame");
                Ok(Frame::Control)
            }
        },
        Some(Ok(Message::Pong(_))) => Ok(Frame::Pong),
        Some(Ok(Message::Close(_))) | None => Err(ClientError::ConnectionClosed),
        Some(Ok(_)) => Ok(Frame::Control),
        Some(Err(e)) => Err(io_error(e)),
    }
}

/// Waits for the next text frame, skipping control frames.
///
/// # Errors
///
/// Returns [`ClientError::ConnectionClosed`] when the peer closes or the
/// stream ends.
pub(crate) async fn next_text(source: &mut WsSource) -> Result<String, ClientError> {
    loop {
        if let Frame::Text(text) = classify(source.next().await)? {
            return Ok(text);
        }
    }
}
