//! Command API over a single authenticated WebSocket connection.
//!
//! [`WebSocketClient`] multiplexes any number of concurrent commands and
//! standing subscriptions over one duplex connection. Each request gets a
//! fresh [`MessageId`]; its reply is routed back by the receive loop through
//! the [`CorrelationTable`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::correlation::{CorrelationTable, EventCallback, RequestGuard};
use super::message_id::IdAllocator;
use super::messages::{self, Command};
use super::session::{Session, SessionState};
use super::transport::{self, Transport};
use super::{MessageId, handshake, receive_loop};
use crate::config::ClientConfig;
use crate::error::ClientError;

/// State shared between the client handle and its receive loop.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) session: Session,
    pub(crate) table: CorrelationTable,
    pub(crate) transport: Transport,
    pub(crate) ids: IdAllocator,
}

#[derive(Debug)]
struct ReceiveLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Asynchronous command/event client for one server connection.
///
/// All methods take `&self`; wrap the client in an [`Arc`] to share it
/// between tasks.
///
/// ```no_run
/// use hab_client::config::ClientConfig;
/// use hab_client::ws::{Command, WebSocketClient};
///
/// # async fn example() -> Result<(), hab_client::error::ClientError> {
/// let client = WebSocketClient::new(ClientConfig::new("http://ha.local:8123", "token"));
/// client.connect().await?;
/// let states = client.send_command(Command::new("get_states")).await?;
/// println!("{states}");
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WebSocketClient {
    shared: Arc<Shared>,
    receive_loop: Mutex<Option<ReceiveLoop>>,
}

impl WebSocketClient {
    /// Creates a disconnected client.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                session: Session::new(),
                table: CorrelationTable::new(),
                transport: Transport::new(),
                ids: IdAllocator::new(),
            }),
            receive_loop: Mutex::new(None),
        }
    }

    /// Creates a client and connects it.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn connect_with(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config);
        client.connect().await?;
        Ok(client)
    }

    /// Returns the configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.session.get()
    }

    /// Returns a receiver that observes every state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.session.watch()
    }

    /// Number of commands currently awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.table.pending_count()
    }

    /// Number of standing subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.table.subscription_count()
    }

    /// Number of replies dropped because nobody was waiting for them
    /// (late replies after a timeout, duplicates).
    #[must_use]
    pub fn dropped_replies(&self) -> u64 {
        self.shared.table.dropped_replies()
    }

    /// Opens the transport, authenticates, and starts the receive loop.
    ///
    /// On failure the transport is released and the client returns to
    /// [`SessionState::Disconnected`], so `connect` may be retried.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotReady`] if the client is not disconnected.
    /// - [`ClientError::ConnectionFailure`] if the endpoint is unreachable.
    /// - [`ClientError::Protocol`] / [`ClientError::Authentication`] if the
    ///   handshake fails.
    /// - [`ClientError::Timeout`] if the handshake exceeds the connect timeout.
    /// - [`ClientError::ConnectionClosed`] if [`close`](Self::close) ran
    ///   concurrently.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.shared
            .session
            .advance_from(SessionState::Disconnected, SessionState::Connecting)?;

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.shared.session.advance(SessionState::Disconnected);
                tracing::debug!(error = %e, "connect failed");
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(), ClientError> {
        let config = &self.shared.config;
        let (mut sink, mut source) = transport::open(config).await?;

        if self
            .shared
            .session
            .advance_from(SessionState::Connecting, SessionState::Authenticating)
            .is_err()
        {
            return Err(ClientError::ConnectionClosed);
        }

        let handshake = tokio::time::timeout(
            config.connect_timeout,
            handshake::authenticate(&mut sink, &mut source, &config.token),
        )
        .await
        .unwrap_or(Err(ClientError::Timeout(config.connect_timeout)));
        if let Err(e) = handshake {
            let _ = sink.close().await;
            return Err(e);
        }

        self.shared.transport.attach(sink).await;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop::run(
            Arc::clone(&self.shared),
            source,
            shutdown_rx,
        ));
        *self.receive_loop.lock() = Some(ReceiveLoop { shutdown, task });

        if self
            .shared
            .session
            .advance_from(SessionState::Authenticating, SessionState::Ready)
            .is_err()
        {
            self.stop_receive_loop().await;
            self.shared.transport.close().await;
            return Err(ClientError::ConnectionClosed);
        }

        tracing::info!(url = %config.url, "websocket authenticated");
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Stops the receive loop, sends a close frame, fails every in-flight
    /// request with [`ClientError::ConnectionClosed`] and drops all
    /// subscriptions. Idempotent and safe in any state.
    pub async fn close(&self) {
        if self.shared.session.get() == SessionState::Closed {
            return;
        }
        let _ = self.shared.session.advance(SessionState::Closing);

        self.stop_receive_loop().await;
        self.shared.transport.close().await;
        let failed = self.shared.table.close();
        let _ = self.shared.session.advance(SessionState::Closed);

        tracing::info!(failed_requests = failed, "websocket closed");
    }

    async fn stop_receive_loop(&self) {
        let handle = self.receive_loop.lock().take();
        if let Some(ReceiveLoop { shutdown, task }) = handle {
            let _ = shutdown.send(true);
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::warn!("receive loop panicked");
            }
        }
    }

    /// Sends a command and waits for its result, using the configured
    /// request timeout.
    ///
    /// # Errors
    ///
    /// See [`send_command_with_timeout`](Self::send_command_with_timeout).
    pub async fn send_command(&self, command: Command) -> Result<Value, ClientError> {
        self.send_command_with_timeout(command, self.shared.config.request_timeout)
            .await
    }

    /// Sends a command and waits at most `timeout` for its result.
    ///
    /// Returns the server's `result` payload verbatim.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotReady`] if the client is not connected.
    /// - [`ClientError::Server`] if the server answered with an error.
    /// - [`ClientError::Timeout`] if no reply arrived in time; a late reply
    ///   is dropped.
    /// - [`ClientError::ConnectionClosed`] if the connection went away.
    pub async fn send_command_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let (_, result) = self.round_trip(command, None, timeout).await?;
        Ok(result)
    }

    /// Sends a `ping` and returns the round-trip time.
    ///
    /// # Errors
    ///
    /// Same as [`send_command`](Self::send_command).
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.send_command(Command::new("ping")).await?;
        Ok(started.elapsed())
    }

    /// Subscribes to server events, optionally filtered by event type.
    ///
    /// `callback` runs on the receive loop task for every event, in arrival
    /// order, and must return promptly. It may already run before this
    /// method returns. The returned ID is the handle for
    /// [`unsubscribe`](Self::unsubscribe).
    ///
    /// # Errors
    ///
    /// Same as [`send_command`](Self::send_command). On error nothing stays
    /// registered.
    pub async fn subscribe<F>(
        &self,
        event_type: Option<&str>,
        callback: F,
    ) -> Result<MessageId, ClientError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribe_command(messages::subscribe_events(event_type), callback)
            .await
    }

    /// Issues any subscription-style command (one acknowledgement, then
    /// events under the same ID).
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn subscribe_command<F>(
        &self,
        command: Command,
        callback: F,
    ) -> Result<MessageId, ClientError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let (id, _) = self
            .round_trip(command, Some(callback), self.shared.config.request_timeout)
            .await?;
        tracing::debug!(subscription = %id, "subscribed");
        Ok(id)
    }

    /// Like [`subscribe`](Self::subscribe), delivering events into a channel.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn subscribe_channel(
        &self,
        event_type: Option<&str>,
    ) -> Result<(MessageId, mpsc::UnboundedReceiver<Value>), ClientError> {
        self.subscribe_command_channel(messages::subscribe_events(event_type))
            .await
    }

    /// Like [`subscribe_command`](Self::subscribe_command), delivering events
    /// into a channel.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn subscribe_command_channel(
        &self,
        command: Command,
    ) -> Result<(MessageId, mpsc::UnboundedReceiver<Value>), ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe_command(command, move |event| {
                let _ = tx.send(event);
            })
            .await?;
        Ok((id, rx))
    }

    /// Cancels a subscription.
    ///
    /// The local entry is removed first, so no further events reach the
    /// callback even if the server keeps sending them; an event already
    /// being delivered finishes before the removal completes. Then the
    /// server is notified with `unsubscribe_events`. Unknown handles are a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of the server notification; the subscription is
    /// already gone locally when this happens.
    pub async fn unsubscribe(&self, subscription: MessageId) -> Result<(), ClientError> {
        if !self.shared.table.remove_subscription(subscription) {
            tracing::debug!(%subscription, "unsubscribe of unknown subscription ignored");
            return Ok(());
        }
        match self
            .send_command(messages::unsubscribe_events(subscription))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(%subscription, error = %e, "server did not confirm unsubscribe");
                Err(e)
            }
        }
    }

    /// Drops a subscription locally without telling the server.
    pub(crate) fn forget_subscription(&self, subscription: MessageId) -> bool {
        self.shared.table.remove_subscription(subscription)
    }

    /// Allocates an ID, registers the request (and subscription), sends it,
    /// and awaits the reply. Every exit path removes the pending entry; the
    /// subscription entry survives only a successful acknowledgement.
    async fn round_trip(
        &self,
        command: Command,
        subscription: Option<EventCallback>,
        timeout: Duration,
    ) -> Result<(MessageId, Value), ClientError> {
        self.shared.session.ensure_ready()?;

        let shared = &self.shared;
        let owns_subscription = subscription.is_some();
        let command_type = command.command_type().to_owned();

        let exchange = async {
            let mut writer = shared.transport.writer().await;
            let id = shared.ids.next_id();
            let reply = shared.table.register(id, subscription)?;
            let mut guard = RequestGuard::new(&shared.table, id, owns_subscription);

            tracing::debug!(%id, command_type = %command_type, "sending command");
            writer.send_json(&command.into_message(id)).await?;
            drop(writer);

            let result = reply.await.unwrap_or(Err(ClientError::ConnectionClosed))?;
            guard.keep_subscription();
            Ok::<_, ClientError>((id, result))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(
                    command_type = %command_type,
                    timeout_ms = timeout.as_millis(),
                    "command timed out"
                );
                Err(ClientError::Timeout(timeout))
            }
        }
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(receive_loop) = self.receive_loop.get_mut().take() {
            let _ = receive_loop.shutdown.send(true);
        }
    }
}
