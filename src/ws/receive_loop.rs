//! Background task that owns the read half of the connection.
//!
//! The loop is the only code that fulfills pending requests and the only
//! caller of subscription callbacks. It also drives the keep-alive: a ping
//! frame every `ping_interval`, and the connection is treated as dead if
//! the pong does not arrive within `ping_timeout`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use super::MessageId;
use super::client::Shared;
use super::correlation::{CorrelationTable, Reply};
use super::messages::{InboundMessage, MessageType};
use super::session::SessionState;
use super::transport::{self, Frame, WsSource};

/// What [`dispatch`] did with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// Fulfilled the pending request with this ID.
    Reply(MessageId),
    /// Delivered an event to the subscription with this ID.
    Event(MessageId),
    /// Nothing was registered under this ID.
    Dropped(MessageId),
    /// Frame without an ID or of a type the loop does not route.
    Ignored,
    /// Not a JSON frame with a `type`.
    Malformed,
}

/// Routes one inbound text frame to the correlation table.
pub(crate) fn dispatch(table: &CorrelationTable, text: &str) -> Dispatched {
    let message = match InboundMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, len = text.len(), "ignoring malformed frame");
            return Dispatched::Malformed;
        }
    };

    let Some(id) = message.id else {
        tracing::debug!(msg_type = ?message.msg_type, "ignoring frame without id");
        return Dispatched::Ignored;
    };

    match message.msg_type {
        MessageType::Event => {
            let Some(slot) = table.subscription(id) else {
                tracing::debug!(%id, "dropping event for unknown subscription");
                return Dispatched::Dropped(id);
            };
            let event = message.into_event();
            match std::panic::catch_unwind(AssertUnwindSafe(|| slot.deliver(event))) {
                Ok(true) => Dispatched::Event(id),
                Ok(false) => {
                    tracing::debug!(%id, "dropping event for removed subscription");
                    Dispatched::Dropped(id)
                }
                Err(_) => {
                    tracing::warn!(subscription = %id, "subscription callback panicked");
                    Dispatched::Event(id)
                }
            }
        }
        MessageType::Result => deliver(table, id, message.into_reply()),
        MessageType::Pong => deliver(table, id, Ok(Value::Null)),
        other => {
            tracing::debug!(%id, msg_type = ?other, "ignoring frame");
            Dispatched::Ignored
        }
    }
}

fn deliver(table: &CorrelationTable, id: MessageId, reply: Reply) -> Dispatched {
    if table.fulfill(id, reply) {
        Dispatched::Reply(id)
    } else {
        tracing::debug!(%id, "dropping reply with no pending request");
        Dispatched::Dropped(id)
    }
}

/// Runs until the server closes, the keep-alive expires, or `shutdown`
/// fires. On exit every pending request fails with
/// [`ClientError::ConnectionClosed`](crate::error::ClientError::ConnectionClosed)
/// and all subscriptions are dropped.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut source: WsSource,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = keep_alive_ticker(shared.config.ping_interval);
    let ping_timeout = shared.config.ping_timeout;
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break "shutdown requested";
                }
            }
            item = source.next() => match transport::classify(item) {
                Ok(Frame::Text(text)) => {
                    dispatch(&shared.table, &text);
                }
                Ok(Frame::Pong) => pong_deadline = None,
                Ok(Frame::Control) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "websocket read ended");
                    break "connection closed by server";
                }
            },
            () = tick(&mut ticker) => {
                if pong_deadline.is_none() {
                    let sent = shared
                        .transport
                        .writer()
                        .await
                        .send(Message::Ping(Default::default()))
                        .await;
                    if let Err(e) = sent {
                        tracing::debug!(error = %e, "keep-alive ping failed");
                        break "keep-alive ping failed";
                    }
                    pong_deadline = Some(Instant::now() + ping_timeout);
                }
            }
            () = expire(pong_deadline) => {
                tracing::warn!(timeout_ms = ping_timeout.as_millis(), "keep-alive pong overdue");
                break "keep-alive timeout";
            }
        }
    };

    let failed = shared.table.close();
    if !shared.session.get().is_shutting_down() {
        shared.transport.close().await;
    }
    let _ = shared.session.advance(SessionState::Closed);
    tracing::info!(reason, failed_requests = failed, "receive loop stopped");
}

fn keep_alive_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::error::ClientError;
    use crate::ws::correlation::EventCallback;

    fn id(raw: u64) -> MessageId {
        MessageId::new(raw)
    }

    #[tokio::test]
    async fn result_frame_fulfills_matching_request() {
        let table = CorrelationTable::new();
        let Ok(rx) = table.register(id(1), None) else {
            panic!("register failed");
        };

        let outcome = dispatch(&table, r#"{"id":1,"type":"result","success":true,"result":[]}"#);
        assert_eq!(outcome, Dispatched::Reply(id(1)));

        let Ok(Ok(value)) = rx.await else {
            panic!("expected a reply");
        };
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn error_result_becomes_server_error() {
        let table = CorrelationTable::new();
        let Ok(rx) = table.register(id(4), None) else {
            panic!("register failed");
        };
        dispatch(
            &table,
            r#"{"id":4,"type":"result","success":false,"error":{"code":"unknown_command","message":"Unknown command."}}"#,
        );
        let Ok(Err(ClientError::Server { code, .. })) = rx.await else {
            panic!("expected server error");
        };
        assert_eq!(code, "unknown_command");
    }

    #[tokio::test]
    async fn pong_fulfills_with_null() {
        let table = CorrelationTable::new();
        let Ok(rx) = table.register(id(8), None) else {
            panic!("register failed");
        };
        assert_eq!(dispatch(&table, r#"{"id":8,"type":"pong"}"#), Dispatched::Reply(id(8)));
        assert!(matches!(rx.await, Ok(Ok(Value::Null))));
    }

    #[tokio::test]
    async fn malformed_frame_between_results_is_skipped() {
        let table = CorrelationTable::new();
        let (Ok(rx1), Ok(rx2)) = (table.register(id(1), None), table.register(id(2), None)) else {
            panic!("register failed");
        };

        assert_eq!(
            dispatch(&table, r#"{"id":1,"type":"result","success":true,"result":1}"#),
            Dispatched::Reply(id(1))
        );
        assert_eq!(dispatch(&table, "{not json"), Dispatched::Malformed);
        assert_eq!(
            dispatch(&table, r#"{"id":2,"type":"result","success":true,"result":2}"#),
            Dispatched::Reply(id(2))
        );

        assert!(matches!(rx1.await, Ok(Ok(v)) if v == json!(1)));
        assert!(matches!(rx2.await, Ok(Ok(v)) if v == json!(2)));
    }

    #[test]
    fn events_reach_callback_in_arrival_order() {
        let table = CorrelationTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: EventCallback = Arc::new(move |event| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(event);
            }
        });
        let Ok(_ack) = table.register(id(2), Some(callback)) else {
            panic!("register failed");
        };

        dispatch(&table, r#"{"id":2,"type":"event","event":{"n":1}}"#);
        dispatch(&table, r#"{"id":2,"type":"event","event":{"n":2}}"#);

        let Ok(seen) = seen.lock() else {
            panic!("poisoned");
        };
        assert_eq!(*seen, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn late_reply_is_dropped_silently() {
        let table = CorrelationTable::new();
        let outcome = dispatch(&table, r#"{"id":42,"type":"result","success":true,"result":null}"#);
        assert_eq!(outcome, Dispatched::Dropped(id(42)));
        assert_eq!(table.dropped_replies(), 1);
    }

    #[test]
    fn event_for_removed_subscription_is_dropped() {
        let table = CorrelationTable::new();
        let outcome = dispatch(&table, r#"{"id":5,"type":"event","event":{}}"#);
        assert_eq!(outcome, Dispatched::Dropped(id(5)));
    }

    #[test]
    fn panicking_callback_does_not_escape() {
        let table = CorrelationTable::new();
        let callback: EventCallback = Arc::new(|_| panic!("callback failure"));
        let Ok(_ack) = table.register(id(3), Some(callback)) else {
            panic!("register failed");
        };
        let outcome = dispatch(&table, r#"{"id":3,"type":"event","event":{}}"#);
        assert_eq!(outcome, Dispatched::Event(id(3)));
    }

    #[test]
    fn frames_without_id_are_ignored() {
        let table = CorrelationTable::new();
        assert_eq!(dispatch(&table, r#"{"type":"auth_ok"}"#), Dispatched::Ignored);
        assert_eq!(dispatch(&table, r#"{"id":1,"type":"auth_ok"}"#), Dispatched::Ignored);
    }

    #[test]
    fn zero_interval_disables_keep_alive() {
        assert!(keep_alive_ticker(Duration::ZERO).is_none());
    }
}
