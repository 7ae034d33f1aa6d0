//! WebSocket layer: connection lifecycle, request correlation, events.
//!
//! One [`WebSocketClient`] owns one authenticated connection. Commands are
//! tagged with a fresh [`MessageId`] and their replies are routed back by a
//! background receive loop; subscriptions receive server events under the
//! ID of the command that created them.

pub mod api;
pub mod client;
pub mod correlation;
mod handshake;
pub mod message_id;
pub mod messages;
mod receive_loop;
pub mod session;
mod transport;

pub use api::{Object, Registry, ServiceCall};
pub use client::WebSocketClient;
pub use correlation::{CorrelationTable, EventCallback};
pub use message_id::MessageId;
pub use messages::{Command, InboundMessage, MessageType};
pub use session::SessionState;
