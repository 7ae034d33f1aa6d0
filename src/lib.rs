//! # hab-client
//!
//! Asynchronous client for the Home Assistant WebSocket API.
//!
//! A single authenticated connection carries any number of concurrent
//! commands and standing event subscriptions. Replies are matched to their
//! callers by message ID, so they may arrive in any order.
//!
//! ## Architecture
//!
//! ```text
//! Callers (send_command, subscribe, typed wrappers)
//!     │
//!     ├── WebSocketClient (ws/client)
//!     │       ├── Session state machine (ws/session)
//!     │       ├── IdAllocator + writer lock (ws/message_id, ws/transport)
//!     │       └── CorrelationTable (ws/correlation)
//!     │
//!     ├── Receive loop task (ws/receive_loop)
//!     │       ├── replies  -> pending oneshot slots
//!     │       ├── events   -> subscription callbacks
//!     │       └── keep-alive ping/pong
//!     │
//!     └── tokio-tungstenite (ws://, wss://)
//! ```

pub mod config;
pub mod error;
pub mod ws;
