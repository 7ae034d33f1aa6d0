//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready -> Closing -> Closed
//!       ^              |               |
//!       +--------------+---------------+   (connect failed)
//! ```
//!
//! Any state may jump to `Closing` or `Closed`; `Closed` is terminal.

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ClientError;

/// Lifecycle state of a [`WebSocketClient`](super::WebSocketClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// Transport being opened.
    Connecting,
    /// Transport open, handshake in progress.
    Authenticating,
    /// Authenticated; commands and subscriptions are accepted.
    Ready,
    /// `close()` in progress.
    Closing,
    /// Connection finished; terminal.
    Closed,
}

impl SessionState {
    /// Returns `true` if commands may be issued.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` for `Closing` and `Closed`.
    #[must_use]
    pub const fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Returns `true` if moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Closed, _) => false,
            (_, Self::Closed) => true,
            (Self::Closing, _) => false,
            (_, Self::Closing) => true,
            (Self::Disconnected, Self::Connecting)
            | (Self::Connecting, Self::Authenticating | Self::Disconnected)
            | (Self::Authenticating, Self::Ready | Self::Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared, observable session state.
#[derive(Debug)]
pub(crate) struct Session {
    state: Mutex<SessionState>,
    notify: watch::Sender<SessionState>,
}

impl Session {
    pub(crate) fn new() -> Self {
        let (notify, _) = watch::channel(SessionState::Disconnected);
        Self {
            state: Mutex::new(SessionState::Disconnected),
            notify,
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionState> {
        self.notify.subscribe()
    }

    /// Moves to `next` if the transition is allowed.
    ///
    /// Fails with [`ClientError::NotReady`] carrying the current state.
    pub(crate) fn advance(&self, next: SessionState) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(ClientError::NotReady(*state));
        }
        *state = next;
        drop(state);
        self.notify.send_replace(next);
        Ok(())
    }

    /// Moves from exactly `from` to `next`; fails if the state changed.
    pub(crate) fn advance_from(
        &self,
        from: SessionState,
        next: SessionState,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if *state != from || !from.can_transition_to(next) {
            return Err(ClientError::NotReady(*state));
        }
        *state = next;
        drop(state);
        self.notify.send_replace(next);
        Ok(())
    }

    /// Fails with [`ClientError::NotReady`] unless the session is `Ready`.
    pub(crate) fn ensure_ready(&self) -> Result<(), ClientError> {
        let state = self.get();
        if state.is_ready() {
            Ok(())
        } else {
            Err(ClientError::NotReady(state))
        }
    }
}
