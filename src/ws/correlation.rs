//! Correlation table: in-flight requests and standing subscriptions.
//!
//! [`CorrelationTable`] maps a [`MessageId`] to the caller awaiting its
//! reply (a single-assignment `oneshot` slot) and/or to a subscription
//! callback. All mutation happens under one `parking_lot` mutex, so
//! registration, lookup and removal are atomic with respect to each other:
//! a reply can only be delivered to a slot that is still registered, and a
//! slot removed on timeout can never be fulfilled afterwards.
//!
//! Callbacks are never invoked while the table lock is held. Each
//! subscription has its own [`SubscriptionSlot`] lock instead: removal
//! empties the slot under that lock, so once
//! [`remove_subscription`](CorrelationTable::remove_subscription) returns
//! the callback can no longer start.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use super::MessageId;
use crate::error::ClientError;

/// Callback invoked by the receive loop for every event of a subscription.
///
/// Runs on the receive loop task; it must return promptly.
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

/// Outcome delivered to a pending request.
pub type Reply = Result<Value, ClientError>;

/// Callback of one subscription, emptied when the subscription is removed.
pub struct SubscriptionSlot {
    callback: Mutex<Option<EventCallback>>,
}

impl fmt::Debug for SubscriptionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSlot")
            .field("active", &self.callback.lock().is_some())
            .finish()
    }
}

impl SubscriptionSlot {
    fn new(callback: EventCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Runs the callback with `event` unless the subscription has been
    /// removed. Returns `false` if it was.
    pub fn deliver(&self, event: Value) -> bool {
        let callback = self.callback.lock();
        match callback.as_ref() {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    /// Waits for a running callback to return, then drops it.
    fn clear(&self) {
        let callback = self.callback.lock().take();
        drop(callback);
    }
}

#[derive(Default)]
struct Entries {
    pending: HashMap<MessageId, oneshot::Sender<Reply>>,
    subscriptions: HashMap<MessageId, Arc<SubscriptionSlot>>,
    closed: bool,
}

/// Thread-safe map from message ID to pending request or subscription.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<Entries>,
    dropped_replies: AtomicU64,
}

impl fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("CorrelationTable")
            .field("pending", &entries.pending.len())
            .field("subscriptions", &entries.subscriptions.len())
            .field("closed", &entries.closed)
            .field("dropped_replies", &self.dropped_replies.load(Ordering::Relaxed))
            .finish()
    }
}

impl CorrelationTable {
    /// Creates an empty, open table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending request, and optionally a subscription callback,
    /// under `id` in one atomic step.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] if the table has already
    /// been closed; nothing is registered in that case.
    pub fn register(
        &self,
        id: MessageId,
        subscription: Option<EventCallback>,
    ) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.closed {
            return Err(ClientError::ConnectionClosed);
        }
        entries.pending.insert(id, tx);
        if let Some(callback) = subscription {
            entries
                .subscriptions
                .insert(id, Arc::new(SubscriptionSlot::new(callback)));
        }
        Ok(rx)
    }

    /// Fulfills and removes the pending request for `id`.
    ///
    /// Returns `false` if no request is registered (already fulfilled,
    /// timed out, or never issued); the reply is dropped.
    pub fn fulfill(&self, id: MessageId, reply: Reply) -> bool {
        let sender = self.entries.lock().pending.remove(&id);
        match sender {
            // The caller may have stopped waiting between removal and send.
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                self.dropped_replies.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Removes the pending request for `id` without fulfilling it.
    pub fn remove_pending(&self, id: MessageId) -> bool {
        self.entries.lock().pending.remove(&id).is_some()
    }

    /// Returns the subscription slot registered under `id`.
    #[must_use]
    pub fn subscription(&self, id: MessageId) -> Option<Arc<SubscriptionSlot>> {
        self.entries.lock().subscriptions.get(&id).map(Arc::clone)
    }

    /// Removes the subscription registered under `id`.
    ///
    /// Blocks until a callback already running for it returns. Must not be
    /// called from inside that subscription's own callback.
    pub fn remove_subscription(&self, id: MessageId) -> bool {
        let slot = self.entries.lock().subscriptions.remove(&id);
        match slot {
            Some(slot) => {
                slot.clear();
                true
            }
            None => false,
        }
    }

    /// Closes the table: every pending request fails with
    /// [`ClientError::ConnectionClosed`], all subscriptions are dropped
    /// without a final callback, and later registrations are refused.
    ///
    /// Returns the number of pending requests that were failed.
    pub fn close(&self) -> usize {
        let (pending, subscriptions) = {
            let mut entries = self.entries.lock();
            entries.closed = true;
            (
                std::mem::take(&mut entries.pending),
                std::mem::take(&mut entries.subscriptions),
            )
        };
        for slot in subscriptions.into_values() {
            slot.clear();
        }
        let failed = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
        failed
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.lock().pending.len()
    }

    /// Number of standing subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.entries.lock().subscriptions.len()
    }

    /// Number of replies that arrived for an ID with no pending request.
    #[must_use]
    pub fn dropped_replies(&self) -> u64 {
        self.dropped_replies.load(Ordering::Relaxed)
    }
}

/// Removes a request's table entries when the awaiting caller leaves,
/// whichever way it leaves: reply, error, timeout, or its future being
/// dropped.
pub(crate) struct RequestGuard<'a> {
    table: &'a CorrelationTable,
    id: MessageId,
    owns_subscription: bool,
}

impl<'a> RequestGuard<'a> {
    pub(crate) const fn new(
        table: &'a CorrelationTable,
        id: MessageId,
        owns_subscription: bool,
    ) -> Self {
        Self {
            table,
            id,
            owns_subscription,
        }
    }

    /// Keeps the subscription registered after the guard drops.
    pub(crate) fn keep_subscription(&mut self) {
        self.owns_subscription = false;
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.table.remove_pending(self.id);
        if self.owns_subscription {
            self.table.remove_subscription(self.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn id(raw: u64) -> MessageId {
        MessageId::new(raw)
    }

    fn register(table: &CorrelationTable, raw: u64) -> oneshot::Receiver<Reply> {
        let Ok(rx) = table.register(id(raw), None) else {
            panic!("register failed");
        };
        rx
    }

    #[tokio::test]
    async fn fulfill_delivers_to_matching_slot() {
        let table = CorrelationTable::new();
        let rx1 = register(&table, 1);
        let rx2 = register(&table, 2);

        assert!(table.fulfill(id(2), Ok(json!("two"))));
        assert!(table.fulfill(id(1), Ok(json!("one"))));

        let Ok(Ok(one)) = rx1.await else {
            panic!("slot 1 not fulfilled");
        };
        let Ok(Ok(two)) = rx2.await else {
            panic!("slot 2 not fulfilled");
        };
        assert_eq!(one, json!("one"));
        assert_eq!(two, json!("two"));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn second_fulfillment_is_a_no_op() {
        let table = CorrelationTable::new();
        let _rx = register(&table, 1);
        assert!(table.fulfill(id(1), Ok(json!(1))));
        assert!(!table.fulfill(id(1), Ok(json!(2))));
        assert_eq!(table.dropped_replies(), 1);
    }

    #[test]
    fn removed_request_is_never_fulfilled() {
        let table = CorrelationTable::new();
        let mut rx = register(&table, 7);
        assert!(table.remove_pending(id(7)));
        assert!(!table.fulfill(id(7), Ok(json!("late"))));
        // Sender dropped on removal, so the receiver sees a closed channel.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_id_is_counted_as_dropped() {
        let table = CorrelationTable::new();
        assert!(!table.fulfill(id(99), Ok(Value::Null)));
        assert_eq!(table.dropped_replies(), 1);
    }

    #[tokio::test]
    async fn close_fails_every_pending_request() {
        let table = CorrelationTable::new();
        let receivers: Vec<_> = (1..=5).map(|raw| register(&table, raw)).collect();
        assert_eq!(table.close(), 5);
        for rx in receivers {
            let Ok(Err(ClientError::ConnectionClosed)) = rx.await else {
                panic!("expected ConnectionClosed");
            };
        }
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn close_drops_subscriptions_without_invoking_them() {
        let table = CorrelationTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: EventCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let Ok(_rx) = table.register(id(1), Some(callback)) else {
            panic!("register failed");
        };
        assert_eq!(table.subscription_count(), 1);
        table.close();
        assert_eq!(table.subscription_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn register_after_close_is_refused() {
        let table = CorrelationTable::new();
        table.close();
        assert!(matches!(
            table.register(id(1), None),
            Err(ClientError::ConnectionClosed)
        ));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn guard_removes_entries_on_drop() {
        let table = CorrelationTable::new();
        let callback: EventCallback = Arc::new(|_| {});
        let Ok(_rx) = table.register(id(3), Some(callback)) else {
            panic!("register failed");
        };
        drop(RequestGuard::new(&table, id(3), true));
        assert_eq!(table.pending_count(), 0);
        assert_eq!(table.subscription_count(), 0);
    }

    #[test]
    fn guard_can_keep_subscription() {
        let table = CorrelationTable::new();
        let callback: EventCallback = Arc::new(|_| {});
        let Ok(_rx) = table.register(id(4), Some(callback)) else {
            panic!("register failed");
        };
        let mut guard = RequestGuard::new(&table, id(4), true);
        guard.keep_subscription();
        drop(guard);
        assert_eq!(table.pending_count(), 0);
        assert!(table.subscription(id(4)).is_some());
    }

    #[test]
    fn removed_slot_no_longer_delivers() {
        let table = CorrelationTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: EventCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let Ok(_rx) = table.register(id(6), Some(callback)) else {
            panic!("register failed");
        };
        // Slot looked up before removal, as the receive loop does.
        let Some(slot) = table.subscription(id(6)) else {
            panic!("subscription missing");
        };
        assert!(slot.deliver(json!(1)));
        assert!(table.remove_subscription(id(6)));
        assert!(!slot.deliver(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_waits_for_running_callback() {
        let table = Arc::new(CorrelationTable::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        let callback: EventCallback = Arc::new(move |_| {
            let _ = entered_tx.send(());
            if let Ok(rx) = release_rx.lock() {
                let _ = rx.recv();
            }
            done.fetch_add(1, Ordering::SeqCst);
        });
        let Ok(_rx) = table.register(id(8), Some(callback)) else {
            panic!("register failed");
        };
        let Some(slot) = table.subscription(id(8)) else {
            panic!("subscription missing");
        };

        let delivering = std::thread::spawn(move || slot.deliver(Value::Null));
        assert!(entered_rx.recv().is_ok());

        let remover = {
            let table = Arc::clone(&table);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                table.remove_subscription(id(8));
                finished.load(Ordering::SeqCst)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(release_tx.send(()).is_ok());

        let (Ok(delivered), Ok(seen_by_remover)) = (delivering.join(), remover.join()) else {
            panic!("worker thread panicked");
        };
        assert!(delivered);
        // The removal returned only after the callback completed.
        assert_eq!(seen_by_remover, 1);
    }

    #[test]
    fn concurrent_fulfill_and_remove_deliver_at_most_once() {
        for round in 0..200 {
            let table = Arc::new(CorrelationTable::new());
            let mut rx = register(&table, round);

            let fulfiller = {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.fulfill(id(round), Ok(json!(round))))
            };
            let remover = {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.remove_pending(id(round)))
            };

            let (Ok(fulfilled), Ok(removed)) = (fulfiller.join(), remover.join()) else {
                panic!("worker thread panicked");
            };
            // Exactly one side wins the entry.
            assert_ne!(fulfilled, removed);
            assert_eq!(rx.try_recv().is_ok(), fulfilled);
        }
    }
}
