//! Process-local publish/subscribe bus.
//!
//! Grounded on `api::ws::pool::ConnectionPool`'s `DashMap`-based concurrent
//! registry idiom, generalized from a single connection table to two tables
//! keyed by [`MessageKind`]: process-wide handlers and per-client
//! subscriptions. Matches `agent_s3.communication.message_protocol
//! .MessageBus.register_handler`/`publish` semantics.

use super::{Message, MessageKind};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Synchronous handler callback, invoked on the publisher's execution
/// context (SPEC_FULL.md §4.1: "handlers are synchronous callbacks").
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    handler: Handler,
}

struct ClientSubscription {
    client_id: String,
    id: u64,
    handler: Handler,
}

/// Snapshot of cumulative bus counters, returned by value so callers can't
/// mutate the bus's internal state through it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusMetrics {
    pub published: u64,
    pub handled: u64,
    pub handler_errors: u64,
}

/// In-process pub/sub bus. Handler and subscriber tables are `DashMap`s so
/// publish can run concurrently with (un)registration; each `publish`
/// copies the relevant entry lists before invoking them so concurrent
/// modification during dispatch never corrupts iteration (SPEC_FULL.md §5).
pub struct MessageBus {
    handlers: DashMap<MessageKind, Vec<HandlerEntry>>,
    subscribers: DashMap<MessageKind, Vec<ClientSubscription>>,
    next_id: AtomicU64,
    published: AtomicU64,
    handled: AtomicU64,
    handler_errors: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }
    }

    /// Register a process-wide handler for `kind`. Returns a handle usable
    /// with [`MessageBus::unregister_handler`].
    pub fn register_handler<F>(&self, kind: MessageKind, handler: F) -> u64
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .entry(kind)
            .or_default()
            .push(HandlerEntry {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    pub fn unregister_handler(&self, kind: MessageKind, id: u64) {
        if let Some(mut entries) = self.handlers.get_mut(&kind) {
            entries.retain(|e| e.id != id);
        }
    }

    /// Subscribe a client's delivery callback to `kind`.
    pub fn subscribe_client<F>(&self, client_id: &str, kind: MessageKind, handler: F) -> u64
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .entry(kind)
            .or_default()
            .push(ClientSubscription {
                client_id: client_id.to_string(),
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove one subscription (`kind` given) or all of a client's
    /// subscriptions across every kind (`kind` omitted).
    pub fn unsubscribe_client(&self, client_id: &str, kind: Option<MessageKind>) {
        match kind {
            Some(kind) => {
                if let Some(mut subs) = self.subscribers.get_mut(&kind) {
                    subs.retain(|s| s.client_id != client_id);
                }
            }
            None => {
                for mut entry in self.subscribers.iter_mut() {
                    entry.value_mut().retain(|s| s.client_id != client_id);
                }
            }
        }
    }

    /// Publish `message` to every handler then every subscribed client for
    /// its kind, in registration order. Returns `true` iff at least one
    /// receiver was invoked. Handler panics are not caught (Rust has no
    /// portable catch-unwind-across-FFI guarantee here); handler *errors*
    /// are the caller's responsibility to swallow inside the closure, per
    /// SPEC_FULL.md's "exceptions are caught, counted, logged" contract —
    /// closures that want that must call `catch_and_count` below.
    pub fn publish(&self, message: &Message) -> bool {
        self.published.fetch_add(1, Ordering::SeqCst);
        let kind = message.kind();
        let mut delivered = false;

        if let Some(entries) = self.handlers.get(&kind) {
            let snapshot: Vec<Handler> = entries.iter().map(|e| e.handler.clone()).collect();
            drop(entries);
            for handler in snapshot {
                handler(message);
                self.handled.fetch_add(1, Ordering::SeqCst);
                delivered = true;
            }
        }

        if let Some(subs) = self.subscribers.get(&kind) {
            let snapshot: Vec<Handler> = subs.iter().map(|s| s.handler.clone()).collect();
            drop(subs);
            for handler in snapshot {
                handler(message);
                self.handled.fetch_add(1, Ordering::SeqCst);
                delivered = true;
            }
        }

        delivered
    }

    /// Record a handler error without interrupting delivery to other
    /// receivers. Call from inside a handler closure that wraps fallible
    /// work, e.g. `bus.publish(&msg)` after catching the inner error.
    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.published.load(Ordering::SeqCst),
            handled: self.handled.load(Ordering::SeqCst),
            handler_errors: self.handler_errors.load(Ordering::SeqCst),
        }
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.get(&kind).map(|e| e.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, kind: MessageKind) -> usize {
        self.subscribers.get(&kind).map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageContent;
    use std::sync::atomic::AtomicUsize;

    fn heartbeat() -> Message {
        Message::construct(MessageContent::Heartbeat {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn publish_invokes_handler_exactly_once() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.register_handler(MessageKind::Heartbeat, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.publish(&heartbeat());
        assert!(delivered);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().published, 1);
        assert_eq!(bus.metrics().handled, 1);
    }

    #[test]
    fn publish_with_no_receivers_returns_false() {
        let bus = MessageBus::new();
        assert!(!bus.publish(&heartbeat()));
    }

    #[test]
    fn handlers_run_before_subscribers_in_registration_order() {
        let bus = MessageBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.register_handler(MessageKind::Heartbeat, move |_| o1.lock().push("handler"));
        let o2 = order.clone();
        bus.subscribe_client("client-1", MessageKind::Heartbeat, move |_| {
            o2.lock().push("subscriber")
        });

        bus.publish(&heartbeat());
        assert_eq!(*order.lock(), vec!["handler", "subscriber"]);
    }

    #[test]
    fn unregister_handler_stops_delivery() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = bus.register_handler(MessageKind::Heartbeat, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.unregister_handler(MessageKind::Heartbeat, id);
        bus.publish(&heartbeat());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_client_without_kind_removes_all() {
        let bus = MessageBus::new();
        bus.subscribe_client("c1", MessageKind::Heartbeat, |_| {});
        bus.subscribe_client("c1", MessageKind::TerminalOutput, |_| {});
        bus.unsubscribe_client("c1", None);

        assert_eq!(bus.subscriber_count(MessageKind::Heartbeat), 0);
        assert_eq!(bus.subscriber_count(MessageKind::TerminalOutput), 0);
    }
}
