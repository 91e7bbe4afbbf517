//! Bounded FIFO queue with backpressure.
//!
//! Grounded on `api::ws::backpressure`'s bounded-offline-queue idiom,
//! generalized to a standalone primitive usable by both the bus's
//! at-rest delivery path and any offline-client mailbox. Matches
//! SPEC_FULL.md §8's invariants: `dequeued <= enqueued - dropped`,
//! `max_depth <= capacity`, and `clear` preserves cumulative counters.

use super::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

/// Snapshot of cumulative queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub max_depth: u64,
}

struct Inner {
    items: VecDeque<Message>,
    capacity: usize,
}

/// Bounded, FIFO, multi-producer/multi-consumer queue. `enqueue` blocks up
/// to a caller-supplied timeout when full and drops (counting it) rather
/// than blocking forever; `dequeue` blocks until an item is available.
pub struct MessageQueue {
    inner: parking_lot::Mutex<Inner>,
    not_full: Notify,
    not_empty: Notify,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    max_depth: AtomicU64,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(64)),
                capacity,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            max_depth: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempt to enqueue `message`, waiting up to `wait` if the queue is
    /// full. Returns `true` on success, `false` (and increments `dropped`)
    /// if the queue was still full when `wait` elapsed.
    pub async fn enqueue(&self, message: Message, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.items.len() < inner.capacity {
                    inner.items.push_back(message);
                    let depth = inner.items.len() as u64;
                    drop(inner);
                    self.enqueued.fetch_add(1, Ordering::SeqCst);
                    self.max_depth.fetch_max(depth, Ordering::SeqCst);
                    self.not_empty.notify_one();
                    return true;
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return false;
            }

            let notified = self.not_full.notified();
            if timeout(remaining, notified).await.is_err() {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return false;
            }
        }
    }

    /// Try to enqueue without waiting; drops and returns `false` immediately
    /// if full.
    pub fn try_enqueue(&self, message: Message) -> bool {
        let mut inner = self.inner.lock();
        if inner.items.len() < inner.capacity {
            inner.items.push_back(message);
            let depth = inner.items.len() as u64;
            drop(inner);
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            self.max_depth.fetch_max(depth, Ordering::SeqCst);
            self.not_empty.notify_one();
            true
        } else {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    /// Block until a message is available, then return it.
    pub async fn dequeue(&self) -> Message {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(msg) = inner.items.pop_front() {
                    drop(inner);
                    self.dequeued.fetch_add(1, Ordering::SeqCst);
                    self.not_full.notify_one();
                    return msg;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Non-blocking dequeue; `None` if empty.
    pub fn try_dequeue(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        let msg = inner.items.pop_front();
        drop(inner);
        if msg.is_some() {
            self.dequeued.fetch_add(1, Ordering::SeqCst);
            self.not_full.notify_one();
        }
        msg
    }

    /// Drain all queued messages without touching cumulative counters.
    pub fn clear(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let drained: Vec<Message> = inner.items.drain(..).collect();
        drop(inner);
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            dequeued: self.dequeued.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            max_depth: self.max_depth.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageContent;
    use std::time::Duration;

    fn heartbeat() -> Message {
        Message::construct(MessageContent::Heartbeat {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips() {
        let q = MessageQueue::new(4);
        let msg = heartbeat();
        assert!(q.enqueue(msg.clone(), Duration::from_millis(10)).await);
        let out = q.dequeue().await;
        assert_eq!(out, msg);

        let m = q.metrics();
        assert_eq!(m.enqueued, 1);
        assert_eq!(m.dequeued, 1);
        assert_eq!(m.dropped, 0);
        assert_eq!(m.max_depth, 1);
    }

    #[tokio::test]
    async fn enqueue_drops_when_full_past_timeout() {
        let q = MessageQueue::new(1);
        assert!(q.try_enqueue(heartbeat()));
        let ok = q.enqueue(heartbeat(), Duration::from_millis(20)).await;
        assert!(!ok);
        assert_eq!(q.metrics().dropped, 1);
    }

    #[tokio::test]
    async fn clear_drains_without_resetting_counters() {
        let q = MessageQueue::new(4);
        q.try_enqueue(heartbeat());
        q.try_enqueue(heartbeat());
        let drained = q.clear();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
        assert_eq!(q.metrics().enqueued, 2);
        assert_eq!(q.metrics().dequeued, 0);
    }

    #[tokio::test]
    async fn max_depth_tracks_high_water_mark() {
        let q = MessageQueue::new(4);
        q.try_enqueue(heartbeat());
        q.try_enqueue(heartbeat());
        q.try_enqueue(heartbeat());
        let _ = q.try_dequeue();
        q.try_enqueue(heartbeat());
        assert_eq!(q.metrics().max_depth, 3);
    }

    #[tokio::test]
    async fn dequeue_waits_for_producer() {
        let q = std::sync::Arc::new(MessageQueue::new(4));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.dequeue().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        q.try_enqueue(heartbeat());

        let received = handle.await.unwrap();
        assert_eq!(received.kind(), crate::message::MessageKind::Heartbeat);
    }
}
