//! Optional coalescing of several outbound messages for one client into a
//! single `batch` envelope (SPEC_FULL.md §4.2: "Batching is an
//! optimization, not a mandatory path... must preserve per-client ordering
//! and the original message ids").
//!
//! Generalizes `api::ws::batching::{EventBatch, ClientBatcher,
//! BatchingManager}` from `RealtimeEvent` to [`crate::message::Message`];
//! the size/time flush-trigger shape is unchanged.

use crate::message::{Message, MessageContent};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Per-client accumulator. `add` returns a finished batch once `max_size`
/// is reached; callers should also poll [`Self::should_flush`] on a timer
/// for time-triggered flushes of a partially-filled batch.
pub struct ClientBatcher {
    pending: Vec<Message>,
    last_flush: Instant,
    max_size: usize,
    flush_interval: Duration,
}

impl ClientBatcher {
    pub fn new(max_size: usize, flush_interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            last_flush: Instant::now(),
            max_size,
            flush_interval,
        }
    }

    /// Buffer `message`. Returns `Some(batch)` if adding it reached
    /// `max_size`, in which case the accumulator is reset.
    pub fn add(&mut self, message: Message) -> Option<Message> {
        self.pending.push(message);
        if self.pending.len() >= self.max_size {
            self.flush()
        } else {
            None
        }
    }

    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty() && self.last_flush.elapsed() >= self.flush_interval
    }

    /// Drain whatever is pending into a single `batch` message, preserving
    /// order and original ids. Returns `None` if nothing was pending.
    pub fn flush(&mut self) -> Option<Message> {
        if self.pending.is_empty() {
            return None;
        }
        let messages = std::mem::take(&mut self.pending);
        self.last_flush = Instant::now();
        Message::construct(MessageContent::Batch { messages }).ok()
    }
}

/// Per-client registry of [`ClientBatcher`]s.
pub struct BatchingManager {
    batchers: DashMap<String, ClientBatcher>,
    max_size: usize,
    flush_interval: Duration,
}

impl BatchingManager {
    pub fn new(max_size: usize, flush_interval: Duration) -> Self {
        Self {
            batchers: DashMap::new(),
            max_size,
            flush_interval,
        }
    }

    pub fn add(&self, client_id: &str, message: Message) -> Option<Message> {
        let mut batcher = self
            .batchers
            .entry(client_id.to_string())
            .or_insert_with(|| ClientBatcher::new(self.max_size, self.flush_interval));
        batcher.add(message)
    }

    /// Clients whose batcher has pending messages past the flush interval.
    pub fn clients_needing_flush(&self) -> Vec<String> {
        self.batchers
            .iter()
            .filter(|e| e.value().should_flush())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn flush(&self, client_id: &str) -> Option<Message> {
        self.batchers.get_mut(client_id).and_then(|mut b| b.flush())
    }

    pub fn remove(&self, client_id: &str) {
        self.batchers.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn terminal(text: &str) -> Message {
        Message::construct(MessageContent::TerminalOutput {
            text: text.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn flush_triggers_at_max_size_preserving_order() {
        let manager = BatchingManager::new(2, Duration::from_secs(10));
        assert!(manager.add("c1", terminal("a")).is_none());
        let batch = manager.add("c1", terminal("b")).unwrap();
        assert_eq!(batch.kind(), MessageKind::Batch);
        match batch.content {
            MessageContent::Batch { messages } => {
                assert_eq!(messages.len(), 2);
                match &messages[0].content {
                    MessageContent::TerminalOutput { text } => assert_eq!(text, "a"),
                    other => panic!("unexpected content: {other:?}"),
                }
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn time_flush_not_triggered_before_interval() {
        let manager = BatchingManager::new(10, Duration::from_secs(60));
        manager.add("c1", terminal("a"));
        assert!(manager.clients_needing_flush().is_empty());
    }
}
