//! Bounded FIFO of client-origin messages captured while the child is
//! unavailable during a restart.

use std::collections::VecDeque;

use tracing::warn;

use crate::message::Message;

/// Buffers client messages during `Draining`/`Killing`/`Spawning`/`Replaying`
/// so they can be replayed to the new child in arrival order. Bounded by
/// `capacity`; on overflow the oldest non-`initialize` message is dropped.
/// The cached `initialize` is never dropped by the overflow policy (it can
/// still be evicted deliberately via [`MessageBuffer::take_initialize`]).
#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    queue: VecDeque<Message>,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Push a message onto the back of the buffer, applying the overflow policy.
    pub fn push(&mut self, message: Message) {
        if self.queue.len() >= self.capacity {
            self.evict_oldest_non_init();
        }
        self.queue.push_back(message);
    }

    /// Requeue a message at the front (used when a write to the old child failed
    /// mid-flight and must be retried against the new child first).
    pub fn push_front(&mut self, message: Message) {
        self.queue.push_front(message);
    }

    fn evict_oldest_non_init(&mut self) {
        if let Some(pos) = self.queue.iter().position(|m| !m.is_initialize()) {
            self.queue.remove(pos);
            warn!("message buffer full, dropped oldest non-initialize message");
        } else {
            warn!("message buffer full and holds only initialize messages; not dropping");
        }
    }

    /// Remove and return any buffered `initialize` message, leaving the rest
    /// of the queue order intact. Used by the replay step so a client-sent
    /// `initialize` received during the restart window never duplicates the
    /// stored-session replay (§4.6 "Replaying").
    pub fn take_initialize(&mut self) -> Option<Message> {
        let pos = self.queue.iter().position(|m| m.is_initialize())?;
        self.queue.remove(pos)
    }

    /// Drain all buffered messages in FIFO order.
    pub fn drain(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(method: &str) -> Message {
        Message::from_value(serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": method}))
    }

    #[test]
    fn fifo_order_preserved() {
        let mut buf = MessageBuffer::new(10);
        buf.push(msg("a"));
        buf.push(msg("b"));
        let drained = buf.drain();
        assert_eq!(drained[0].method(), Some("a"));
        assert_eq!(drained[1].method(), Some("b"));
    }

    #[test]
    fn overflow_drops_oldest_non_init() {
        let mut buf = MessageBuffer::new(2);
        buf.push(msg("initialize"));
        buf.push(msg("a"));
        buf.push(msg("b")); // should evict "a", not "initialize"
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].method(), Some("initialize"));
        assert_eq!(drained[1].method(), Some("b"));
    }

    #[test]
    fn take_initialize_removes_without_disturbing_order() {
        let mut buf = MessageBuffer::new(10);
        buf.push(msg("a"));
        buf.push(msg("initialize"));
        buf.push(msg("b"));
        let init = buf.take_initialize();
        assert!(init.is_some());
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].method(), Some("a"));
        assert_eq!(drained[1].method(), Some("b"));
    }

    #[test]
    fn never_drops_init_even_when_buffer_is_only_inits() {
        let mut buf = MessageBuffer::new(1);
        buf.push(msg("initialize"));
        buf.push(msg("initialize"));
        assert_eq!(buf.len(), 2);
    }
}
