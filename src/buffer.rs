//! Bounded ring buffer for inbound messages.
//!
//! The transport worker pushes every received publish here; any number of
//! consumers read snapshots without blocking the receive path. Capacity is
//! fixed at construction and the oldest entry is evicted when full.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::message::InboundMessage;

/// Thread-safe, fixed-capacity buffer of the most recent inbound messages.
///
/// Clones share the same underlying buffer.
#[derive(Debug, Clone)]
pub struct InboundBuffer {
    inner: Arc<Mutex<VecDeque<InboundMessage>>>,
    capacity: usize,
}

impl InboundBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        InboundBuffer {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<InboundMessage>> {
        // A poisoned lock only means a reader panicked mid-clone; the
        // queue itself is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message, evicting the oldest entry when at capacity.
    pub fn push(&self, message: InboundMessage) {
        let mut queue = self.lock();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(message);
    }

    /// The `k` most recently received messages, oldest first.
    ///
    /// Non-destructive; returns fewer than `k` entries when the buffer
    /// holds fewer.
    pub fn peek_recent(&self, k: usize) -> Vec<InboundMessage> {
        let queue = self.lock();
        let skip = queue.len().saturating_sub(k);
        queue.iter().skip(skip).cloned().collect()
    }

    /// Remove and return everything buffered, oldest first.
    pub fn take_all(&self) -> Vec<InboundMessage> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> InboundMessage {
        InboundMessage::new("home/sensors", format!("m{n}").into_bytes())
    }

    #[test]
    fn keeps_only_the_most_recent_messages() {
        let buffer = InboundBuffer::new(10);
        for n in 1..=12 {
            buffer.push(msg(n));
        }

        assert_eq!(buffer.len(), 10);
        let recent = buffer.peek_recent(10);
        let texts: Vec<String> = recent.iter().map(|m| m.text()).collect();
        let expected: Vec<String> = (3..=12).map(|n| format!("m{n}")).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn peek_recent_returns_last_k_in_receipt_order() {
        let buffer = InboundBuffer::new(5);
        for n in 1..=4 {
            buffer.push(msg(n));
        }

        let recent = buffer.peek_recent(2);
        let texts: Vec<String> = recent.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);

        // Asking for more than is buffered returns everything.
        assert_eq!(buffer.peek_recent(100).len(), 4);
        // Peeking does not consume.
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn take_all_drains_the_buffer() {
        let buffer = InboundBuffer::new(3);
        buffer.push(msg(1));
        buffer.push(msg(2));

        let drained = buffer.take_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].text(), "m1");
        assert!(buffer.is_empty());
        assert!(buffer.take_all().is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buffer = InboundBuffer::new(0);
        buffer.push(msg(1));
        buffer.push(msg(2));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.peek_recent(1)[0].text(), "m2");
    }

    #[test]
    fn clones_share_the_same_buffer() {
        let buffer = InboundBuffer::new(4);
        let producer = buffer.clone();

        let handle = std::thread::spawn(move || {
            for n in 1..=4 {
                producer.push(msg(n));
            }
        });
        handle.join().expect("producer thread");

        assert_eq!(buffer.len(), 4);
    }
}
