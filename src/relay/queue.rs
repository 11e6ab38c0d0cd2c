//! Outbound queue.
//!
//! Holds envelopes produced while the connection is not OPEN. The queue is
//! drained in FIFO order on every OPEN transition; a message whose
//! transmission fails mid-flush goes back to the front so ordering across
//! reconnects is preserved exactly.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::RelayError;

/// What to do when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new message; everything already queued keeps its place.
    #[default]
    RejectNew,
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Never refuse. Memory grows for as long as the outage lasts.
    Unbounded,
}

/// An envelope waiting for the connection to open.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// The envelope to transmit.
    pub envelope: Envelope,
    /// When it was first queued.
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    /// Wrap an envelope, stamping the enqueue time.
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            enqueued_at: Instant::now(),
        }
    }
}

/// FIFO buffer of not-yet-transmitted envelopes.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl OutboundQueue {
    /// Queue with the given bound and overflow behavior.
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            overflow,
        }
    }

    /// Append in send order.
    ///
    /// Returns the evicted message when [`OverflowPolicy::DropOldest`] had to
    /// make room, so the caller can fail any request waiting on it.
    pub fn push(&mut self, envelope: Envelope) -> Result<Option<QueuedMessage>, RelayError> {
        let mut evicted = None;
        if self.overflow != OverflowPolicy::Unbounded && self.items.len() >= self.capacity {
            match self.overflow {
                OverflowPolicy::RejectNew | OverflowPolicy::Unbounded => {
                    return Err(RelayError::QueueFull {
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    evicted = self.items.pop_front();
                    if evicted.is_none() {
                        // Zero capacity: nothing can ever be held.
                        return Err(RelayError::QueueFull {
                            capacity: self.capacity,
                        });
                    }
                }
            }
        }
        self.items.push_back(QueuedMessage::new(envelope));
        Ok(evicted)
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Put a message back at the head after a failed transmission.
    ///
    /// Ignores the bound: the message was already accepted once.
    pub fn requeue_front(&mut self, message: QueuedMessage) {
        self.items.push_front(message);
    }

    /// Take the head for transmission.
    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    /// Drop everything, returning what was queued.
    pub fn clear(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(n: u64) -> Envelope {
        Envelope::new("chat-message").with_field("n", n)
    }

    fn n_of(message: &QueuedMessage) -> u64 {
        message.envelope.field("n").and_then(serde_json::Value::as_u64).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(10, OverflowPolicy::RejectNew);
        for n in 1..=3 {
            queue.push(env(n)).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_front())
            .map(|m| n_of(&m))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_requeue_front_keeps_original_order() {
        let mut queue = OutboundQueue::new(10, OverflowPolicy::RejectNew);
        for n in 1..=5 {
            queue.push(env(n)).unwrap();
        }
        let _sent1 = queue.pop_front();
        let _sent2 = queue.pop_front();
        let failed = queue.pop_front().unwrap();
        queue.requeue_front(failed);
        queue.push(env(6)).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_front())
            .map(|m| n_of(&m))
            .collect();
        assert_eq!(order, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_reject_new_when_full() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::RejectNew);
        queue.push(env(1)).unwrap();
        queue.push(env(2)).unwrap();
        assert_eq!(
            queue.push(env(3)).unwrap_err(),
            RelayError::QueueFull { capacity: 2 }
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_oldest_evicts_head() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(env(1)).unwrap();
        queue.push(env(2)).unwrap();
        let evicted = queue.push(env(3)).unwrap().unwrap();
        assert_eq!(n_of(&evicted), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_unbounded_ignores_capacity() {
        let mut queue = OutboundQueue::new(1, OverflowPolicy::Unbounded);
        for n in 0..100 {
            assert!(queue.push(env(n)).unwrap().is_none());
        }
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn test_clear_empties_queue() {
        let mut queue = OutboundQueue::new(4, OverflowPolicy::RejectNew);
        queue.push(env(1)).unwrap();
        queue.push(env(2)).unwrap();
        assert_eq!(queue.clear().len(), 2);
        assert!(queue.is_empty());
    }
}
