//! Bounded per-shard record queue
//!
//! Producers offer serialized lines with a bounded wait; the flusher polls
//! them back out in FIFO order. Backed by a `crossbeam` array channel whose
//! slots are allocated up front, so memory stays bounded by the capacity.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};

/// Result of offering a line to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The line was enqueued
    Accepted,
    /// The queue stayed full for the whole wait; the line was discarded
    Dropped,
}

impl Admission {
    /// Check if the line was enqueued
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Bounded FIFO of serialized records
#[derive(Debug)]
pub struct ShardQueue {
    sender: Sender<String>,
    receiver: Receiver<String>,
    capacity: usize,
}

impl ShardQueue {
    /// Create a queue holding at most `capacity` lines
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Try to enqueue `line`, waiting at most `timeout` for space
    pub fn offer(&self, line: String, timeout: Duration) -> Admission {
        let result = if timeout.is_zero() {
            self.sender.try_send(line).map_err(|e| match e {
                TrySendError::Full(_) => SendTimeoutError::Timeout(()),
                TrySendError::Disconnected(_) => SendTimeoutError::Disconnected(()),
            })
        } else {
            self.sender.send_timeout(line, timeout).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendTimeoutError::Timeout(()),
                SendTimeoutError::Disconnected(_) => SendTimeoutError::Disconnected(()),
            })
        };

        match result {
            Ok(()) => Admission::Accepted,
            Err(SendTimeoutError::Timeout(())) => Admission::Dropped,
            Err(SendTimeoutError::Disconnected(())) => {
                // Both ends live in this struct, so this only happens while tearing down
                tracing::error!("shard queue disconnected while offering a record");
                Admission::Dropped
            }
        }
    }

    /// Take the oldest line, if any
    pub fn poll(&self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Number of lines waiting
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Check if no lines are waiting
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Maximum number of lines the queue holds
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = ShardQueue::new(8);

        for i in 0..5 {
            assert!(queue.offer(format!("line {}\n", i), Duration::from_micros(50)).is_accepted());
        }
        assert_eq!(queue.len(), 5);

        let drained: Vec<String> = std::iter::from_fn(|| queue.poll()).collect();
        assert_eq!(drained[0], "line 0\n");
        assert_eq!(drained[4], "line 4\n");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_drops_within_bound() {
        let queue = ShardQueue::new(1);
        assert_eq!(queue.offer("a\n".into(), Duration::ZERO), Admission::Accepted);

        let start = Instant::now();
        assert_eq!(queue.offer("b\n".into(), Duration::from_millis(5)), Admission::Dropped);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(5));
        assert!(waited < Duration::from_secs(1));

        assert_eq!(queue.offer("c\n".into(), Duration::ZERO), Admission::Dropped);
        assert_eq!(queue.poll().as_deref(), Some("a\n"));
        assert!(queue.poll().is_none());
        assert_eq!(queue.capacity(), 1);
    }
}
