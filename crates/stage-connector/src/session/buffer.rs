//! Bounded queue for messages sent while the session is not active

use std::collections::VecDeque;

use stage_protocol::Message;

/// FIFO of pending outbound messages. When full, the oldest entry makes room
/// for the newest.
#[derive(Debug)]
pub struct SendBuffer {
    queue: VecDeque<Message>,
    capacity: usize,
}

impl SendBuffer {
    /// A buffer holding at most `capacity` messages; 0 disables buffering
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Whether messages are buffered at all
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a message. Returns the message that was evicted to make room,
    /// or the message itself when buffering is disabled.
    pub fn push(&mut self, message: Message) -> Option<Message> {
        if !self.is_enabled() {
            return Some(message);
        }
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(message);
        evicted
    }

    /// Remove and return everything, oldest first
    pub fn drain(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }
}
