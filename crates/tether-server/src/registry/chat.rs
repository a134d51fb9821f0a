//! Bounded chat buffer for a live session.
//!
//! Holds messages until the orchestrator persists them. When full, the
//! oldest message is evicted so a stalled persistence path cannot grow
//! memory without bound.

use super::record::ActiveSessionChatMessage;
use std::collections::VecDeque;

/// Maximum chat messages held per session.
pub const CHAT_BUFFER_CAPACITY: usize = 100;

/// A fixed-capacity FIFO of chat messages.
#[derive(Debug, Clone)]
pub struct ChatBuffer {
    messages: VecDeque<ActiveSessionChatMessage>,
    capacity: usize,
    /// Messages dropped because the buffer was full.
    evicted: u64,
}

impl ChatBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Append a message, evicting the oldest if full.
    ///
    /// Returns the evicted message, if any.
    pub fn push(&mut self, message: ActiveSessionChatMessage) -> Option<ActiveSessionChatMessage> {
        if self.capacity == 0 {
            self.evicted += 1;
            return Some(message);
        }
        let dropped = if self.messages.len() >= self.capacity {
            self.evicted += 1;
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        dropped
    }

    /// Remove and return every buffered message in append order.
    pub fn drain(&mut self) -> Vec<ActiveSessionChatMessage> {
        self.messages.drain(..).collect()
    }

    /// Remove a single message by id. Returns whether it was present.
    pub fn ack(&mut self, message_id: &str) -> bool {
        match self.messages.iter().position(|m| m.id == message_id) {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveSessionChatMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for ChatBuffer {
    fn default() -> Self {
        Self::new(CHAT_BUFFER_CAPACITY)
    }
}
