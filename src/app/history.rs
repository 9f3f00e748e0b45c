//! Caller-owned message history for one connection

use std::collections::VecDeque;

use crate::constants::DEFAULT_LOG_CAPACITY;
use crate::messages::{Direction, EventPayload, ManagerEvent, Message};

/// Bounded log of the messages seen on a connection, oldest first.
/// When full, the oldest entry is dropped.
#[derive(Clone, Debug)]
pub struct ConnectionLog {
    capacity: usize,
    messages: VecDeque<Message>,
}

impl Default for ConnectionLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl ConnectionLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ConnectionLog {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, message: Message) {
        if self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Append the message carried by `event`, if any
    pub fn record(&mut self, event: &ManagerEvent) -> bool {
        match &event.payload {
            EventPayload::Message(message) => {
                self.push(message.clone());
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Messages travelling one way
    pub fn by_direction(&self, direction: Direction) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.direction == direction)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
