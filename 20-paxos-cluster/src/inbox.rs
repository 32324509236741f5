//! Bounded, ordered queue of incoming protocol messages.
//!
//! The peer listener pushes, the election and consensus engines pop. Pushing
//! never blocks: when the queue is full the message is dropped, exactly like
//! a message lost on the wire. Popping blocks until a message arrives, the
//! optional deadline passes, or the inbox is closed on shutdown.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::message::Message;

pub const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    #[error("timed out waiting for a message")]
    TimedOut,
    #[error("inbox closed")]
    Closed,
}

struct Queue {
    messages: VecDeque<Message>,
    closed: bool,
}

pub struct Inbox {
    queue: Mutex<Queue>,
    available: Condvar,
    capacity: usize,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                messages: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues a message; returns `false` if it was dropped because the
    /// queue is full or closed.
    pub fn push(&self, message: Message) -> bool {
        let mut queue = self.lock();
        if queue.closed || queue.messages.len() >= self.capacity {
            return false;
        }
        queue.messages.push_back(message);
        drop(queue);
        self.available.notify_one();
        true
    }

    /// Puts messages that were popped but not consumed back at the head of
    /// the queue, preserving their order.
    ///
    /// Restored messages may push the queue above capacity for a moment;
    /// they already counted against it once.
    pub fn restore_front(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut queue = self.lock();
        if queue.closed {
            return;
        }
        for message in messages.into_iter().rev() {
            queue.messages.push_front(message);
        }
        drop(queue);
        self.available.notify_all();
    }

    /// Blocks until a message is available.
    pub fn pop(&self) -> Result<Message, PopError> {
        let mut queue = self.lock();
        loop {
            if let Some(message) = queue.messages.pop_front() {
                return Ok(message);
            }
            if queue.closed {
                return Err(PopError::Closed);
            }
            queue = self
                .available
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<Message, PopError> {
        self.pop_until(Instant::now() + timeout)
    }

    /// Blocks until a message is available or `deadline` passes.
    pub fn pop_until(&self, deadline: Instant) -> Result<Message, PopError> {
        let mut queue = self.lock();
        loop {
            if let Some(message) = queue.messages.pop_front() {
                return Ok(message);
            }
            if queue.closed {
                return Err(PopError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PopError::TimedOut);
            }
            queue = self
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drops pending messages and wakes every blocked reader.
    pub fn close(&self) {
        let mut queue = self.lock();
        queue.closed = true;
        queue.messages.clear();
        drop(queue);
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
