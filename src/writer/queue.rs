//! Bounded handoff queue between collectors and the dispatcher.

use thiserror::Error;
use tokio::sync::mpsc;

use super::Message;

/// Errors returned by [`QueueSender::try_push`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    #[error("stats queue reached maximum capacity ({capacity})")]
    Full { capacity: usize },

    #[error("stats dispatcher is no longer receiving")]
    Closed,
}

/// Largest capacity the underlying channel supports.
pub const MAX_CAPACITY: usize = usize::MAX >> 3;

/// Creates a bounded FIFO queue holding at most `capacity` messages.
///
/// Panics if `capacity` is zero or above [`MAX_CAPACITY`].
pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx, capacity }, QueueReceiver { rx })
}

/// Producer side. Never blocks.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Message>,
    capacity: usize,
}

impl QueueSender {
    /// Enqueues `msg`, failing immediately when the queue is full.
    pub fn try_push(&self, msg: Message) -> Result<(), PushError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of messages currently waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer side, owned by the dispatcher thread.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Message>,
}

impl QueueReceiver {
    /// Blocks the calling thread until a message is available.
    ///
    /// Returns `None` once every sender is gone and the queue is drained.
    /// Must not be called from within an async runtime.
    pub fn pop(&mut self) -> Option<Message> {
        self.rx.blocking_recv()
    }
}
