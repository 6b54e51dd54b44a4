//! Bounded FIFO of message handles.
//!
//! Push fails immediately when the queue is full and hands the buffer back to
//! the caller, who is then responsible for returning it to the pool. Nothing
//! here ever blocks.

use crate::message::Message;
use crate::pool::MessagePool;
use flume::{Receiver, Sender, TrySendError};

/// One direction of a link's message flow.
pub struct MessageQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    capacity: usize,
}

impl MessageQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Append at the back. On a full queue the message comes back as `Err`.
    pub fn push(&self, msg: Message) -> Result<(), Message> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(m) | TrySendError::Disconnected(m) => m,
        })
    }

    /// Take from the front.
    #[must_use]
    pub fn pop(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Move every queued message back into `pool`. Returns how many.
    pub fn drain_into(&self, pool: &MessagePool) -> usize {
        let mut n = 0;
        while let Some(msg) = self.pop() {
            pool.release(msg);
            n += 1;
        }
        n
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
