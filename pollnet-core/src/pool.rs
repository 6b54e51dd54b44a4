//! Fixed-capacity buffer pool.
//!
//! Every [`Message`] is allocated up front. `acquire` and `release` never
//! block and never allocate; an exhausted pool simply returns `None`.
//!
//! The free list is a bounded `flume` channel, so the pool is cheap to clone
//! and safe to share between links, sessions and worker threads.

use crate::message::Message;
use flume::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Shared pool of reusable message buffers.
#[derive(Clone)]
pub struct MessagePool {
    free_tx: Sender<Message>,
    free_rx: Receiver<Message>,
    id: u64,
    capacity: usize,
    message_size: usize,
}

impl MessagePool {
    /// Pre-allocate `count` buffers of `message_size` bytes each.
    #[must_use]
    pub fn new(count: usize, message_size: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (free_tx, free_rx) = flume::bounded(count.max(1));
        for _ in 0..count {
            // Cannot fail: channel has room for exactly `count` items
            let _ = free_tx.try_send(Message::pooled(message_size, id));
        }
        Self {
            free_tx,
            free_rx,
            id,
            capacity: count,
            message_size,
        }
    }

    /// Take a cleared buffer, or `None` if all are in flight.
    #[must_use]
    pub fn acquire(&self) -> Option<Message> {
        let mut msg = self.free_rx.try_recv().ok()?;
        msg.clear();
        Some(msg)
    }

    /// Return a buffer to the free list.
    ///
    /// Only buffers this pool (or one of its clones) allocated are taken
    /// back. A foreign buffer is dropped and stays missing from its own pool.
    pub fn release(&self, msg: Message) {
        let foreign = msg.origin() != self.id;
        debug_assert!(!foreign, "buffer released into a foreign pool");
        if foreign {
            warn!(
                "[MessagePool] Dropping buffer of pool {} released into pool {}",
                msg.origin(),
                self.id
            );
            return;
        }
        match self.free_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("[MessagePool] Release on full pool, buffer dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Buffers currently available.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_rx.len()
    }

    /// Total buffers owned by this pool.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `msg` was allocated by this pool.
    #[must_use]
    pub const fn owns(&self, msg: &Message) -> bool {
        msg.origin() == self.id
    }

    /// Capacity of each buffer.
    #[must_use]
    pub const fn message_size(&self) -> usize {
        self.message_size
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .field("message_size", &self.message_size)
            .finish()
    }
}
