//! Fixed-capacity message buffers.
//!
//! A [`Message`] is a move-only handle to one pooled byte region. It carries a
//! write length (bytes filled so far) and a read cursor (bytes consumed so
//! far). Capacity is decided by the owning [`MessagePool`](crate::pool::MessagePool)
//! and never changes.
//!
//! Because the handle is not `Clone`, a buffer can only be in one place at a
//! time: the pool, a link's current slot, a queue, or the application.

use bytes::{Bytes, BytesMut};
use std::fmt;

/// A pooled, fixed-capacity byte buffer.
///
/// # Examples
///
/// ```
/// use pollnet_core::pool::MessagePool;
///
/// let pool = MessagePool::new(1, 16);
/// let mut msg = pool.acquire().unwrap();
/// assert!(msg.write(b"ping"));
/// assert_eq!(msg.as_slice(), b"ping");
/// assert_eq!(msg.remaining(), 12);
/// pool.release(msg);
/// ```
pub struct Message {
    data: BytesMut,
    len: usize,
    read: usize,
    /// Id of the pool that allocated this buffer; 0 when unpooled
    origin: u64,
}

impl Message {
    #[cfg(test)]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self::pooled(capacity, 0)
    }

    pub(crate) fn pooled(capacity: usize, origin: u64) -> Self {
        Self {
            data: BytesMut::zeroed(capacity),
            len: 0,
            read: 0,
            origin,
        }
    }

    pub(crate) const fn origin(&self) -> u64 {
        self.origin
    }

    /// Fixed size of the underlying region.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes written.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity not yet written.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Set the write length, clamped to capacity. Moves the read cursor back
    /// if it would otherwise point past the end.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
        self.read = self.read.min(self.len);
    }

    /// Read cursor position.
    #[must_use]
    pub const fn read_pos(&self) -> usize {
        self.read
    }

    pub fn set_read_pos(&mut self, pos: usize) {
        self.read = pos.min(self.len);
    }

    /// Advance the read cursor, e.g. after a partial socket write.
    pub fn advance_read(&mut self, n: usize) {
        self.set_read_pos(self.read.saturating_add(n));
    }

    /// Written bytes not yet consumed by the read cursor.
    #[must_use]
    pub const fn remaining_read(&self) -> usize {
        self.len - self.read
    }

    /// All written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Mutable view of all written bytes (for stamping header fields).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Written bytes from the read cursor on.
    #[must_use]
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read..self.len]
    }

    /// The unwritten tail of the buffer. Commit with [`Message::set_len`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Append `bytes`. Returns false (and writes nothing) if they don't fit.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        let end = self.len + bytes.len();
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        true
    }

    /// Copy the written bytes out so they outlive the buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }

    /// Forget contents. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.len = 0;
        self.read = 0;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("read", &self.read)
            .finish()
    }
}
