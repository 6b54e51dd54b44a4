//! Link: one socket plus its buffered send and receive state machines.
//!
//! A link owns a transport, two bounded queues (inbound, outbound) and a
//! handle to a shared [`MessagePool`]. It holds at most one partially sent
//! outbound buffer and at most one partially received inbound buffer, so
//! `send` and `receive` can stop at any byte boundary and resume on the next
//! readiness signal.
//!
//! Everything the link cannot decide on its own is delegated: framing
//! questions go to its [`Framing`], faults and protocol checks go to a
//! [`LinkCallback`] supplied per call.
//!
//! Locking: the send path and the receive path each have their own lock
//! (around the current buffer of that direction) and hold a read guard on
//! the socket while they run. [`Link::close`] takes both path locks, receive
//! first, then the socket for writing.

use crate::config::LinkConfig;
use crate::framing::{Framing, RawSegment};
use parking_lot::{Mutex, RwLock};
use pollnet_core::clock::{AtomicTimestamp, Timestamp};
use pollnet_core::error::{is_shutdown, is_would_block, ConnectError};
use pollnet_core::message::Message;
use pollnet_core::options::SocketOptions;
use pollnet_core::poll::{Interest, Readiness};
use pollnet_core::pool::MessagePool;
use pollnet_core::queue::MessageQueue;
use pollnet_core::socket::{TcpListener, TcpSocket, Transport};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Notifications and protocol checks raised by [`Link::send`] and
/// [`Link::receive`].
///
/// Every method has a no-op default, so implementors override only what
/// they need. The fault callbacks marked fatal are followed by the link
/// stopping the current call; deciding to disconnect is up to the
/// implementor.
#[allow(unused_variables)]
pub trait LinkCallback {
    /// The framing rejected an outbound message. It is released next.
    fn on_send_check_tcp_failed(&self, msg: &mut Message) {}

    /// Called once per outbound message, right before its first byte is
    /// written. Stamp length, checksum or sequence fields here.
    fn on_send_finalize_tcp(&self, msg: &mut Message) {}

    /// `n` bytes reached the socket.
    fn on_send_data_transmitted(&self, n: usize) {}

    /// The socket stopped accepting bytes. Poll for writability and call
    /// `send` again.
    fn on_send_blocked(&self) {}

    /// Fatal write error. The current outbound buffer was released.
    fn on_send_error(&self) {}

    /// Integrity check on a complete inbound message. Returning false fires
    /// [`LinkCallback::on_recv_error_crc`].
    fn on_recv_check_tcp(&self, msg: &mut Message) -> bool {
        true
    }

    /// Last look before a message is queued. Returning false discards it
    /// without closing the connection.
    fn on_recv_handle_tcp(&self, msg: &mut Message) -> bool {
        true
    }

    /// A message was pushed onto the inbound queue.
    fn on_recv_new_message(&self) {}

    /// Peer closed the connection (zero-length read).
    fn on_recv_regular_disconnect(&self) {}

    /// Fatal: the pool had no buffer for incoming data.
    fn on_recv_error_no_free_tcp_buffer(&self) {}

    /// Fatal: the framing rejected a complete header.
    fn on_recv_error_length_mismatch(&self) {}

    /// Fatal: the message would not fit into one buffer.
    fn on_recv_error_tcp_msg_oversized(&self) {}

    /// Fatal: OS-level read error.
    fn on_recv_error_socket(&self) {}

    /// Fatal: the inbound queue is full.
    fn on_recv_error_tcp_in_queue_full(&self) {}

    /// Fatal: [`LinkCallback::on_recv_check_tcp`] failed.
    fn on_recv_error_crc(&self) {}

    /// Fatal: the framing reported an incomplete message with nothing
    /// missing.
    fn on_recv_error_length(&self) {}
}

/// Callback that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCallback;

impl LinkCallback for NoCallback {}

/// Point-in-time copy of a link's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub started: Timestamp,
    pub last_receive: Timestamp,
    pub last_send: Timestamp,
}

/// Buffered, partial-I/O-aware connection engine.
pub struct Link<F: Framing = RawSegment, S: Transport = TcpSocket> {
    framing: F,
    socket: RwLock<S>,
    pool: MessagePool,
    inbound: MessageQueue,
    outbound: MessageQueue,
    /// Receive path lock
    current_in: Mutex<Option<Message>>,
    /// Send path lock
    current_out: Mutex<Option<Message>>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    started: AtomicTimestamp,
    last_receive: AtomicTimestamp,
    last_send: AtomicTimestamp,
    closing: AtomicBool,
    send_blocked: AtomicBool,
}

impl<F: Framing, S: Transport> Link<F, S> {
    pub fn new(framing: F, socket: S, pool: MessagePool, queue_in: usize, queue_out: usize) -> Self {
        Self {
            framing,
            socket: RwLock::new(socket),
            pool,
            inbound: MessageQueue::new(queue_in),
            outbound: MessageQueue::new(queue_out),
            current_in: Mutex::new(None),
            current_out: Mutex::new(None),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            started: AtomicTimestamp::new(),
            last_receive: AtomicTimestamp::new(),
            last_send: AtomicTimestamp::new(),
            closing: AtomicBool::new(false),
            send_blocked: AtomicBool::new(false),
        }
    }

    /// Link with queue sizes taken from `config`. The pool is passed in
    /// because it is usually shared.
    pub fn with_config(framing: F, socket: S, pool: MessagePool, config: &LinkConfig) -> Self {
        Self::new(framing, socket, pool, config.queue_in, config.queue_out)
    }

    /// Write queued messages until the queue is empty or the socket pushes
    /// back.
    pub fn send<C: LinkCallback + ?Sized>(&self, cb: &C) {
        let mut current = self.current_out.lock();
        let socket = self.socket.read();

        loop {
            let mut msg = match current.take() {
                Some(msg) => msg,
                None => {
                    let Some(mut msg) = self.outbound.pop() else {
                        return;
                    };
                    msg.set_read_pos(0);
                    if !self.framing.on_send_check(&msg) {
                        cb.on_send_check_tcp_failed(&mut msg);
                        self.pool.release(msg);
                        continue;
                    }
                    cb.on_send_finalize_tcp(&mut msg);
                    msg
                }
            };

            if msg.remaining_read() == 0 {
                self.pool.release(msg);
                continue;
            }

            match socket.send(msg.unread()) {
                Ok(0) => {
                    *current = Some(msg);
                    return;
                }
                Ok(n) => {
                    self.send_blocked.store(false, Ordering::Release);
                    msg.advance_read(n);
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    self.last_send.touch();
                    *current = Some(msg);
                    cb.on_send_data_transmitted(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    *current = Some(msg);
                }
                Err(e) if is_would_block(&e) => {
                    *current = Some(msg);
                    self.send_blocked.store(true, Ordering::Release);
                    cb.on_send_blocked();
                    return;
                }
                Err(e) => {
                    trace!("[Link] Send failed: {}", e);
                    self.pool.release(msg);
                    cb.on_send_error();
                    return;
                }
            }
        }
    }

    /// Read from the socket until it would block, queueing every complete
    /// message.
    pub fn receive<C: LinkCallback + ?Sized>(&self, cb: &C) {
        let mut current = self.current_in.lock();
        let socket = self.socket.read();

        loop {
            let mut msg = match current.take() {
                Some(msg) => msg,
                None => match self.pool.acquire() {
                    Some(msg) => msg,
                    None => {
                        cb.on_recv_error_no_free_tcp_buffer();
                        return;
                    }
                },
            };

            if !self.framing.is_message_complete(&msg) {
                let missing = self.framing.missing_length(&msg);
                if missing == 0 {
                    cb.on_recv_error_length();
                    self.pool.release(msg);
                    return;
                }
                if missing > msg.remaining() {
                    cb.on_recv_error_tcp_msg_oversized();
                    self.pool.release(msg);
                    return;
                }

                match socket.recv(&mut msg.spare_mut()[..missing]) {
                    Ok(0) => {
                        cb.on_recv_regular_disconnect();
                        self.pool.release(msg);
                        return;
                    }
                    Ok(n) => {
                        msg.set_len(msg.len() + n);
                        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                        self.last_receive.touch();
                        if self.framing.is_header_complete(&msg) && !self.framing.is_header_ok(&msg) {
                            cb.on_recv_error_length_mismatch();
                            self.pool.release(msg);
                            return;
                        }
                        *current = Some(msg);
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        *current = Some(msg);
                        continue;
                    }
                    Err(e) if is_would_block(&e) || is_shutdown(&e) => {
                        *current = Some(msg);
                        return;
                    }
                    Err(e) => {
                        trace!("[Link] Receive failed: {}", e);
                        cb.on_recv_error_socket();
                        self.pool.release(msg);
                        return;
                    }
                }
            }

            msg.set_read_pos(0);
            if !cb.on_recv_check_tcp(&mut msg) {
                cb.on_recv_error_crc();
                self.pool.release(msg);
                return;
            }
            if !cb.on_recv_handle_tcp(&mut msg) {
                self.pool.release(msg);
                continue;
            }
            msg.set_read_pos(0);

            match self.inbound.push(msg) {
                Ok(()) => cb.on_recv_new_message(),
                Err(msg) => {
                    cb.on_recv_error_tcp_in_queue_full();
                    self.pool.release(msg);
                    return;
                }
            }
        }
    }

    /// Queue a message for sending. A full queue hands it back.
    pub fn enqueue(&self, msg: Message) -> Result<(), Message> {
        self.outbound.push(msg)
    }

    /// Next received message, if any.
    #[must_use]
    pub fn dequeue(&self) -> Option<Message> {
        self.inbound.pop()
    }

    /// Mark closing and half-close the socket. In-flight calls finish, later
    /// reads see end-of-stream.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        // May run from a callback inside send/receive, which hold a read guard
        self.socket.read_recursive().shutdown();
    }

    /// Close the socket and return the link to its freshly constructed
    /// state: queues and current buffers go back to the pool, counters and
    /// timestamps are reset.
    pub fn close(&self) {
        let mut current_in = self.current_in.lock();
        let mut current_out = self.current_out.lock();

        if !self.closing.load(Ordering::Acquire) {
            self.socket.read().shutdown();
        }
        self.socket.write().close();

        if let Some(msg) = current_in.take() {
            self.pool.release(msg);
        }
        if let Some(msg) = current_out.take() {
            self.pool.release(msg);
        }
        self.inbound.drain_into(&self.pool);
        self.outbound.drain_into(&self.pool);

        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.started.reset();
        self.last_receive.reset();
        self.last_send.reset();
        self.closing.store(false, Ordering::Release);
        self.send_blocked.store(false, Ordering::Release);
    }

    /// Readiness check on this link's socket. Reported writability clears
    /// the send-blocked flag.
    pub fn poll(&self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let ready = self.socket.read().poll(interest, timeout)?;
        if ready.is_writable() {
            self.send_blocked.store(false, Ordering::Release);
        }
        Ok(ready)
    }

    /// Stamp start and activity times with "now" for a fresh connection.
    pub(crate) fn mark_connected(&self) {
        let now = Timestamp::now();
        self.started.store(now);
        self.last_receive.store(now);
        self.last_send.store(now);
    }

    #[must_use]
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            bytes_received: self.bytes_received(),
            bytes_sent: self.bytes_sent(),
            started: self.started.load(),
            last_receive: self.last_receive.load(),
            last_send: self.last_send.load(),
        }
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// How long the current connection has been up.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.started.load().elapsed()
    }

    /// Time since bytes were last received.
    #[must_use]
    pub fn receive_idle(&self) -> Option<Duration> {
        self.last_receive.load().elapsed()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_send_blocked(&self) -> bool {
        self.send_blocked.load(Ordering::Acquire)
    }

    /// Bound to an open socket.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.socket.read().is_open()
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.read().peer_addr()
    }

    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.read().raw_fd()
    }

    #[must_use]
    pub const fn pool(&self) -> &MessagePool {
        &self.pool
    }

    #[must_use]
    pub const fn framing(&self) -> &F {
        &self.framing
    }

    #[must_use]
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    #[must_use]
    pub const fn outbound_capacity(&self) -> usize {
        self.outbound.capacity()
    }
}

impl<F: Framing> Link<F, TcpSocket> {
    /// Bind this link to one pending connection of `listener`.
    pub fn accept_from(
        &self,
        listener: &TcpListener,
        options: &SocketOptions,
    ) -> io::Result<Option<SocketAddr>> {
        let peer = self.socket.write().accept_from(listener, options)?;
        self.mark_connected();
        Ok(peer)
    }

    /// Connect to `host:port`, waiting up to `timeout`.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        options: &SocketOptions,
    ) -> Result<SocketAddr, ConnectError> {
        let addr = self.socket.write().connect(host, port, timeout, options)?;
        self.mark_connected();
        Ok(addr)
    }
}

impl<F: Framing, S: Transport> std::fmt::Debug for Link<F, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer_addr())
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("closing", &self.is_closing())
            .field("send_blocked", &self.is_send_blocked())
            .field("bytes_received", &self.bytes_received())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory transport with scriptable write limits and read faults.
    #[derive(Default)]
    struct Scripted {
        incoming: Mutex<VecDeque<u8>>,
        writes: Mutex<Vec<Vec<u8>>>,
        /// Bytes accepted per write call
        max_write: Option<usize>,
        /// Bytes accepted before the next write would block
        budget: Mutex<Option<usize>>,
        eof: AtomicBool,
        recv_fault: Mutex<Option<io::ErrorKind>>,
        send_fault: Mutex<Option<io::ErrorKind>>,
        closed: AtomicBool,
    }

    impl Scripted {
        fn chunked(max_write: usize) -> Self {
            Self {
                max_write: Some(max_write),
                ..Self::default()
            }
        }

        fn feed(&self, bytes: &[u8]) {
            self.incoming.lock().extend(bytes.iter().copied());
        }

        fn written(&self) -> Vec<u8> {
            self.writes.lock().concat()
        }
    }

    impl Transport for Scripted {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = *self.send_fault.lock() {
                return Err(io::Error::from(kind));
            }
            let mut budget = self.budget.lock();
            let mut n = buf.len().min(self.max_write.unwrap_or(usize::MAX));
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                n = n.min(*left);
                *left -= n;
            }
            self.writes.lock().push(buf[..n].to_vec());
            Ok(n)
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(kind) = *self.recv_fault.lock() {
                return Err(io::Error::from(kind));
            }
            let mut incoming = self.incoming.lock();
            if incoming.is_empty() {
                if self.eof.load(Ordering::SeqCst) {
                    return Ok(0);
                }
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(incoming.len());
            for (dst, src) in buf.iter_mut().zip(incoming.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }

        fn poll(&self, _interest: Interest, _timeout: Duration) -> io::Result<Readiness> {
            Ok(Readiness::READABLE | Readiness::WRITABLE)
        }

        fn shutdown(&self) {}

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    /// Two-byte big-endian length prefix followed by the body.
    #[derive(Clone, Copy)]
    struct LengthPrefixed;

    impl LengthPrefixed {
        fn declared(msg: &Message) -> usize {
            let b = msg.as_slice();
            2 + usize::from(u16::from_be_bytes([b[0], b[1]]))
        }
    }

    impl Framing for LengthPrefixed {
        fn is_message_complete(&self, msg: &Message) -> bool {
            self.is_header_complete(msg) && msg.len() >= Self::declared(msg)
        }

        fn is_header_complete(&self, msg: &Message) -> bool {
            msg.len() >= 2
        }

        fn is_header_ok(&self, msg: &Message) -> bool {
            Self::declared(msg) > 2
        }

        fn missing_length(&self, msg: &Message) -> usize {
            if self.is_header_complete(msg) {
                Self::declared(msg) - msg.len()
            } else {
                2 - msg.len()
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        CheckFailed,
        Finalize,
        Transmitted(usize),
        Blocked,
        SendError,
        NewMessage,
        RegularDisconnect,
        NoFreeBuffer,
        LengthMismatch,
        Oversized,
        Socket,
        InQueueFull,
        Crc,
        Length,
    }

    struct Recorder {
        events: Mutex<Vec<Ev>>,
        accept_check: bool,
        accept_handle: bool,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                accept_check: true,
                accept_handle: true,
            }
        }

        fn push(&self, ev: Ev) {
            self.events.lock().push(ev);
        }

        fn events(&self) -> Vec<Ev> {
            self.events.lock().clone()
        }

        fn count(&self, ev: &Ev) -> usize {
            self.events.lock().iter().filter(|e| *e == ev).count()
        }
    }

    impl LinkCallback for Recorder {
        fn on_send_check_tcp_failed(&self, _msg: &mut Message) {
            self.push(Ev::CheckFailed);
        }
        fn on_send_finalize_tcp(&self, _msg: &mut Message) {
            self.push(Ev::Finalize);
        }
        fn on_send_data_transmitted(&self, n: usize) {
            self.push(Ev::Transmitted(n));
        }
        fn on_send_blocked(&self) {
            self.push(Ev::Blocked);
        }
        fn on_send_error(&self) {
            self.push(Ev::SendError);
        }
        fn on_recv_check_tcp(&self, _msg: &mut Message) -> bool {
            self.accept_check
        }
        fn on_recv_handle_tcp(&self, _msg: &mut Message) -> bool {
            self.accept_handle
        }
        fn on_recv_new_message(&self) {
            self.push(Ev::NewMessage);
        }
        fn on_recv_regular_disconnect(&self) {
            self.push(Ev::RegularDisconnect);
        }
        fn on_recv_error_no_free_tcp_buffer(&self) {
            self.push(Ev::NoFreeBuffer);
        }
        fn on_recv_error_length_mismatch(&self) {
            self.push(Ev::LengthMismatch);
        }
        fn on_recv_error_tcp_msg_oversized(&self) {
            self.push(Ev::Oversized);
        }
        fn on_recv_error_socket(&self) {
            self.push(Ev::Socket);
        }
        fn on_recv_error_tcp_in_queue_full(&self) {
            self.push(Ev::InQueueFull);
        }
        fn on_recv_error_crc(&self) {
            self.push(Ev::Crc);
        }
        fn on_recv_error_length(&self) {
            self.push(Ev::Length);
        }
    }

    fn message(pool: &MessagePool, bytes: &[u8]) -> Message {
        let mut msg = pool.acquire().unwrap();
        assert!(msg.write(bytes));
        msg
    }

    fn raw_link(pool: &MessagePool, socket: Scripted) -> Link<RawSegment, Scripted> {
        Link::new(RawSegment, socket, pool.clone(), 4, 4)
    }

    #[test]
    fn test_round_trip_leaks_nothing() {
        let pool = MessagePool::new(8, 64);
        let a = raw_link(&pool, Scripted::default());
        let b = raw_link(&pool, Scripted::default());
        let cb = Recorder::new();

        let payload: Vec<u8> = (0..50).collect();
        a.enqueue(message(&pool, &payload)).unwrap();
        a.send(&cb);
        assert_eq!(cb.events(), vec![Ev::Finalize, Ev::Transmitted(50)]);
        assert_eq!(a.bytes_sent(), 50);

        b.socket.read().feed(&a.socket.read().written());
        b.receive(&cb);
        assert_eq!(cb.count(&Ev::NewMessage), 1);
        assert_eq!(b.bytes_received(), 50);

        let got = b.dequeue().unwrap();
        assert_eq!(got.as_slice(), &payload[..]);
        pool.release(got);

        // Only the pending (empty) receive buffer is still held
        b.close();
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_partial_writes_resume_without_gaps() {
        let pool = MessagePool::new(4, 64);
        let link = raw_link(&pool, Scripted::chunked(3));
        *link.socket.read().budget.lock() = Some(7);
        let cb = Recorder::new();

        let payload: Vec<u8> = (100..140).collect();
        link.enqueue(message(&pool, &payload)).unwrap();

        let mut rounds = 0;
        loop {
            link.send(&cb);
            rounds += 1;
            if link.outbound_len() == 0 && link.current_out.lock().is_none() {
                break;
            }
            assert!(link.is_send_blocked());
            *link.socket.read().budget.lock() = Some(7);
            assert!(rounds < 20);
        }

        assert_eq!(link.socket.read().written(), payload);
        assert_eq!(cb.count(&Ev::Finalize), 1);
        assert!(cb.count(&Ev::Blocked) >= 1);
        let transmitted: usize = cb
            .events()
            .iter()
            .filter_map(|e| match e {
                Ev::Transmitted(n) => Some(*n),
                _ => None,
            })
            .sum();
        assert_eq!(transmitted, payload.len());
        assert_eq!(link.bytes_sent(), payload.len() as u64);
        assert!(!link.is_send_blocked());
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_send_preserves_enqueue_order() {
        let pool = MessagePool::new(4, 16);
        let link = raw_link(&pool, Scripted::chunked(2));
        for part in [&b"one"[..], b"two", b"three"] {
            link.enqueue(message(&pool, part)).unwrap();
        }
        link.send(&NoCallback);
        assert_eq!(link.socket.read().written(), b"onetwothree");
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_enqueue_backpressure() {
        let pool = MessagePool::new(8, 16);
        let link = raw_link(&pool, Scripted::default());
        for _ in 0..4 {
            link.enqueue(message(&pool, b"x")).unwrap();
        }
        let rejected = link.enqueue(message(&pool, b"x")).unwrap_err();
        assert_eq!(link.outbound_len(), 4);
        pool.release(rejected);

        link.close();
        assert_eq!(link.outbound_len(), 0);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_send_check_rejection_releases() {
        struct RejectAll;
        impl Framing for RejectAll {
            fn on_send_check(&self, _msg: &Message) -> bool {
                false
            }
        }

        let pool = MessagePool::new(2, 16);
        let link = Link::new(RejectAll, Scripted::default(), pool.clone(), 2, 2);
        let cb = Recorder::new();
        link.enqueue(message(&pool, b"a")).unwrap();
        link.enqueue(message(&pool, b"b")).unwrap();
        link.send(&cb);
        assert_eq!(cb.events(), vec![Ev::CheckFailed, Ev::CheckFailed]);
        assert!(link.socket.read().written().is_empty());
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_send_error_releases() {
        let pool = MessagePool::new(2, 16);
        let link = raw_link(&pool, Scripted::default());
        *link.socket.read().send_fault.lock() = Some(io::ErrorKind::BrokenPipe);
        let cb = Recorder::new();
        link.enqueue(message(&pool, b"abc")).unwrap();
        link.send(&cb);
        assert_eq!(cb.events(), vec![Ev::Finalize, Ev::SendError]);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_framed_message_across_reads() {
        let pool = MessagePool::new(4, 32);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 4, 4);
        let cb = Recorder::new();

        link.socket.read().feed(&[0, 5, b'h']);
        link.receive(&cb);
        assert!(link.dequeue().is_none());
        assert_eq!(pool.free_count(), 3);

        link.socket.read().feed(b"ello");
        link.receive(&cb);
        let msg = link.dequeue().unwrap();
        assert_eq!(msg.as_slice(), b"\x00\x05hello");
        pool.release(msg);
        assert_eq!(cb.count(&Ev::NewMessage), 1);
    }

    #[test]
    fn test_back_to_back_framed_messages_are_split() {
        let pool = MessagePool::new(4, 32);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 4, 4);
        link.socket.read().feed(&[0, 1, b'a', 0, 2, b'b', b'c']);
        link.receive(&NoCallback);

        let first = link.dequeue().unwrap();
        let second = link.dequeue().unwrap();
        assert_eq!(first.as_slice(), b"\x00\x01a");
        assert_eq!(second.as_slice(), b"\x00\x02bc");
        pool.release(first);
        pool.release(second);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let pool = MessagePool::new(4, 16);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 4, 4);
        let cb = Recorder::new();

        link.socket.read().feed(&[0x01, 0x00, 1, 2, 3]);
        let before = pool.free_count();
        link.receive(&cb);

        assert_eq!(cb.count(&Ev::Oversized), 1);
        assert_eq!(cb.events(), vec![Ev::Oversized]);
        assert_eq!(pool.free_count(), before);
        assert!(link.dequeue().is_none());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let pool = MessagePool::new(2, 16);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 2, 2);
        let cb = Recorder::new();
        link.socket.read().feed(&[0, 0]);
        link.receive(&cb);
        assert_eq!(cb.events(), vec![Ev::LengthMismatch]);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_zero_missing_length_rejected() {
        struct Stuck;
        impl Framing for Stuck {
            fn is_message_complete(&self, _msg: &Message) -> bool {
                false
            }
            fn missing_length(&self, _msg: &Message) -> usize {
                0
            }
        }

        let pool = MessagePool::new(1, 8);
        let link = Link::new(Stuck, Scripted::default(), pool.clone(), 1, 1);
        let cb = Recorder::new();
        link.receive(&cb);
        assert_eq!(cb.events(), vec![Ev::Length]);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_peer_close_is_regular_disconnect() {
        let pool = MessagePool::new(2, 16);
        let link = raw_link(&pool, Scripted::default());
        link.socket.read().eof.store(true, Ordering::SeqCst);
        let cb = Recorder::new();
        link.receive(&cb);
        assert_eq!(cb.events(), vec![Ev::RegularDisconnect]);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_would_block_keeps_partial_buffer() {
        let pool = MessagePool::new(2, 16);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 2, 2);
        let cb = Recorder::new();
        link.socket.read().feed(&[0, 9]);
        link.receive(&cb);
        assert!(cb.events().is_empty());
        assert_eq!(pool.free_count(), 1);
        assert_eq!(link.bytes_received(), 2);
    }

    #[test]
    fn test_would_block_then_socket_error() {
        let pool = MessagePool::new(2, 16);
        let link = raw_link(&pool, Scripted::default());
        *link.socket.read().recv_fault.lock() = Some(io::ErrorKind::WouldBlock);
        let cb = Recorder::new();
        link.receive(&cb);
        assert!(cb.events().is_empty());

        *link.socket.read().recv_fault.lock() = Some(io::ErrorKind::ConnectionReset);
        link.receive(&cb);
        assert_eq!(cb.events(), vec![Ev::Socket]);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_no_free_buffer() {
        let pool = MessagePool::new(1, 16);
        let link = raw_link(&pool, Scripted::default());
        let held = pool.acquire().unwrap();
        let cb = Recorder::new();
        link.socket.read().feed(b"x");
        link.receive(&cb);
        assert_eq!(cb.events(), vec![Ev::NoFreeBuffer]);
        pool.release(held);
    }

    #[test]
    fn test_crc_failure_and_soft_discard() {
        let pool = MessagePool::new(2, 16);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 2, 2);

        let mut cb = Recorder::new();
        cb.accept_handle = false;
        link.socket.read().feed(&[0, 1, b'a', 0, 1, b'b']);
        link.receive(&cb);
        // Both discarded, connection untouched
        assert!(cb.events().is_empty());
        assert!(link.dequeue().is_none());
        assert_eq!(pool.free_count(), 1);

        let mut cb = Recorder::new();
        cb.accept_check = false;
        link.socket.read().feed(&[0, 1, b'c']);
        link.receive(&cb);
        assert_eq!(cb.events(), vec![Ev::Crc]);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_inbound_queue_full() {
        let pool = MessagePool::new(4, 16);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 1, 1);
        let cb = Recorder::new();
        link.socket.read().feed(&[0, 1, b'a', 0, 1, b'b']);
        link.receive(&cb);
        assert_eq!(cb.events(), vec![Ev::NewMessage, Ev::InQueueFull]);
        assert_eq!(link.inbound_len(), 1);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_close_resets_everything() {
        let pool = MessagePool::new(4, 16);
        let link = Link::new(LengthPrefixed, Scripted::default(), pool.clone(), 2, 2);
        let fresh = link.stats();
        link.mark_connected();

        link.socket.read().feed(&[0, 1, b'a', 0, 4]);
        link.receive(&NoCallback);
        link.enqueue(message(&pool, b"out")).unwrap();
        assert!(link.stats().bytes_received > 0);
        assert!(pool.free_count() < 4);

        link.close();
        assert_eq!(link.stats(), fresh);
        assert_eq!(link.stats(), LinkStats::default());
        assert!(!link.is_used());
        assert!(!link.is_closing());
        assert!(!link.is_send_blocked());
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_poll_clears_send_blocked() {
        let pool = MessagePool::new(2, 16);
        let link = raw_link(&pool, Scripted::default());
        *link.socket.read().budget.lock() = Some(0);
        link.enqueue(message(&pool, b"x")).unwrap();
        link.send(&NoCallback);
        assert!(link.is_send_blocked());

        let ready = link.poll(Interest::BOTH, Duration::ZERO).unwrap();
        assert!(ready.is_writable());
        assert!(!link.is_send_blocked());
        link.close();
    }
}
