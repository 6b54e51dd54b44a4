//! Session: a reusable connection slot owned by a server.
//!
//! Each session wraps one [`Link`] and keeps its numeric id (the slot index)
//! for the lifetime of the server. A slot cycles through
//!
//! ```text
//! Free --accept_from--> Active --close--> Closing --clear--> Free
//! ```
//!
//! `close` only half-closes the socket and schedules the disconnect
//! notification; the notification task calls the application, then `clear`,
//! then hands the slot back to the server's free stack. That task is the
//! only way a slot becomes free again.

use crate::config::LinkConfig;
use crate::framing::Framing;
use crate::handlers::Handlers;
use crate::link::{Link, LinkCallback, LinkStats};
use parking_lot::Mutex;
use pollnet_core::error::is_would_block;
use pollnet_core::message::Message;
use pollnet_core::monitor::{MonitorSlot, SocketEvent};
use pollnet_core::options::SocketOptions;
use pollnet_core::poll::Readiness;
use pollnet_core::pool::MessagePool;
use pollnet_core::scheduler::Task;
use pollnet_core::socket::{TcpListener, TcpSocket};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Application side of a server.
///
/// Notifications (`on_session_*` lifecycle) run on the `connection`
/// scheduler, `on_session_message` on the `message` scheduler, and the
/// protocol hooks inline on whichever `workload` worker drives the I/O.
#[allow(unused_variables)]
pub trait SessionHandler<F: Framing>: Send + Sync + Sized + 'static {
    /// A slot was bound to a new peer.
    fn on_session_accepted(&self, session: &Session<F, Self>) {}

    /// The connection is gone. Called once per accepted connection, before
    /// the slot is cleared.
    fn on_session_disconnected(&self, session: &Session<F, Self>) {}

    /// One received message. The buffer returns to the pool afterwards.
    fn on_session_message(&self, session: &Session<F, Self>, msg: &Message) {}

    /// Stamp protocol fields on an outbound message before its first byte
    /// is written.
    fn on_send_finalize(&self, session: &Session<F, Self>, msg: &mut Message) {}

    /// Integrity check on a complete inbound message. False closes the
    /// session.
    fn on_recv_check(&self, session: &Session<F, Self>, msg: &mut Message) -> bool {
        true
    }

    /// False discards the message and keeps the session open.
    fn on_recv_handle(&self, session: &Session<F, Self>, msg: &mut Message) -> bool {
        true
    }

    /// Per-slot protocol state should be reset here.
    fn on_session_clear(&self, session: &Session<F, Self>) {}
}

/// State every session of one server shares.
pub(crate) struct SessionShared<H> {
    pub(crate) pool: MessagePool,
    pub(crate) handler: H,
    pub(crate) handlers: Handlers,
    /// Stack of free slot ids; the top is handed out next
    pub(crate) free: Mutex<Vec<usize>>,
    pub(crate) monitor: MonitorSlot,
    pub(crate) send_stuck_timeout: Duration,
    pub(crate) socket_options: SocketOptions,
}

impl<H> SessionShared<H> {
    pub(crate) fn push_free(&self, id: usize) {
        self.free.lock().push(id);
    }

    pub(crate) fn pop_free(&self) -> Option<usize> {
        self.free.lock().pop()
    }
}

struct SessionTasks {
    on_read: Arc<Task>,
    on_accepted: Arc<Task>,
    on_disconnected: Arc<Task>,
    write: Arc<Task>,
    disconnect_blocked: Arc<Task>,
}

impl SessionTasks {
    fn new<F: Framing, H: SessionHandler<F>>(weak: &Weak<Session<F, H>>) -> Self {
        fn bind<F: Framing, H: SessionHandler<F>>(
            name: &'static str,
            weak: &Weak<Session<F, H>>,
            run: fn(&Session<F, H>),
        ) -> Arc<Task> {
            let weak = weak.clone();
            Task::new(name, move || {
                if let Some(session) = weak.upgrade() {
                    run(&session);
                }
            })
        }

        Self {
            on_read: bind("session-read", weak, Session::run_on_read),
            on_accepted: bind("session-accepted", weak, Session::run_on_accepted),
            on_disconnected: bind("session-disconnected", weak, Session::run_on_disconnected),
            write: bind("session-write", weak, Session::run_write),
            disconnect_blocked: bind(
                "session-disconnect-blocked",
                weak,
                Session::run_disconnect_blocked,
            ),
        }
    }
}

/// One connection slot.
pub struct Session<F: Framing, H: SessionHandler<F>> {
    id: usize,
    link: Link<F>,
    shared: Arc<SessionShared<H>>,
    /// Lifecycle lock; makes close idempotent under concurrent callers and
    /// keeps `send_tcp` from queueing past a close
    close_lock: Mutex<()>,
    tasks: SessionTasks,
}

impl<F: Framing, H: SessionHandler<F>> Session<F, H> {
    pub(crate) fn new(
        id: usize,
        shared: Arc<SessionShared<H>>,
        framing: F,
        config: &LinkConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let link = Link::with_config(framing, TcpSocket::new(), shared.pool.clone(), config);
            Self {
                id,
                link,
                shared,
                close_lock: Mutex::new(()),
                tasks: SessionTasks::new(weak),
            }
        })
    }

    /// Slot index, stable for the server's lifetime.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub const fn link(&self) -> &Link<F> {
        &self.link
    }

    #[must_use]
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Bound to a socket (active or closing).
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.link.is_used()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.link.is_closing()
    }

    /// Bound to a socket and not closing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_used() && !self.is_closing()
    }

    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.link.stats()
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer_addr()
    }

    /// Free buffer from the server pool, for building an outbound message.
    #[must_use]
    pub fn acquire(&self) -> Option<Message> {
        self.shared.pool.acquire()
    }

    pub fn release(&self, msg: Message) {
        self.shared.pool.release(msg);
    }

    /// Take a received message directly from the inbound queue.
    #[must_use]
    pub fn recv_tcp(&self) -> Option<Message> {
        self.link.dequeue()
    }

    /// Bind this slot to a pending connection of `listener` and schedule the
    /// accepted notification.
    pub fn accept_from(&self, listener: &TcpListener) -> bool {
        match self.link.accept_from(listener, &self.shared.socket_options) {
            Ok(peer) => {
                match peer {
                    Some(peer) => debug!("[Session {}] Accepted {}", self.id, peer),
                    None => debug!("[Session {}] Accepted", self.id),
                }
                self.shared.monitor.emit(SocketEvent::Accepted {
                    session: self.id,
                    peer,
                });
                self.shared.handlers.connection.schedule(&self.tasks.on_accepted);
                true
            }
            Err(e) if is_would_block(&e) => false,
            Err(e) => {
                warn!("[Session {}] Accept failed: {}", self.id, e);
                false
            }
        }
    }

    /// Queue `msg` and schedule the write task.
    ///
    /// Fails (and releases `msg`) when the session is not active. A full
    /// outbound queue closes the session.
    pub fn send_tcp(&self, msg: Message) -> bool {
        let queued = {
            // Held across check and enqueue: once close has run, every
            // queued buffer is drained by the following clear
            let lifecycle = self.close_lock.lock();
            if !self.is_active() {
                drop(lifecycle);
                self.shared.pool.release(msg);
                return false;
            }
            self.link.enqueue(msg)
        };
        match queued {
            Ok(()) => {
                self.shared.handlers.workload.schedule(&self.tasks.write);
                true
            }
            Err(msg) => {
                warn!("[Session {}] Outbound queue full, closing", self.id);
                self.close();
                self.shared.pool.release(msg);
                false
            }
        }
    }

    /// Begin tearing the connection down. Idempotent.
    pub fn close(&self) {
        let _lifecycle = self.close_lock.lock();
        self.shared
            .handlers
            .workload
            .cancel(&self.tasks.disconnect_blocked);

        if self.link.is_closing() {
            debug!("[Session {}] Already closing", self.id);
            return;
        }
        if !self.link.is_used() {
            return;
        }
        debug!("[Session {}] Closing socket/session", self.id);
        self.link.shutdown();
        self.shared
            .handlers
            .connection
            .schedule(&self.tasks.on_disconnected);
    }

    /// Close the socket and reset the slot to its never-accepted state.
    ///
    /// Must not hold the lifecycle lock: a receive in flight may call
    /// `close` while holding the receive path, which `Link::close` waits for.
    /// `close` stays a no-op throughout since the link reports closing until
    /// its socket is gone.
    pub fn clear(&self) {
        let workload = &self.shared.handlers.workload;
        workload.cancel(&self.tasks.write);
        workload.cancel(&self.tasks.disconnect_blocked);
        self.link.close();
        self.shared.handler.on_session_clear(self);
    }

    /// Handle one readiness report from the multiplexer.
    pub fn process_pending(&self, ready: Readiness) {
        if !self.is_active() {
            return;
        }
        if ready.needs_receive() {
            self.link.receive(&SessionEvents(self));
        }
        if ready.is_writable() && self.link.is_send_blocked() {
            let workload = &self.shared.handlers.workload;
            workload.cancel(&self.tasks.disconnect_blocked);
            workload.schedule(&self.tasks.write);
        }
    }

    fn run_on_read(&self) {
        while let Some(msg) = self.link.dequeue() {
            self.shared.handler.on_session_message(self, &msg);
            self.shared.pool.release(msg);
        }
    }

    fn run_on_accepted(&self) {
        self.shared.handler.on_session_accepted(self);
    }

    fn run_on_disconnected(&self) {
        self.shared.handler.on_session_disconnected(self);
        self.clear();
        self.shared.push_free(self.id);
        self.shared
            .monitor
            .emit(SocketEvent::Closed { session: self.id });
    }

    fn run_write(&self) {
        if self.is_active() {
            self.link.send(&SessionEvents(self));
        }
    }

    fn run_disconnect_blocked(&self) {
        if !self.link.is_send_blocked() {
            return;
        }
        warn!(
            "[Session {}] Send blocked for {:?}, disconnecting",
            self.id, self.shared.send_stuck_timeout
        );
        self.close();
    }
}

impl<F: Framing, H: SessionHandler<F>> std::fmt::Debug for Session<F, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("link", &self.link)
            .finish()
    }
}

/// Routes link notifications into the session lifecycle.
struct SessionEvents<'a, F: Framing, H: SessionHandler<F>>(&'a Session<F, H>);

impl<F: Framing, H: SessionHandler<F>> SessionEvents<'_, F, H> {
    fn fail(&self, what: &str) {
        warn!("[Session {}] {}", self.0.id, what);
        self.0.close();
    }
}

impl<F: Framing, H: SessionHandler<F>> LinkCallback for SessionEvents<'_, F, H> {
    fn on_send_check_tcp_failed(&self, _msg: &mut Message) {
        debug!("[Session {}] Outbound message rejected by framing", self.0.id);
    }

    fn on_send_finalize_tcp(&self, msg: &mut Message) {
        self.0.shared.handler.on_send_finalize(self.0, msg);
    }

    fn on_send_blocked(&self) {
        let session = self.0;
        session.shared.handlers.workload.schedule_after(
            &session.tasks.disconnect_blocked,
            session.shared.send_stuck_timeout,
        );
    }

    fn on_send_error(&self) {
        self.fail("Send error");
    }

    fn on_recv_check_tcp(&self, msg: &mut Message) -> bool {
        self.0.shared.handler.on_recv_check(self.0, msg)
    }

    fn on_recv_handle_tcp(&self, msg: &mut Message) -> bool {
        self.0.shared.handler.on_recv_handle(self.0, msg)
    }

    fn on_recv_new_message(&self) {
        let session = self.0;
        session.shared.handlers.message.schedule(&session.tasks.on_read);
    }

    fn on_recv_regular_disconnect(&self) {
        debug!("[Session {}] Regular disconnect", self.0.id);
        self.0.close();
    }

    fn on_recv_error_no_free_tcp_buffer(&self) {
        error!("[Session {}] No free TCP buffer", self.0.id);
        self.0.close();
    }

    fn on_recv_error_length_mismatch(&self) {
        self.fail("Length mismatch");
    }

    fn on_recv_error_tcp_msg_oversized(&self) {
        self.fail("Message oversized");
    }

    fn on_recv_error_socket(&self) {
        self.fail("Socket error");
    }

    fn on_recv_error_tcp_in_queue_full(&self) {
        self.fail("Inbound queue full");
    }

    fn on_recv_error_crc(&self) {
        self.fail("Checksum mismatch");
    }

    fn on_recv_error_length(&self) {
        self.fail("Invalid length");
    }
}
