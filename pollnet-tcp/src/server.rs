//! Server: listener, fixed slot table, accept loop and multiplexer.
//!
//! Two repeating tasks run on the `workload` scheduler for the lifetime of
//! the server:
//!
//! - **accept**: wait up to one poll timeout for a pending connection and
//!   bind it to the top of the free stack, or drop it when every slot is
//!   busy
//! - **multiplex**: close sessions idle past the receive timeout, poll the
//!   rest with one `poll(2)` call and hand each readiness report to its
//!   session

use crate::config::ServerConfig;
use crate::framing::Framing;
use crate::handlers::Handlers;
use crate::session::{Session, SessionHandler, SessionShared};
use parking_lot::Mutex;
use pollnet_core::error::{is_transient, Result};
use pollnet_core::monitor::{MonitorSlot, SocketEvent, SocketMonitor};
use pollnet_core::poll::{Interest, PollSet};
use pollnet_core::pool::MessagePool;
use pollnet_core::scheduler::Task;
use pollnet_core::socket::TcpListener;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Poll set plus the session id behind each entry, reused every cycle.
#[derive(Default)]
struct MultiplexCycle {
    set: PollSet,
    polled: Vec<usize>,
}

/// TCP server with a fixed number of session slots.
///
/// # Examples
///
/// ```no_run
/// use pollnet_core::scheduler::Scheduler;
/// use pollnet_tcp::prelude::*;
///
/// struct Echo;
///
/// impl SessionHandler<RawSegment> for Echo {
///     fn on_session_message(&self, session: &Session<RawSegment, Self>, msg: &Message) {
///         if let Some(mut reply) = session.acquire() {
///             reply.write(msg.as_slice());
///             session.send_tcp(reply);
///         }
///     }
/// }
///
/// # fn main() -> pollnet_core::error::Result<()> {
/// let scheduler = Scheduler::with_default_workers("server")?;
/// let server = Server::bind(
///     ServerConfig::new(7000),
///     Handlers::single(&scheduler.handle()),
///     RawSegment,
///     Echo,
/// )?;
/// println!("listening on {}", server.local_addr());
/// # Ok(())
/// # }
/// ```
pub struct Server<F: Framing + Clone, H: SessionHandler<F>> {
    config: ServerConfig,
    shared: Arc<SessionShared<H>>,
    sessions: Vec<Arc<Session<F, H>>>,
    listener: TcpListener,
    cycle: Mutex<MultiplexCycle>,
    accept_task: Arc<Task>,
    multiplex_task: Arc<Task>,
    stopped: AtomicBool,
}

impl<F: Framing + Clone, H: SessionHandler<F>> Server<F, H> {
    /// Listen on `config.bind`, allocate every slot and start the accept
    /// and multiplex loops.
    pub fn bind(
        config: ServerConfig,
        handlers: Handlers,
        framing: F,
        handler: H,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind, &config.socket).map_err(|e| {
            error!("[Server] Listen on {} failed: {}", config.bind, e);
            e
        })?;

        let max = config.max_sessions;
        let shared = Arc::new(SessionShared {
            pool: MessagePool::new(config.link.buffer_count, config.link.message_size),
            handler,
            handlers,
            free: Mutex::new((0..max).rev().collect()),
            monitor: MonitorSlot::new(),
            send_stuck_timeout: config.send_stuck_timeout,
            socket_options: config.socket.clone(),
        });
        let sessions: Vec<_> = (0..max)
            .map(|id| Session::new(id, Arc::clone(&shared), framing.clone(), &config.link))
            .collect();

        let server = Arc::new_cyclic(|weak: &Weak<Self>| {
            let accept = weak.clone();
            let multiplex = weak.clone();
            Self {
                config,
                shared,
                sessions,
                listener,
                cycle: Mutex::new(MultiplexCycle::default()),
                accept_task: Task::repeating("server-accept", Duration::ZERO, move || {
                    if let Some(server) = accept.upgrade() {
                        server.run_accept();
                    }
                }),
                multiplex_task: Task::repeating("server-multiplex", Duration::ZERO, move || {
                    if let Some(server) = multiplex.upgrade() {
                        server.run_multiplex();
                    }
                }),
                stopped: AtomicBool::new(false),
            }
        });

        info!(
            "[Server] Listening on {} with {} sessions",
            server.local_addr(),
            max
        );
        let workload = &server.shared.handlers.workload;
        workload.schedule(&server.accept_task);
        workload.schedule(&server.multiplex_task);
        Ok(server)
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Shared buffer pool of all sessions.
    #[must_use]
    pub fn pool(&self) -> &MessagePool {
        &self.shared.pool
    }

    #[must_use]
    pub fn session(&self, id: usize) -> Option<&Arc<Session<F, H>>> {
        self.sessions.get(id)
    }

    #[must_use]
    pub fn sessions(&self) -> &[Arc<Session<F, H>>] {
        &self.sessions
    }

    /// Slots available for new connections.
    #[must_use]
    pub fn free_sessions(&self) -> usize {
        self.shared.free.lock().len()
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active()).count()
    }

    /// Attach an event monitor. The first event is `Listening`; a previously
    /// attached monitor stops receiving.
    pub fn monitor(&self) -> SocketMonitor {
        let monitor = self.shared.monitor.attach();
        self.shared
            .monitor
            .emit(SocketEvent::Listening(self.local_addr()));
        monitor
    }

    /// Stop accepting and close every active session. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let workload = &self.shared.handlers.workload;
        workload.cancel(&self.accept_task);
        workload.cancel(&self.multiplex_task);
        for session in self.sessions.iter().filter(|s| s.is_active()) {
            session.close();
        }
        info!("[Server] Shut down {}", self.local_addr());
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn run_accept(&self) {
        match self.listener.poll_accept(self.config.poll_timeout) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                warn!("[Server] Accept poll failed: {}", e);
                thread::sleep(self.config.poll_timeout);
                return;
            }
        }

        let Some(id) = self.shared.pop_free() else {
            match self.listener.accept_and_close() {
                Ok(peer) => {
                    warn!(
                        "[Server] No free session, rejected {}",
                        peer.map_or_else(|| "connection".to_owned(), |p| p.to_string())
                    );
                    self.shared.monitor.emit(SocketEvent::Rejected);
                }
                Err(e) => debug!("[Server] Reject failed: {}", e),
            }
            return;
        };

        let accepted = self
            .sessions
            .get(id)
            .is_some_and(|session| session.accept_from(&self.listener));
        if !accepted {
            self.shared.push_free(id);
        }
    }

    fn run_multiplex(&self) {
        let mut cycle = self.cycle.lock();
        let MultiplexCycle { set, polled } = &mut *cycle;
        set.clear();
        polled.clear();

        for session in &self.sessions {
            if !session.is_active() {
                continue;
            }
            let link = session.link();
            if link
                .receive_idle()
                .is_some_and(|idle| idle > self.config.receive_timeout)
            {
                debug!("[Session {}] Receive timeout, closing", session.id());
                session.close();
                continue;
            }
            let Some(fd) = link.raw_fd() else {
                continue;
            };
            set.push(fd, Interest::read_and(link.is_send_blocked()));
            polled.push(session.id());
        }

        if set.is_empty() {
            drop(cycle);
            thread::sleep(self.config.poll_timeout);
            return;
        }

        match set.wait(self.config.poll_timeout) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                warn!("[Server] Multiplex poll failed: {}", e);
                return;
            }
        }

        for (index, &id) in polled.iter().enumerate() {
            let ready = set.readiness(index);
            if ready.is_empty() {
                continue;
            }
            if let Some(session) = self.sessions.get(id) {
                session.process_pending(ready);
            }
        }
    }
}

impl<F: Framing + Clone, H: SessionHandler<F>> Drop for Server<F, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<F: Framing + Clone, H: SessionHandler<F>> std::fmt::Debug for Server<F, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.sessions.len())
            .field("free", &self.free_sessions())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
