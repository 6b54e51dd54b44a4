//! Client: one outbound connection with a scheduled receive loop.
//!
//! Connect and disconnect are asynchronous. [`Client::connect`] and
//! [`Client::disconnect`] only move the state machine and schedule the work;
//! the outcome is reported through [`ClientHandler`] on the `connection`
//! scheduler.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!      ^                        |                  |
//!      +--------failed----------+             disconnect
//!      |                                           v
//!      +---------------close----------------- Disconnecting
//! ```

use crate::config::ClientConfig;
use crate::framing::Framing;
use crate::handlers::Handlers;
use crate::link::{Link, LinkCallback, LinkStats};
use parking_lot::Mutex;
use pollnet_core::error::{is_transient, ConnectError, Result};
use pollnet_core::message::Message;
use pollnet_core::monitor::{MonitorSlot, SocketEvent, SocketMonitor};
use pollnet_core::poll::Interest;
use pollnet_core::pool::MessagePool;
use pollnet_core::scheduler::Task;
use pollnet_core::socket::TcpSocket;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Application side of a client.
#[allow(unused_variables)]
pub trait ClientHandler<F: Framing>: Send + Sync + Sized + 'static {
    fn on_connected(&self, client: &Client<F, Self>) {}

    fn on_connection_failed(&self, client: &Client<F, Self>, reason: &ConnectError) {}

    /// The connection is gone and the client can connect again.
    fn on_disconnected(&self, client: &Client<F, Self>) {}

    /// One received message.
    ///
    /// Hand the buffer back to have it released. Returning `None` keeps it
    /// out of the pool until [`Client::release`] is called with it.
    fn on_message(&self, client: &Client<F, Self>, msg: Message) -> Option<Message> {
        Some(msg)
    }

    fn on_send_finalize(&self, client: &Client<F, Self>, msg: &mut Message) {}

    /// False disconnects.
    fn on_recv_check(&self, client: &Client<F, Self>, msg: &mut Message) -> bool {
        true
    }

    /// False discards the message and keeps the connection.
    fn on_recv_handle(&self, client: &Client<F, Self>, msg: &mut Message) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    timeout: Duration,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
struct Transition {
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    last_failure: Option<ConnectError>,
}

struct ClientTasks {
    connect: Arc<Task>,
    disconnect: Arc<Task>,
    send: Arc<Task>,
    receive: Arc<Task>,
    on_read: Arc<Task>,
    on_connected: Arc<Task>,
    on_connection_failed: Arc<Task>,
    on_disconnected: Arc<Task>,
}

impl ClientTasks {
    fn new<F: Framing, H: ClientHandler<F>>(weak: &Weak<Client<F, H>>) -> Self {
        fn bind<F: Framing, H: ClientHandler<F>>(
            name: &'static str,
            weak: &Weak<Client<F, H>>,
            run: fn(&Client<F, H>),
        ) -> Arc<Task> {
            let weak = weak.clone();
            Task::new(name, move || {
                if let Some(client) = weak.upgrade() {
                    run(&client);
                }
            })
        }

        let receive = {
            let weak = weak.clone();
            Task::repeating("client-receive", Duration::ZERO, move || {
                if let Some(client) = weak.upgrade() {
                    client.run_receive();
                }
            })
        };

        Self {
            connect: bind("client-connect", weak, Client::run_connect),
            disconnect: bind("client-disconnect", weak, Client::run_disconnect),
            send: bind("client-send", weak, Client::run_send),
            receive,
            on_read: bind("client-read", weak, Client::run_on_read),
            on_connected: bind("client-connected", weak, Client::run_on_connected),
            on_connection_failed: bind(
                "client-connection-failed",
                weak,
                Client::run_on_connection_failed,
            ),
            on_disconnected: bind("client-disconnected", weak, Client::run_on_disconnected),
        }
    }

    fn all(&self) -> [&Arc<Task>; 8] {
        [
            &self.connect,
            &self.disconnect,
            &self.send,
            &self.receive,
            &self.on_read,
            &self.on_connected,
            &self.on_connection_failed,
            &self.on_disconnected,
        ]
    }
}

/// Outbound TCP connection.
///
/// # Examples
///
/// ```no_run
/// use pollnet_core::scheduler::Scheduler;
/// use pollnet_tcp::prelude::*;
///
/// struct Printer;
///
/// impl ClientHandler<RawSegment> for Printer {
///     fn on_message(&self, _client: &Client<RawSegment, Self>, msg: Message) -> Option<Message> {
///         println!("{} bytes", msg.len());
///         Some(msg)
///     }
/// }
///
/// # fn main() -> pollnet_core::error::Result<()> {
/// let scheduler = Scheduler::with_default_workers("client")?;
/// let client = Client::new(
///     ClientConfig::default(),
///     Handlers::single(&scheduler.handle()),
///     RawSegment,
///     Printer,
/// )?;
/// client.connect("localhost", 7000);
/// # Ok(())
/// # }
/// ```
pub struct Client<F: Framing, H: ClientHandler<F>> {
    config: ClientConfig,
    link: Link<F>,
    handler: H,
    handlers: Handlers,
    /// Connection state machine; also guards the endpoint of the next attempt
    transition: Mutex<Transition>,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    monitor: MonitorSlot,
    tasks: ClientTasks,
}

impl<F: Framing, H: ClientHandler<F>> Client<F, H> {
    pub fn new(
        config: ClientConfig,
        handlers: Handlers,
        framing: F,
        handler: H,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = MessagePool::new(config.link.buffer_count, config.link.message_size);
        Ok(Arc::new_cyclic(|weak| {
            let link = Link::with_config(framing, TcpSocket::new(), pool, &config.link);
            Self {
                link,
                handler,
                handlers,
                transition: Mutex::new(Transition {
                    state: ConnectionState::Disconnected,
                    endpoint: None,
                    last_failure: None,
                }),
                send_lock: Mutex::new(()),
                recv_lock: Mutex::new(()),
                monitor: MonitorSlot::new(),
                tasks: ClientTasks::new(weak),
                config,
            }
        }))
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.transition.lock().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reason of the most recent failed connect, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<ConnectError> {
        self.transition.lock().last_failure.clone()
    }

    #[must_use]
    pub const fn link(&self) -> &Link<F> {
        &self.link
    }

    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &MessagePool {
        self.link.pool()
    }

    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.link.stats()
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer_addr()
    }

    /// Attach an event monitor, replacing any previous one.
    pub fn monitor(&self) -> SocketMonitor {
        self.monitor.attach()
    }

    #[must_use]
    pub fn acquire(&self) -> Option<Message> {
        self.link.pool().acquire()
    }

    pub fn release(&self, msg: Message) {
        self.link.pool().release(msg);
    }

    /// Start connecting with the configured timeout.
    pub fn connect(&self, host: &str, port: u16) -> bool {
        self.connect_with_timeout(host, port, self.config.connect_timeout)
    }

    /// Start connecting. Returns false unless the client is disconnected.
    pub fn connect_with_timeout(&self, host: &str, port: u16, timeout: Duration) -> bool {
        {
            let mut transition = self.transition.lock();
            if transition.state != ConnectionState::Disconnected {
                debug!("[Client] Connect ignored in state {:?}", transition.state);
                return false;
            }
            transition.state = ConnectionState::Connecting;
            transition.endpoint = Some(Endpoint {
                host: host.to_owned(),
                port,
                timeout,
            });
        }
        self.handlers.workload.schedule(&self.tasks.connect);
        true
    }

    /// Start disconnecting. Returns false unless the client is connected.
    pub fn disconnect(&self) -> bool {
        {
            let mut transition = self.transition.lock();
            if transition.state != ConnectionState::Connected {
                return false;
            }
            transition.state = ConnectionState::Disconnecting;
        }
        self.link.shutdown();
        self.handlers.workload.schedule(&self.tasks.disconnect);
        true
    }

    /// Queue `msg` and schedule a send.
    ///
    /// Fails (and releases `msg`) when not connected. A full outbound queue
    /// disconnects.
    pub fn send_tcp(&self, msg: Message) -> bool {
        let queued = {
            // Disconnect cannot start between the state check and the
            // enqueue, so the link close that follows it drains this buffer
            let transition = self.transition.lock();
            if transition.state != ConnectionState::Connected {
                drop(transition);
                self.link.pool().release(msg);
                return false;
            }
            self.link.enqueue(msg)
        };
        match queued {
            Ok(()) => {
                self.handlers.workload.schedule(&self.tasks.send);
                true
            }
            Err(msg) => {
                warn!("[Client] Outbound queue full, disconnecting");
                self.disconnect();
                self.link.pool().release(msg);
                false
            }
        }
    }

    /// Take a received message directly from the inbound queue.
    #[must_use]
    pub fn recv_tcp(&self) -> Option<Message> {
        self.link.dequeue()
    }

    fn run_connect(&self) {
        let _send = self.send_lock.lock();
        let _recv = self.recv_lock.lock();

        let endpoint = {
            let transition = self.transition.lock();
            if transition.state != ConnectionState::Connecting {
                return;
            }
            transition.endpoint.clone()
        };
        let Some(endpoint) = endpoint else {
            self.transition.lock().state = ConnectionState::Disconnected;
            return;
        };

        let result = self.link.connect(
            &endpoint.host,
            endpoint.port,
            endpoint.timeout,
            &self.config.socket,
        );

        match result {
            Ok(addr) => {
                self.transition.lock().state = ConnectionState::Connected;
                info!("[Client] Connected to {} ({})", endpoint, addr);
                self.monitor.emit(SocketEvent::Connected(addr));
                self.handlers.connection.schedule(&self.tasks.on_connected);
                self.handlers.workload.schedule(&self.tasks.receive);
            }
            Err(reason) => {
                {
                    let mut transition = self.transition.lock();
                    transition.state = ConnectionState::Disconnected;
                    transition.last_failure = Some(reason.clone());
                }
                match reason {
                    ConnectError::TimeOut | ConnectError::ConnectError(_) => {
                        warn!("[Client] Connect to {} failed: {}", endpoint, reason);
                    }
                    _ => error!("[Client] Connect to {} failed: {}", endpoint, reason),
                }
                self.monitor.emit(SocketEvent::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    reason: reason.to_string(),
                });
                self.handlers
                    .connection
                    .schedule(&self.tasks.on_connection_failed);
            }
        }
    }

    fn run_disconnect(&self) {
        let _send = self.send_lock.lock();
        let _recv = self.recv_lock.lock();

        if self.state() != ConnectionState::Disconnecting {
            return;
        }
        self.handlers.workload.cancel(&self.tasks.receive);
        self.handlers.workload.cancel(&self.tasks.send);
        self.link.close();
        self.transition.lock().state = ConnectionState::Disconnected;

        info!("[Client] Disconnected");
        self.monitor.emit(SocketEvent::Disconnected);
        self.handlers.connection.schedule(&self.tasks.on_disconnected);
    }

    fn run_send(&self) {
        let _send = self.send_lock.lock();
        if self.is_connected() {
            self.link.send(&ClientEvents(self));
        }
    }

    fn run_receive(&self) {
        let _recv = self.recv_lock.lock();
        if !self.is_connected() {
            return;
        }

        let was_blocked = self.link.is_send_blocked();
        let ready = match self
            .link
            .poll(Interest::read_and(was_blocked), self.config.poll_timeout)
        {
            Ok(ready) => ready,
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                error!("[Client] Poll failed: {}", e);
                self.disconnect();
                return;
            }
        };

        if ready.needs_receive() {
            self.link.receive(&ClientEvents(self));
        }
        if was_blocked && !self.link.is_send_blocked() {
            self.handlers.workload.schedule(&self.tasks.send);
        }
    }

    fn run_on_read(&self) {
        while let Some(msg) = self.link.dequeue() {
            if let Some(msg) = self.handler.on_message(self, msg) {
                self.link.pool().release(msg);
            }
        }
    }

    fn run_on_connected(&self) {
        self.handler.on_connected(self);
    }

    fn run_on_connection_failed(&self) {
        let reason = self.last_failure();
        if let Some(reason) = reason {
            self.handler.on_connection_failed(self, &reason);
        }
    }

    fn run_on_disconnected(&self) {
        self.handler.on_disconnected(self);
    }
}

impl<F: Framing, H: ClientHandler<F>> Drop for Client<F, H> {
    fn drop(&mut self) {
        for task in self.tasks.all() {
            self.handlers.workload.cancel(task);
        }
    }
}

impl<F: Framing, H: ClientHandler<F>> std::fmt::Debug for Client<F, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("link", &self.link)
            .finish()
    }
}

/// Routes link notifications into the client state machine.
struct ClientEvents<'a, F: Framing, H: ClientHandler<F>>(&'a Client<F, H>);

impl<F: Framing, H: ClientHandler<F>> ClientEvents<'_, F, H> {
    fn fail(&self, what: &str) {
        error!("[Client] {}", what);
        self.0.disconnect();
    }
}

impl<F: Framing, H: ClientHandler<F>> LinkCallback for ClientEvents<'_, F, H> {
    fn on_send_check_tcp_failed(&self, _msg: &mut Message) {
        debug!("[Client] Outbound message rejected by framing");
    }

    fn on_send_finalize_tcp(&self, msg: &mut Message) {
        self.0.handler.on_send_finalize(self.0, msg);
    }

    fn on_send_error(&self) {
        self.fail("Send error");
    }

    fn on_recv_check_tcp(&self, msg: &mut Message) -> bool {
        self.0.handler.on_recv_check(self.0, msg)
    }

    fn on_recv_handle_tcp(&self, msg: &mut Message) -> bool {
        self.0.handler.on_recv_handle(self.0, msg)
    }

    fn on_recv_new_message(&self) {
        self.0.handlers.message.schedule(&self.0.tasks.on_read);
    }

    fn on_recv_regular_disconnect(&self) {
        info!("[Client] Peer closed the connection");
        self.0.disconnect();
    }

    fn on_recv_error_no_free_tcp_buffer(&self) {
        self.fail("No free TCP buffer");
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
