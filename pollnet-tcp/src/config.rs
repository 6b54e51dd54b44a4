//! Link, server and client configuration
//!
//! Buffer, queue and timing parameters. Every default is exposed as a
//! constant so applications can derive their own values from it.

use pollnet_core::error::{NetError, Result};
use pollnet_core::options::SocketOptions;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Default message buffer capacity (8KB)
///
/// Upper bound for one framed message. Raw-segment links read at most this
/// many bytes per message.
pub const DEFAULT_MESSAGE_SIZE: usize = 8192;

/// Default number of session slots per server.
pub const DEFAULT_MAX_SESSIONS: usize = 256;

/// Pooled buffers per session slot on a server.
pub const SERVER_BUFFERS_PER_SESSION: usize = 16;

/// Default outbound queue capacity per server session.
pub const DEFAULT_SERVER_QUEUE_OUT: usize = 32;

/// Default inbound queue capacity per server session.
pub const DEFAULT_SERVER_QUEUE_IN: usize = 64;

/// Default pooled buffers for a client.
pub const DEFAULT_CLIENT_BUFFER_COUNT: usize = 768;

/// Default outbound queue capacity for a client.
pub const DEFAULT_CLIENT_QUEUE_OUT: usize = 256;

/// Default inbound queue capacity for a client.
pub const DEFAULT_CLIENT_QUEUE_IN: usize = 512;

/// Default pooled buffers for a standalone link.
pub const DEFAULT_LINK_BUFFER_COUNT: usize = 1024;

/// Default queue capacity (each direction) for a standalone link.
pub const DEFAULT_LINK_QUEUE_SIZE: usize = 64;

/// Readiness poll timeout used by accept, multiplex and receive loops.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(16);

/// Sessions with no received bytes for this long are closed.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// A send blocked for this long disconnects the session.
pub const DEFAULT_SEND_STUCK_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default client connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Buffer pool and queue sizing for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Capacity of each pooled buffer
    pub message_size: usize,
    /// Buffers in the pool
    pub buffer_count: usize,
    /// Inbound queue capacity
    pub queue_in: usize,
    /// Outbound queue capacity
    pub queue_out: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            message_size: DEFAULT_MESSAGE_SIZE,
            buffer_count: DEFAULT_LINK_BUFFER_COUNT,
            queue_in: DEFAULT_LINK_QUEUE_SIZE,
            queue_out: DEFAULT_LINK_QUEUE_SIZE,
        }
    }
}

impl LinkConfig {
    /// Sizing used by each server session.
    #[must_use]
    pub const fn server(max_sessions: usize) -> Self {
        Self {
            message_size: DEFAULT_MESSAGE_SIZE,
            buffer_count: max_sessions * SERVER_BUFFERS_PER_SESSION,
            queue_in: DEFAULT_SERVER_QUEUE_IN,
            queue_out: DEFAULT_SERVER_QUEUE_OUT,
        }
    }

    /// Sizing used by a client.
    #[must_use]
    pub const fn client() -> Self {
        Self {
            message_size: DEFAULT_MESSAGE_SIZE,
            buffer_count: DEFAULT_CLIENT_BUFFER_COUNT,
            queue_in: DEFAULT_CLIENT_QUEUE_IN,
            queue_out: DEFAULT_CLIENT_QUEUE_OUT,
        }
    }

    #[must_use]
    pub fn with_message_size(mut self, size: usize) -> Self {
        self.message_size = size;
        self
    }

    #[must_use]
    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    #[must_use]
    pub fn with_queues(mut self, queue_in: usize, queue_out: usize) -> Self {
        self.queue_in = queue_in;
        self.queue_out = queue_out;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_size == 0 {
            return Err(NetError::invalid_config("message_size must be > 0"));
        }
        if self.buffer_count == 0 {
            return Err(NetError::invalid_config("buffer_count must be > 0"));
        }
        if self.queue_in == 0 || self.queue_out == 0 {
            return Err(NetError::invalid_config("queue capacities must be > 0"));
        }
        Ok(())
    }
}

/// Server configuration.
///
/// # Examples
///
/// ```
/// use pollnet_tcp::config::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new(7000)
///     .with_max_sessions(8)
///     .with_receive_timeout(Duration::from_secs(30));
/// assert_eq!(config.link.buffer_count, 8 * 16);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address. Default `[::]:port` (dual stack)
    pub bind: SocketAddr,
    /// Number of pre-allocated session slots
    pub max_sessions: usize,
    /// Pool and queue sizing (the pool is shared by all sessions)
    pub link: LinkConfig,
    /// Timeout of one accept or multiplex poll
    pub poll_timeout: Duration,
    /// Idle receive time after which a session is closed
    pub receive_timeout: Duration,
    /// Time a blocked send may stay blocked before the session is closed
    pub send_stuck_timeout: Duration,
    /// OS socket options
    pub socket: SocketOptions,
}

impl ServerConfig {
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            bind: SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            max_sessions: DEFAULT_MAX_SESSIONS,
            link: LinkConfig::server(DEFAULT_MAX_SESSIONS),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            send_stuck_timeout: DEFAULT_SEND_STUCK_TIMEOUT,
            socket: SocketOptions::default(),
        }
    }

    #[must_use]
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Set the slot count. The pool is resized to 16 buffers per slot.
    #[must_use]
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self.link.buffer_count = max_sessions * SERVER_BUFFERS_PER_SESSION;
        self
    }

    #[must_use]
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_send_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.send_stuck_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(NetError::invalid_config("max_sessions must be > 0"));
        }
        if self.poll_timeout.is_zero() {
            return Err(NetError::invalid_config("poll_timeout must be > 0"));
        }
        self.link.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pool and queue sizing
    pub link: LinkConfig,
    /// Timeout of one receive poll
    pub poll_timeout: Duration,
    /// Connect timeout used by `Client::connect`
    pub connect_timeout: Duration,
    /// OS socket options
    pub socket: SocketOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::client(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket: SocketOptions::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(NetError::invalid_config("poll_timeout must be > 0"));
        }
        self.link.validate()
    }
}
