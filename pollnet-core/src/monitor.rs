//! Connection event monitoring.
//!
//! Servers and clients can publish lifecycle events (listening, accepted,
//! rejected, closed, connected, failed) on a channel so that operators and
//! tests can observe them without implementing a handler.

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Server is listening on an address.
    Listening(SocketAddr),

    /// Server bound an incoming connection to a session slot.
    Accepted {
        session: usize,
        peer: Option<SocketAddr>,
    },

    /// Server had no free session and dropped an incoming connection.
    Rejected,

    /// A session was torn down and returned to the free stack.
    Closed { session: usize },

    /// Client connection established.
    Connected(SocketAddr),

    /// Client connection attempt failed.
    ConnectFailed { endpoint: String, reason: String },

    /// Client connection torn down.
    Disconnected,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening(addr) => write!(f, "Listening on {addr}"),
            Self::Accepted {
                session,
                peer: Some(peer),
            } => write!(f, "Session {session} accepted connection from {peer}"),
            Self::Accepted { session, peer: None } => {
                write!(f, "Session {session} accepted connection")
            }
            Self::Rejected => write!(f, "Rejected connection, no free session"),
            Self::Closed { session } => write!(f, "Session {session} closed"),
            Self::Connected(addr) => write!(f, "Connected to {addr}"),
            Self::ConnectFailed { endpoint, reason } => {
                write!(f, "Connect failed for {endpoint}: {reason}")
            }
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sending side of a monitor channel.
pub type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

/// Optional monitor slot owned by a server or client.
///
/// Emitting is a no-op until [`MonitorSlot::attach`] is called, and silently
/// detaches once the receiver is dropped.
#[derive(Debug, Default)]
pub struct MonitorSlot {
    sender: Mutex<Option<SocketEventSender>>,
}

impl MonitorSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing monitor with a fresh channel.
    pub fn attach(&self) -> SocketMonitor {
        let (tx, rx) = create_monitor();
        *self.sender.lock() = Some(tx);
        rx
    }

    pub fn emit(&self, event: SocketEvent) {
        let mut sender = self.sender.lock();
        if let Some(tx) = sender.as_ref() {
            if tx.send(event).is_err() {
                *sender = None;
            }
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.sender.lock().is_some()
    }
}
