/// Pollnet Error Types
///
/// Construction-time errors for listeners, outbound connections, configuration
/// and the task scheduler. Faults on an established connection are reported
/// through callbacks, not through these types.

use std::io;
use thiserror::Error;

/// Reasons a listening socket could not be opened.
#[derive(Error, Debug)]
pub enum ListenError {
    /// The OS refused to create the socket
    #[error("failed to create socket: {0}")]
    FailOnInit(#[source] io::Error),

    /// Switching the socket to non-blocking mode failed
    #[error("failed to set non-blocking mode: {0}")]
    FailOnOptNoBlock(#[source] io::Error),

    /// Toggling `IPV6_V6ONLY` failed
    #[error("failed to set IPV6_V6ONLY: {0}")]
    FailOnOptIp6Only(#[source] io::Error),

    /// `bind(2)` failed
    #[error("failed to bind: {0}")]
    FailOnBind(#[source] io::Error),

    /// `listen(2)` failed
    #[error("failed to listen: {0}")]
    FailOnListen(#[source] io::Error),
}

/// Reasons an outbound connection attempt failed.
///
/// Cloneable so it can be handed to a scheduled notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The socket is still open from a previous connection
    #[error("socket is not closed")]
    NotClosed,

    /// Host or port could not be resolved
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    /// The OS refused to create the socket
    #[error("failed to create socket ({0:?})")]
    FailOnInit(io::ErrorKind),

    /// Switching the socket to non-blocking mode failed
    #[error("failed to set non-blocking mode ({0:?})")]
    FailOnOptNoBlock(io::ErrorKind),

    /// The peer did not answer within the timeout
    #[error("connect timed out")]
    TimeOut,

    /// The connect itself failed (refused, unreachable, ...)
    #[error("connect failed ({0:?})")]
    ConnectError(io::ErrorKind),
}

/// Main error type for pollnet operations
#[derive(Error, Debug)]
pub enum NetError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Listening socket could not be opened
    #[error("listen error: {0}")]
    Listen(#[from] ListenError),

    /// Outbound connection failed
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// A configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Worker threads could not be started
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Result type alias for pollnet operations
pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    /// Create an invalid configuration error with a message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Would-block, interrupted and timed-out conditions. Poll loops retry these
/// on their next run instead of tearing the connection down.
#[must_use]
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Operation would block (`EAGAIN`/`EWOULDBLOCK`, or `EINPROGRESS` on connect).
#[must_use]
pub fn is_would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Socket was already shut down on our side.
#[must_use]
pub fn is_shutdown(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ESHUTDOWN)
}
