//! Socket configuration options
//!
//! OS-level options applied to every listening, accepted and connected
//! socket. Buffer and queue sizing live with the link configuration in
//! `pollnet-tcp`.

use std::time::Duration;

/// Default `SO_LINGER` timeout.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(2);

/// Default `listen(2)` backlog.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 16;

/// Socket configuration options.
///
/// # Examples
///
/// ```
/// use pollnet_core::options::SocketOptions;
/// use std::time::Duration;
///
/// let opts = SocketOptions::default()
///     .with_nodelay(false)
///     .with_linger(Some(Duration::from_secs(1)));
/// assert!(!opts.nodelay);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm (TCP_NODELAY)
    ///
    /// - Default: true
    pub nodelay: bool,

    /// Allow rebinding a port in TIME_WAIT (SO_REUSEADDR)
    ///
    /// - Default: true
    pub reuse_address: bool,

    /// Linger on close (SO_LINGER)
    ///
    /// - `None`: close returns immediately
    /// - `Some(duration)`: close waits up to duration for unsent data
    /// - Default: 2 seconds
    pub linger: Option<Duration>,

    /// TCP keep-alive probes (SO_KEEPALIVE)
    ///
    /// - Default: true
    pub keepalive: bool,

    /// Restrict an IPv6 listener to IPv6 peers (IPV6_V6ONLY)
    ///
    /// - Default: false (dual stack, IPv4 peers appear as mapped addresses)
    pub only_v6: bool,

    /// Pending connection backlog for listeners
    ///
    /// - Default: 16
    pub listen_backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            reuse_address: true,
            linger: Some(DEFAULT_LINGER),
            keepalive: true,
            only_v6: false,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

impl SocketOptions {
    /// Create new socket options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    #[must_use]
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    #[must_use]
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }

    #[must_use]
    pub fn with_only_v6(mut self, enabled: bool) -> Self {
        self.only_v6 = enabled;
        self
    }

    /// Set the listen backlog. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = if backlog < 1 { 1 } else { backlog };
        self
    }
}
