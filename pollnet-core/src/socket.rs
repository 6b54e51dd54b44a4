//! Non-blocking TCP sockets with readiness queries.
//!
//! [`Transport`] is the narrow surface a link needs: non-blocking send and
//! receive, a readiness poll, shutdown and close. [`TcpSocket`] implements it
//! on top of `socket2`; tests substitute scripted transports.
//!
//! [`TcpListener`] is the accepting side. Listeners default to a dual-stack
//! IPv6 socket so IPv4 peers are accepted as mapped addresses.

use crate::error::{is_would_block, ConnectError, ListenError};
use crate::options::SocketOptions;
use crate::poll::{poll_fd, Interest, Readiness};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, trace};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Byte stream a link drives.
///
/// `send` and `recv` never block: when the OS cannot make progress they
/// return an error of kind `WouldBlock`.
pub trait Transport: Send + Sync {
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for `interest`.
    fn poll(&self, interest: Interest, timeout: Duration) -> io::Result<Readiness>;

    /// Half-close both directions. The descriptor stays valid.
    fn shutdown(&self);

    /// Release the descriptor.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

fn apply_stream_options(socket: &Socket, options: &SocketOptions) {
    if let Err(e) = socket.set_nodelay(options.nodelay) {
        debug!("[TcpSocket] TCP_NODELAY failed: {}", e);
    }
    if let Err(e) = socket.set_linger(options.linger) {
        debug!("[TcpSocket] SO_LINGER failed: {}", e);
    }
    if let Err(e) = socket.set_keepalive(options.keepalive) {
        debug!("[TcpSocket] SO_KEEPALIVE failed: {}", e);
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    if let Err(e) = socket.set_nosigpipe(true) {
        debug!("[TcpSocket] SO_NOSIGPIPE failed: {}", e);
    }
}

/// One TCP connection, or nothing.
///
/// Starts closed. It becomes open through [`TcpSocket::accept_from`] or
/// [`TcpSocket::connect`] and returns to closed with [`Transport::close`],
/// after which it can be reused.
#[derive(Debug, Default)]
pub struct TcpSocket {
    socket: Option<Socket>,
    peer: Option<SocketAddr>,
}

impl TcpSocket {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one pending connection from `listener`.
    ///
    /// Fails with `AlreadyExists` if this socket is still open and with
    /// `WouldBlock` if nothing is pending.
    pub fn accept_from(
        &mut self,
        listener: &TcpListener,
        options: &SocketOptions,
    ) -> io::Result<Option<SocketAddr>> {
        if self.socket.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket still in use",
            ));
        }
        let (socket, peer) = listener.accept()?;
        socket.set_nonblocking(true)?;
        apply_stream_options(&socket, options);
        self.peer = peer;
        self.socket = Some(socket);
        Ok(peer)
    }

    /// Resolve `host:port` and connect, waiting up to `timeout`.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
        options: &SocketOptions,
    ) -> Result<SocketAddr, ConnectError> {
        if self.socket.is_some() {
            return Err(ConnectError::NotClosed);
        }
        let endpoint = || format!("{host}:{port}");
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| ConnectError::InvalidEndpoint(endpoint()))?
            .next()
            .ok_or_else(|| ConnectError::InvalidEndpoint(endpoint()))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ConnectError::FailOnInit(e.kind()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ConnectError::FailOnOptNoBlock(e.kind()))?;
        apply_stream_options(&socket, options);

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if is_would_block(&e) => {
                let ready = poll_fd(socket.as_raw_fd(), Interest::WRITE, timeout)
                    .map_err(|e| ConnectError::ConnectError(e.kind()))?;
                if ready.is_empty() {
                    return Err(ConnectError::TimeOut);
                }
                if let Ok(Some(e)) = socket.take_error() {
                    return Err(ConnectError::ConnectError(e.kind()));
                }
                if ready.is_error() || ready.is_hangup() {
                    return Err(ConnectError::ConnectError(io::ErrorKind::ConnectionRefused));
                }
            }
            Err(e) => return Err(ConnectError::ConnectError(e.kind())),
        }

        trace!("[TcpSocket] Connected to {}", addr);
        self.peer = Some(addr);
        self.socket = Some(socket);
        Ok(addr)
    }
}

impl Transport for TcpSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket
            .as_ref()
            .ok_or_else(not_connected)?
            .send_with_flags(buf, SEND_FLAGS)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.socket.as_ref().ok_or_else(not_connected)?;
        socket.read(buf)
    }

    fn poll(&self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        poll_fd(socket.as_raw_fd(), interest, timeout)
    }

    fn shutdown(&self) {
        if let Some(socket) = &self.socket {
            // ENOTCONN after a peer reset is expected here
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn close(&mut self) {
        self.peer = None;
        // Dropping the socket closes the descriptor
        self.socket = None;
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Non-blocking listening socket.
#[derive(Debug)]
pub struct TcpListener {
    socket: Socket,
    local: SocketAddr,
}

impl TcpListener {
    /// Open, configure, bind and listen.
    ///
    /// For an IPv6 address `IPV6_V6ONLY` follows `options.only_v6`, so the
    /// default `[::]` listener accepts IPv4 peers as well.
    pub fn bind(addr: SocketAddr, options: &SocketOptions) -> Result<Self, ListenError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ListenError::FailOnInit)?;
        socket
            .set_nonblocking(true)
            .map_err(ListenError::FailOnOptNoBlock)?;
        if addr.is_ipv6() {
            socket
                .set_only_v6(options.only_v6)
                .map_err(ListenError::FailOnOptIp6Only)?;
        }
        if let Err(e) = socket.set_reuse_address(options.reuse_address) {
            debug!("[TcpListener] SO_REUSEADDR failed: {}", e);
        }
        if let Err(e) = socket.set_nodelay(options.nodelay) {
            debug!("[TcpListener] TCP_NODELAY failed: {}", e);
        }
        if let Err(e) = socket.set_linger(options.linger) {
            debug!("[TcpListener] SO_LINGER failed: {}", e);
        }

        socket
            .bind(&SockAddr::from(addr))
            .map_err(ListenError::FailOnBind)?;
        socket
            .listen(options.listen_backlog)
            .map_err(ListenError::FailOnListen)?;

        let local = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);
        Ok(Self { socket, local })
    }

    /// Bound address, with the OS-assigned port when bound to port 0.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// True when a connection is waiting to be accepted.
    pub fn poll_accept(&self, timeout: Duration) -> io::Result<bool> {
        let ready = poll_fd(self.socket.as_raw_fd(), Interest::READ, timeout)?;
        Ok(ready.is_readable())
    }

    pub(crate) fn accept(&self) -> io::Result<(Socket, Option<SocketAddr>)> {
        let (socket, addr) = self.socket.accept()?;
        Ok((socket, addr.as_socket()))
    }

    /// Accept one pending connection and drop it immediately.
    pub fn accept_and_close(&self) -> io::Result<Option<SocketAddr>> {
        let (socket, peer) = self.accept()?;
        drop(socket);
        Ok(peer)
    }
}
